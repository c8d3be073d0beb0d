use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn ready(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store_ok = sqlx::query("SELECT 1").execute(&state.analytics_pool).await.is_ok();
    Json(json!({ "status": if store_ok { "ready" } else { "degraded" } }))
}
