use axum::extract::{Json, Path, Query, State};
use std::sync::Arc;
use validator::Validate;

use crate::models::abab::{AbabAnalyzeRequest, AbabAnalyzeResponse, AbabHistoryEntry, AbabHistoryResponse, HistoryQuery};
use crate::utils::{EngineError, EngineResult};
use crate::AppState;

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AbabAnalyzeRequest>,
) -> EngineResult<Json<AbabAnalyzeResponse>> {
    req.validate().map_err(|e| EngineError::invalid_request(e.to_string()))?;
    tracing::info!(user_id = %req.user_id, protocol_id = %req.protocol_id, "ABAB analysis requested");
    let response = state.abab_engine.analyze(&req).await?;
    Ok(Json(response))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> EngineResult<Json<AbabHistoryResponse>> {
    let runs = state
        .run_registry
        .search("ABAB_randomization", &user_id, query.limit, query.offset)
        .await?;
    let total_runs = state.run_registry.count("ABAB_randomization", &user_id).await?;

    let entries = runs
        .into_iter()
        .map(|run| AbabHistoryEntry {
            run_id: run.run_id,
            start_time: run.start_time,
            protocol_id: run.params.get("protocol_id").and_then(|v| v.as_str()).map(str::to_string),
            observed_effect: run.metrics.get("observed_effect").and_then(|v| v.as_f64()),
            p_value: run.metrics.get("p_value").and_then(|v| v.as_f64()),
            cohens_d: run.metrics.get("cohens_d").and_then(|v| v.as_f64()),
            wwc_rating: run.tags.get("wwc_rating").and_then(|v| v.as_str()).map(str::to_string),
            passes_wwc: run.tags.get("passes_wwc").and_then(|v| v.as_str()).map(|s| s == "yes"),
            computation_time: run.metrics.get("computation_time_seconds").and_then(|v| v.as_f64()),
        })
        .collect();

    Ok(Json(AbabHistoryResponse { user_id, total_runs, limit: query.limit, offset: query.offset, runs: entries }))
}
