use axum::extract::{Json, Path, Query, State};
use std::sync::Arc;
use validator::Validate;

use crate::models::its::{HistoryQuery, ItsAnalyzeRequest, ItsAnalyzeResponse, ItsHistoryEntry, ItsHistoryResponse};
use crate::utils::{EngineError, EngineResult};
use crate::AppState;

pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ItsAnalyzeRequest>,
) -> EngineResult<Json<ItsAnalyzeResponse>> {
    req.validate().map_err(|e| EngineError::invalid_request(e.to_string()))?;
    tracing::info!(user_id = %req.user_id, "ITS analysis requested");
    let response = state.its_engine.analyze(&req).await?;
    Ok(Json(response))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> EngineResult<Json<ItsHistoryResponse>> {
    let runs = state
        .run_registry
        .search("ITS", &user_id, query.limit, query.offset)
        .await?;
    let total_runs = state.run_registry.count("ITS", &user_id).await?;

    let entries = runs
        .into_iter()
        .map(|run| ItsHistoryEntry {
            run_id: run.run_id,
            start_time: run.start_time,
            intervention_date: run
                .params
                .get("intervention_date")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            immediate_effect: run.metrics.get("immediate_effect").and_then(|v| v.as_f64()),
            sustained_effect: run.metrics.get("sustained_effect").and_then(|v| v.as_f64()),
            counterfactual_effect: run.metrics.get("counterfactual_effect").and_then(|v| v.as_f64()),
            probability_of_benefit: run.metrics.get("probability_of_benefit").and_then(|v| v.as_f64()),
            max_rhat: run.metrics.get("max_rhat").and_then(|v| v.as_f64()),
            converged: run.tags.get("converged").and_then(|v| v.as_str()).map(|s| s == "yes"),
            computation_time: run.metrics.get("computation_time_seconds").and_then(|v| v.as_f64()),
            n_observations_pre: run.metrics.get("n_observations_pre").and_then(|v| v.as_i64()),
            n_observations_post: run.metrics.get("n_observations_post").and_then(|v| v.as_i64()),
        })
        .collect();

    Ok(Json(ItsHistoryResponse { user_id, total_runs, limit: query.limit, offset: query.offset, runs: entries }))
}
