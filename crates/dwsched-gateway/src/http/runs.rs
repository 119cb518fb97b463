//! Forced executions, run lookup, history and the event log.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use dwsched_core::{PipelineMode, RunOptions};
use dwsched_scheduler::{Admission, History, Run};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{api_error, bad_request, busy, optional_body, ApiError};
use crate::app::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 30;
const DEFAULT_LOG_LIMIT: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

/// POST /api/execute/{mode}
///
/// Starts an ad-hoc run and answers before it finishes.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let mode: PipelineMode = mode.parse().map_err(bad_request)?;
    let options: RunOptions = optional_body(&body)?;
    match state
        .engine
        .force_execute(mode, options)
        .map_err(api_error)?
    {
        Admission::Admitted(run) => Ok((StatusCode::ACCEPTED, Json(run))),
        Admission::Rejected(rejection) => Err(busy(rejection)),
    }
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Run>, ApiError> {
    state.engine.get_run(id).map(Json).map_err(api_error)
}

/// GET /api/history?limit=30
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<History>, ApiError> {
    state
        .engine
        .get_history(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .map(Json)
        .map_err(api_error)
}

/// GET /api/logs?limit=100
pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let logs = state
        .engine
        .get_logs(query.limit.unwrap_or(DEFAULT_LOG_LIMIT))
        .map_err(api_error)?;
    Ok(Json(json!({ "logs": logs })))
}
