//! Loop control: status, start, stop and a single manual tick.

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use dwsched_scheduler::{CycleReport, LoopSnapshot, StatusReport};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::{api_error, optional_body, ApiError};
use crate::app::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub poll_seconds: Option<u64>,
    pub max_jobs_per_cycle: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RunOnceQuery {
    pub max_jobs: Option<u32>,
}

/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.engine.get_status())
}

/// POST /api/scheduler/start (body optional)
pub async fn start(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<LoopSnapshot>, ApiError> {
    let req: StartRequest = optional_body(&body)?;
    let snapshot = state
        .engine
        .start_loop(req.poll_seconds, req.max_jobs_per_cycle)
        .map_err(api_error)?;
    Ok(Json(snapshot))
}

/// POST /api/scheduler/stop
pub async fn stop(State(state): State<Arc<AppState>>) -> Json<LoopSnapshot> {
    Json(state.engine.stop_loop().await)
}

/// POST /api/scheduler/run-once?max_jobs=N
pub async fn run_once(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunOnceQuery>,
) -> Result<Json<CycleReport>, ApiError> {
    let report = state
        .engine
        .run_once(query.max_jobs)
        .await
        .map_err(api_error)?;
    info!(
        due = report.due_jobs,
        executed = report.executed.len(),
        "manual run-once complete"
    );
    Ok(Json(report))
}
