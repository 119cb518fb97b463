//! Job management and per-job triggers. `{job_ref}` is an id or a name.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use dwsched_scheduler::{Admission, Job, JobRequest, Run, Upserted};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{api_error, busy, parse_body, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "include_disabled_default")]
    pub include_disabled: bool,
}

fn include_disabled_default() -> bool {
    true
}

/// GET /api/jobs?include_disabled=true
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state
        .engine
        .list_jobs(query.include_disabled)
        .map_err(api_error)?;
    Ok(Json(json!({ "jobs": jobs })))
}

/// POST /api/jobs: create, or replace by name.
pub async fn upsert(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Upserted>, ApiError> {
    let req: JobRequest = parse_body(&body)?;
    let spec = req.into_spec(state.engine.zone()).map_err(api_error)?;
    let upserted = state.engine.upsert_job(spec).map_err(api_error)?;
    Ok(Json(upserted))
}

/// DELETE /api/jobs/{job_ref}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(job_ref): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job = state.engine.delete_job(&job_ref).map_err(api_error)?;
    Ok(Json(json!({ "deleted": true, "job": job })))
}

/// POST /api/jobs/{job_ref}/enable
pub async fn enable(
    State(state): State<Arc<AppState>>,
    Path(job_ref): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.engine.enable_job(&job_ref).map(Json).map_err(api_error)
}

/// POST /api/jobs/{job_ref}/disable
pub async fn disable(
    State(state): State<Arc<AppState>>,
    Path(job_ref): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state.engine.disable_job(&job_ref).map(Json).map_err(api_error)
}

/// POST /api/jobs/{job_ref}/trigger
///
/// Runs the job now and waits for it to finish.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(job_ref): Path<String>,
) -> Result<Json<Run>, ApiError> {
    match state.engine.trigger_job(&job_ref).await.map_err(api_error)? {
        Admission::Admitted(run) => Ok(Json(run)),
        Admission::Rejected(rejection) => Err(busy(rejection)),
    }
}
