use axum::{
    routing::{delete, get, post},
    Router,
};
use dwsched_core::DwschedConfig;
use dwsched_scheduler::SchedulerEngine;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::http::{health, jobs, runs, scheduler};

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub config: DwschedConfig,
    pub engine: Arc<SchedulerEngine>,
}

impl AppState {
    pub fn new(config: DwschedConfig, engine: Arc<SchedulerEngine>) -> Self {
        Self { config, engine }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health::health_handler))
        .route("/api/status", get(scheduler::status))
        .route("/api/scheduler/start", post(scheduler::start))
        .route("/api/scheduler/stop", post(scheduler::stop))
        .route("/api/scheduler/run-once", post(scheduler::run_once))
        .route("/api/jobs", get(jobs::list).post(jobs::upsert))
        .route("/api/jobs/{job_ref}", delete(jobs::delete))
        .route("/api/jobs/{job_ref}/enable", post(jobs::enable))
        .route("/api/jobs/{job_ref}/disable", post(jobs::disable))
        .route("/api/jobs/{job_ref}/trigger", post(jobs::trigger))
        .route("/api/execute/{mode}", post(runs::execute))
        .route("/api/runs/{id}", get(runs::get_run))
        .route("/api/history", get(runs::history))
        .route("/api/logs", get(runs::logs))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
