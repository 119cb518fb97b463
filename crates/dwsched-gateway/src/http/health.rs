use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /api/health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let now = state.engine.get_status().server_time_utc;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time_utc": now,
        "timezone": state.config.scheduler.timezone,
        "scheduler_running": state.engine.is_running(),
    }))
}
