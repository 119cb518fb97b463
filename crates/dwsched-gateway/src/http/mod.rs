//! REST handlers. Every error body is `{"error": "...", "code": "..."}`.

pub mod health;
pub mod jobs;
pub mod runs;
pub mod scheduler;

use axum::{body::Bytes, http::StatusCode, Json};
use dwsched_core::DwschedError;
use dwsched_scheduler::{Rejection, SchedulerError};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::error;

pub type ApiError = (StatusCode, Json<Value>);

/// Map a scheduler error to its HTTP status and body.
pub fn api_error(err: SchedulerError) -> ApiError {
    let status = match &err {
        SchedulerError::Validation(_)
        | SchedulerError::Core(DwschedError::InvalidValue { .. })
        | SchedulerError::Core(DwschedError::InvalidTimezone(_)) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } | SchedulerError::RunNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::JobRunning { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(code = err.code(), "request failed: {err}");
    }
    (
        status,
        Json(json!({ "error": err.to_string(), "code": err.code() })),
    )
}

pub fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into(), "code": "INVALID_REQUEST" })),
    )
}

/// 409 for a request refused because another execution holds the guard.
pub fn busy(rejection: Rejection) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "error": rejection.reason,
            "code": "EXECUTION_BUSY",
            "current": rejection.current,
        })),
    )
}

/// Decode an optional JSON body; an empty body yields `T::default()`.
pub fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}
