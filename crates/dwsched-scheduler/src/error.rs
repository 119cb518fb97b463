use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// A busy execution guard is deliberately absent: it is an expected outcome,
/// reported through [`crate::types::Admission::Rejected`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job spec or loop parameter failed validation. Nothing was written.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No job matches the given id or name.
    #[error("Job not found: {reference}")]
    JobNotFound { reference: String },

    /// The job is executing right now and cannot be removed.
    #[error("Job is running: {reference}")]
    JobRunning { reference: String },

    /// No run with the given id exists.
    #[error("Run not found: {id}")]
    RunNotFound { id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] dwsched_core::DwschedError),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Validation(_) => "INVALID_REQUEST",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobRunning { .. } => "JOB_RUNNING",
            SchedulerError::RunNotFound { .. } => "RUN_NOT_FOUND",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Core(e) => e.code(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
