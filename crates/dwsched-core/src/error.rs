use thiserror::Error;

#[derive(Debug, Error)]
pub enum DwschedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl DwschedError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DwschedError::Config(_) => "CONFIG_ERROR",
            DwschedError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            DwschedError::InvalidValue { .. } => "INVALID_VALUE",
        }
    }
}

pub type Result<T> = std::result::Result<T, DwschedError>;
