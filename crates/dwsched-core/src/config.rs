use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{DwschedError, Result};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_SECONDS: u64 = 30;
pub const DEFAULT_MAX_JOBS_PER_CYCLE: u32 = 1;
pub const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";
pub const DEFAULT_HISTORY_LIMIT: u32 = 500;
pub const DEFAULT_LOG_LIMIT: u32 = 1000;

/// Top-level config (dwsched.toml + DWSCHED_* env overrides).
///
/// Nested keys are addressed with a double underscore in the environment,
/// e.g. `DWSCHED_SCHEDULER__POLL_SECONDS=10`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DwschedConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks while the loop is running.
    #[serde(default = "default_poll_seconds")]
    pub poll_seconds: u64,
    /// Upper bound on runs started by a single tick.
    #[serde(default = "default_max_jobs_per_cycle")]
    pub max_jobs_per_cycle: u32,
    /// IANA zone used for daily schedules and for rendering timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Start the loop as soon as the gateway boots.
    #[serde(default)]
    pub autostart: bool,
    /// How long `stop` waits for a tick that is already executing.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// How long shutdown waits for an in-flight pipeline before the process
    /// exits and the pipeline child is killed.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_seconds: default_poll_seconds(),
            max_jobs_per_cycle: default_max_jobs_per_cycle(),
            timezone: default_timezone(),
            autostart: false,
            stop_timeout_secs: default_stop_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// External pipeline command invoked by the gateway's executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_program")]
    pub program: String,
    #[serde(default = "default_pipeline_args")]
    pub args: Vec<String>,
    pub workdir: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            program: default_pipeline_program(),
            args: default_pipeline_args(),
            workdir: None,
        }
    }
}

/// Clamps applied to history and event-log queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_limit")]
    pub max_limit: u32,
    #[serde(default = "default_log_limit")]
    pub max_log_limit: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_limit: default_history_limit(),
            max_log_limit: default_log_limit(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_poll_seconds() -> u64 {
    DEFAULT_POLL_SECONDS
}
fn default_max_jobs_per_cycle() -> u32 {
    DEFAULT_MAX_JOBS_PER_CYCLE
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_stop_timeout_secs() -> u64 {
    10
}
fn default_shutdown_timeout_secs() -> u64 {
    300
}
fn default_pipeline_program() -> String {
    "dw-generate".to_string()
}
fn default_pipeline_args() -> Vec<String> {
    vec!["run".to_string()]
}
fn default_history_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}
fn default_log_limit() -> u32 {
    DEFAULT_LOG_LIMIT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dwsched/scheduler.db", home)
}

impl DwschedConfig {
    /// Load config from a TOML file with DWSCHED_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.dwsched/dwsched.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: DwschedConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DWSCHED_").split("__"))
            .extract()
            .map_err(|e| DwschedError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.poll_seconds == 0 {
            return Err(DwschedError::InvalidValue {
                field: "scheduler.poll_seconds".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.scheduler.max_jobs_per_cycle == 0 {
            return Err(DwschedError::InvalidValue {
                field: "scheduler.max_jobs_per_cycle".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.history.max_limit == 0 || self.history.max_log_limit == 0 {
            return Err(DwschedError::InvalidValue {
                field: "history".into(),
                reason: "limits must be >= 1".into(),
            });
        }
        self.scheduler
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| DwschedError::InvalidTimezone(self.scheduler.timezone.clone()))?;
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.dwsched/dwsched.toml", home)
}
