use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dwsched_core::{PipelineMode, RunOptions};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Defines when a job becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum Schedule {
    /// Repeat every `interval_seconds`.
    Interval { interval_seconds: u64 },

    /// Fire at `daily_time` in the civil timezone.
    ///
    /// With `daily_repeat = false` the job fires once, at `daily_date` +
    /// `daily_time`. With `daily_repeat = true` an optional `daily_date`
    /// marks the first occurrence.
    Daily {
        #[serde(with = "hhmm")]
        daily_time: NaiveTime,
        #[serde(default)]
        daily_date: Option<NaiveDate>,
        #[serde(default = "repeat_default")]
        daily_repeat: bool,
    },
}

fn repeat_default() -> bool {
    true
}

impl Schedule {
    pub fn type_name(&self) -> &'static str {
        match self {
            Schedule::Interval { .. } => "interval",
            Schedule::Daily { .. } => "daily",
        }
    }

    /// True for a daily job that fires exactly once.
    pub fn is_one_shot(&self) -> bool {
        matches!(
            self,
            Schedule::Daily {
                daily_repeat: false,
                ..
            }
        )
    }
}

/// `HH:MM` rendering for daily times.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

/// Outcome of a run, and the `last_status` of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Who started a run: the scheduler (loop, run-once or a job trigger) or
/// a forced ad-hoc execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Scheduler,
    Manual,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Scheduler => write!(f, "scheduler"),
            RunKind::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(RunKind::Scheduler),
            "manual" => Ok(RunKind::Manual),
            other => Err(format!("unknown run kind: {other}")),
        }
    }
}

/// Validated input for [`crate::store::SchedulerStore::upsert_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub mode: PipelineMode,
    #[serde(flatten)]
    pub schedule: Schedule,
    #[serde(flatten)]
    pub options: RunOptions,
    #[serde(default = "repeat_default")]
    pub enabled: bool,
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Unique across the store; the upsert key.
    pub name: String,
    pub mode: PipelineMode,
    #[serde(flatten)]
    pub schedule: Schedule,
    #[serde(flatten)]
    pub options: RunOptions,
    pub enabled: bool,
    /// `None` when disabled or when a one-shot job has already fired.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub kind: RunKind,
    /// `None` for forced runs.
    pub job_id: Option<i64>,
    pub job_name: Option<String>,
    pub mode: PipelineMode,
    #[serde(flatten)]
    pub options: RunOptions,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_text: Option<String>,
    /// Executor payload. Only loaded by single-run lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub timestamp_utc: DateTime<Utc>,
    pub timestamp_civil: String,
    pub event_type: String,
    pub job_id: Option<i64>,
    pub run_id: Option<i64>,
    pub payload: serde_json::Value,
}

/// Identity of whoever holds the guard slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ExecutionIdentity {
    Job { job_id: i64, job_name: String },
    Forced,
}

impl ExecutionIdentity {
    pub fn for_job(job: &Job) -> Self {
        ExecutionIdentity::Job {
            job_id: job.id,
            job_name: job.name.clone(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ExecutionIdentity::Job { job_name, .. } => job_name,
            ExecutionIdentity::Forced => "forced",
        }
    }
}

/// Snapshot of the in-flight execution, as reported by the guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentExecution {
    pub token: Uuid,
    #[serde(flatten)]
    pub identity: ExecutionIdentity,
    pub mode: PipelineMode,
    pub run_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub progress: Option<serde_json::Value>,
}

/// Result of an operation that needs the execution guard.
#[derive(Debug, Clone)]
pub enum Admission<T> {
    Admitted(T),
    /// Another execution holds the guard. Nothing was started or recorded.
    Rejected(Rejection),
}

impl<T> Admission<T> {
    pub fn admitted(self) -> Option<T> {
        match self {
            Admission::Admitted(v) => Some(v),
            Admission::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
    pub current: Option<CurrentExecution>,
}

impl Rejection {
    pub(crate) fn busy(current: Option<CurrentExecution>) -> Self {
        Self {
            reason: "execution in progress".to_string(),
            current,
        }
    }

    pub(crate) fn closed() -> Self {
        Self {
            reason: "scheduler is shutting down".to_string(),
            current: None,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub checked_at: DateTime<Utc>,
    /// Due jobs selected for this tick (already truncated to the batch size).
    pub due_jobs: usize,
    pub executed: Vec<Run>,
    /// Selected jobs left for the next tick because the guard was busy.
    pub skipped_busy: usize,
    /// Selected jobs dropped because an earlier run in the same tick saw
    /// them disabled, deleted or rescheduled.
    #[serde(default)]
    pub skipped_stale: usize,
    /// Per-job failures that did not stop the rest of the batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Loop state as exposed by the status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSnapshot {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub poll_seconds: u64,
    pub max_jobs_per_cycle: u32,
    pub last_cycle: Option<CycleReport>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub busy: bool,
    pub current_task: Option<CurrentExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub scheduler: LoopSnapshot,
    pub execution: ExecutionSnapshot,
    pub server_time_utc: DateTime<Utc>,
    pub server_time_civil: String,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub scheduler_runs: Vec<Run>,
    pub manual_runs: Vec<Run>,
}
