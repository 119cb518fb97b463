//! `dwsched-scheduler`: job scheduling and single-flight pipeline execution
//! with SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in the `jobs` table. The [`engine::SchedulerEngine`] polls it
//! every `poll_seconds`, picks the earliest-due enabled jobs (at most
//! `max_jobs_per_cycle`) and runs them one by one through the
//! [`executor::PipelineExecutor`]. Every execution, whether started by the
//! loop, by a manual trigger or as a forced ad-hoc run, must first win the
//! [`guard::ExecutionGuard`]; losers are rejected instead of queued.
//!
//! Each execution leaves one row in `runs` and a handful of entries in
//! `event_log`.
//!
//! # Schedule variants
//!
//! | Variant                 | Behaviour                                            |
//! |-------------------------|------------------------------------------------------|
//! | `Interval`              | Every N seconds, realigned forward past "now"        |
//! | `Daily`, repeat         | At HH:MM civil time every day                        |
//! | `Daily`, no repeat      | Once at a civil date + time, then never again        |

pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod guard;
pub mod history;
pub mod manual;
pub mod schedule;
pub mod status;
pub mod store;
pub mod types;

pub use engine::{EngineSettings, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use events::EventKind;
pub use executor::{count_flow_errors, ExecutorError, PipelineExecutor, RunOutcome};
pub use guard::{ExecutionGuard, GuardSlot, ProgressHandle};
pub use manual::JobRequest;
pub use store::{SchedulerStore, UpsertAction, Upserted};
pub use types::{
    Admission, CurrentExecution, CycleReport, EventLogEntry, ExecutionIdentity, ExecutionSnapshot,
    History, Job, JobSpec, LoopSnapshot, Rejection, Run, RunKind, RunStatus, Schedule,
    StatusReport,
};
