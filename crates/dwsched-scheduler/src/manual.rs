//! Operations invoked from outside the loop: job management, triggering a
//! single job and forced ad-hoc execution.

use std::sync::Arc;

use dwsched_core::{CivilZone, PipelineMode, RunOptions};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    engine::SchedulerEngine,
    error::{Result, SchedulerError},
    events::{record_event, EventKind},
    schedule::{interval_from_unit, parse_daily_at},
    store::Upserted,
    types::{Admission, ExecutionIdentity, Job, JobSpec, Run, RunKind, Schedule},
};

/// Job definition as submitted by API clients.
///
/// Accepts the friendlier input forms (`daily_at`, `interval_value` +
/// `interval_unit`) and turns them into a [`JobSpec`].
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub mode: String,
    pub schedule_type: String,
    pub interval_seconds: Option<u64>,
    pub interval_value: Option<u64>,
    pub interval_unit: Option<String>,
    pub daily_at: Option<String>,
    pub daily_repeat: Option<bool>,
    #[serde(flatten)]
    pub options: RunOptions,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl JobRequest {
    pub fn into_spec(self, zone: &CivilZone) -> Result<JobSpec> {
        let mode: PipelineMode = self.mode.parse().map_err(SchedulerError::Validation)?;
        let schedule = match self.schedule_type.trim().to_ascii_lowercase().as_str() {
            "interval" => {
                let interval_seconds = match (self.interval_seconds, self.interval_value) {
                    (Some(secs), None) => secs,
                    (None, Some(value)) => {
                        let unit = self.interval_unit.as_deref().unwrap_or("minutes");
                        interval_from_unit(value, unit)?
                    }
                    (Some(_), Some(_)) => {
                        return Err(SchedulerError::validation(
                            "give either interval_seconds or interval_value, not both",
                        ))
                    }
                    (None, None) => {
                        return Err(SchedulerError::validation(
                            "interval schedules need interval_seconds or interval_value",
                        ))
                    }
                };
                Schedule::Interval { interval_seconds }
            }
            "daily" => {
                let raw = self
                    .daily_at
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| SchedulerError::validation("daily schedules need daily_at"))?;
                let (daily_time, daily_date) = parse_daily_at(raw, zone)?;
                Schedule::Daily {
                    daily_time,
                    daily_date,
                    daily_repeat: self.daily_repeat.unwrap_or(true),
                }
            }
            other => {
                return Err(SchedulerError::validation(format!(
                    "schedule_type must be 'interval' or 'daily', got '{other}'"
                )))
            }
        };

        Ok(JobSpec {
            name: self.name,
            mode,
            schedule,
            options: self.options,
            enabled: self.enabled,
        })
    }
}

impl SchedulerEngine {
    pub fn upsert_job(&self, spec: JobSpec) -> Result<Upserted> {
        self.store.upsert_job(spec, self.clock.now())
    }

    pub fn list_jobs(&self, include_disabled: bool) -> Result<Vec<Job>> {
        self.store.list_jobs(include_disabled)
    }

    pub fn enable_job(&self, reference: &str) -> Result<Job> {
        self.store.set_enabled(reference, true, self.clock.now())
    }

    pub fn disable_job(&self, reference: &str) -> Result<Job> {
        self.store.set_enabled(reference, false, self.clock.now())
    }

    /// Delete a job and its history. Refused while the job is executing.
    pub fn delete_job(&self, reference: &str) -> Result<Job> {
        let job = self.store.find_job(reference)?;
        let executing = self.guard.current().is_some_and(|c| {
            matches!(c.identity, ExecutionIdentity::Job { job_id, .. } if job_id == job.id)
        });
        if executing {
            return Err(SchedulerError::JobRunning {
                reference: reference.to_string(),
            });
        }
        self.store.delete_job(&job.id.to_string())
    }

    /// Run one job now, ignoring its `next_run_at` and `enabled` flag.
    ///
    /// Returns the finished run, or a rejection when another execution holds
    /// the guard.
    pub async fn trigger_job(&self, reference: &str) -> Result<Admission<Run>> {
        let job = self.store.find_job(reference)?;
        let now = self.clock.now();
        let slot = match self
            .guard
            .try_acquire(ExecutionIdentity::for_job(&job), job.mode, now)
        {
            Admission::Admitted(slot) => slot,
            Admission::Rejected(rejection) => {
                info!(job_id = job.id, job_name = %job.name, "trigger rejected: {}", rejection.reason);
                return Ok(Admission::Rejected(rejection));
            }
        };
        // Re-read under the slot; the job may have been deleted or edited
        // while the guard was being taken.
        let job = self.store.get_job(job.id)?;
        let run = self.execute_job(&job, RunKind::Scheduler, slot, now).await?;
        Ok(Admission::Admitted(run))
    }

    /// Start an ad-hoc pipeline run not tied to any job.
    ///
    /// Returns as soon as the run is open (status `running`); the pipeline
    /// continues on a background task that owns the guard slot.
    pub fn force_execute(
        self: &Arc<Self>,
        mode: PipelineMode,
        options: RunOptions,
    ) -> Result<Admission<Run>> {
        if options.rows_override == Some(0) {
            return Err(SchedulerError::validation("rows_override must be >= 1"));
        }
        let now = self.clock.now();
        let slot = match self.guard.try_acquire(ExecutionIdentity::Forced, mode, now) {
            Admission::Admitted(slot) => slot,
            Admission::Rejected(rejection) => {
                info!(%mode, "forced execution rejected: {}", rejection.reason);
                return Ok(Admission::Rejected(rejection));
            }
        };

        let run = self.store.open_forced_run(mode, &options, now)?;
        slot.attach_run(run.id);
        info!(run_id = run.id, %mode, "forced execution started");
        record_event(
            &self.store,
            now,
            EventKind::Started,
            None,
            Some(run.id),
            json!({ "mode": mode, "kind": RunKind::Manual, "options": options }),
        );

        let engine = Arc::clone(self);
        let opened = run.clone();
        tokio::spawn(async move { engine.complete_forced(slot, opened).await });
        Ok(Admission::Admitted(run))
    }
}
