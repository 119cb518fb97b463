use crate::{
    engine::SchedulerEngine,
    error::Result,
    types::{EventLogEntry, ExecutionSnapshot, History, Run, RunKind, StatusReport},
};

impl SchedulerEngine {
    /// Loop state, the in-flight execution and the current time. Never
    /// blocks on a running pipeline.
    pub fn get_status(&self) -> StatusReport {
        let now = self.clock.now();
        let current_task = self.guard.current();
        StatusReport {
            scheduler: self.snapshot(),
            execution: ExecutionSnapshot {
                busy: current_task.is_some(),
                current_task,
            },
            server_time_utc: now,
            server_time_civil: self.zone().render(now),
            timezone: self.zone().name().to_string(),
        }
    }

    /// Most recent scheduler and manual runs, `limit` of each.
    pub fn get_history(&self, limit: u32) -> Result<History> {
        let limit = limit.clamp(1, self.settings.max_history_limit);
        Ok(History {
            scheduler_runs: self.store.recent_runs(RunKind::Scheduler, limit)?,
            manual_runs: self.store.recent_runs(RunKind::Manual, limit)?,
        })
    }

    /// Most recent event-log entries, newest first.
    pub fn get_logs(&self, limit: u32) -> Result<Vec<EventLogEntry>> {
        self.store
            .recent_events(limit.clamp(1, self.settings.max_log_limit))
    }

    pub fn get_run(&self, id: i64) -> Result<Run> {
        self.store.get_run(id)
    }
}
