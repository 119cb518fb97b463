use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dwsched_core::{config::DwschedConfig, CivilZone, Clock};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    events::{record_event, EventKind},
    executor::{run_pipeline, PipelineExecutor, RunOutcome},
    guard::{ExecutionGuard, GuardSlot},
    store::SchedulerStore,
    types::{Admission, CycleReport, ExecutionIdentity, Job, LoopSnapshot, Run, RunKind, RunStatus},
};

/// Prefix of `error_text` for a run whose completion write failed.
pub(crate) const UNRECORDED_PREFIX: &str = "failed to record completion: ";

/// Consecutive busy cycles after which a deferred backlog is logged.
pub const STARVATION_WARN_CYCLES: u32 = 10;

/// Tunables for [`SchedulerEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_seconds: u64,
    pub max_jobs_per_cycle: u32,
    /// How long `stop_loop` waits for an in-progress tick.
    pub stop_timeout: Duration,
    /// How long `shutdown` waits for an in-flight execution.
    pub shutdown_timeout: Duration,
    pub max_history_limit: u32,
    pub max_log_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DwschedConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &DwschedConfig) -> Self {
        Self {
            poll_seconds: config.scheduler.poll_seconds,
            max_jobs_per_cycle: config.scheduler.max_jobs_per_cycle,
            stop_timeout: Duration::from_secs(config.scheduler.stop_timeout_secs),
            shutdown_timeout: Duration::from_secs(config.scheduler.shutdown_timeout_secs),
            max_history_limit: config.history.max_limit,
            max_log_limit: config.history.max_log_limit,
        }
    }
}

#[derive(Debug)]
struct LoopState {
    running: bool,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    poll_seconds: u64,
    max_jobs_per_cycle: u32,
    last_cycle: Option<CycleReport>,
    last_error: Option<String>,
    busy_streak: u32,
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The scheduling context: store, guard, executor and the polling loop.
///
/// Built once by the composition root and shared behind an `Arc`. The loop
/// starts stopped and the guard starts free.
pub struct SchedulerEngine {
    pub(crate) store: Arc<SchedulerStore>,
    pub(crate) guard: ExecutionGuard,
    pub(crate) executor: Arc<dyn PipelineExecutor>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
    state: Mutex<LoopState>,
    handle: Mutex<Option<LoopHandle>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<SchedulerStore>,
        executor: Arc<dyn PipelineExecutor>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            guard: ExecutionGuard::new(),
            executor,
            clock,
            state: Mutex::new(LoopState {
                running: false,
                started_at: None,
                stopped_at: None,
                poll_seconds: settings.poll_seconds,
                max_jobs_per_cycle: settings.max_jobs_per_cycle,
                last_cycle: None,
                last_error: None,
                busy_streak: 0,
            }),
            handle: Mutex::new(None),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<SchedulerStore> {
        &self.store
    }

    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    pub fn zone(&self) -> &CivilZone {
        self.store.zone()
    }

    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loop_handle(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close runs a crashed process left open. Call once at boot.
    pub fn recover(&self) -> Result<usize> {
        let now = self.clock.now();
        let ids = self.store.recover_interrupted_runs(now)?;
        if !ids.is_empty() {
            record_event(
                &self.store,
                now,
                EventKind::Recovered,
                None,
                None,
                json!({ "run_ids": ids }),
            );
        }
        Ok(ids.len())
    }

    /// Start the polling loop. A no-op when it is already running.
    ///
    /// `poll_seconds` / `max_jobs_per_cycle` override the current values
    /// only when the loop actually starts.
    pub fn start_loop(
        self: &Arc<Self>,
        poll_seconds: Option<u64>,
        max_jobs_per_cycle: Option<u32>,
    ) -> Result<LoopSnapshot> {
        if poll_seconds == Some(0) {
            return Err(SchedulerError::validation("poll_seconds must be >= 1"));
        }
        if max_jobs_per_cycle == Some(0) {
            return Err(SchedulerError::validation("max_jobs_per_cycle must be >= 1"));
        }

        let mut handle = self.loop_handle();
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            debug!("scheduler loop already running");
            return Ok(self.snapshot());
        }

        let now = self.clock.now();
        let (poll, max_jobs) = {
            let mut state = self.state();
            if let Some(p) = poll_seconds {
                state.poll_seconds = p;
            }
            if let Some(m) = max_jobs_per_cycle {
                state.max_jobs_per_cycle = m;
            }
            state.running = true;
            state.started_at = Some(now);
            state.busy_streak = 0;
            (state.poll_seconds, state.max_jobs_per_cycle)
        };

        let (tx, rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.run_loop(rx).await });
        *handle = Some(LoopHandle { shutdown: tx, task });
        drop(handle);

        info!(poll_seconds = poll, max_jobs_per_cycle = max_jobs, "scheduler loop started");
        record_event(
            &self.store,
            now,
            EventKind::LoopStarted,
            None,
            None,
            json!({ "poll_seconds": poll, "max_jobs_per_cycle": max_jobs }),
        );
        Ok(self.snapshot())
    }

    /// Stop the polling loop. A no-op when it is not running.
    ///
    /// A tick already executing is allowed to finish; this waits for it up
    /// to `stop_timeout` and then lets it complete in the background.
    pub async fn stop_loop(&self) -> LoopSnapshot {
        let taken = self.loop_handle().take();
        let Some(LoopHandle { shutdown, mut task }) = taken else {
            debug!("scheduler loop already stopped");
            return self.snapshot();
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.settings.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("scheduler loop task failed: {e}"),
            Err(_) => warn!(
                timeout_secs = self.settings.stop_timeout.as_secs(),
                "tick still executing after stop timeout; it will finish in the background"
            ),
        }

        let now = self.clock.now();
        {
            let mut state = self.state();
            state.running = false;
            state.stopped_at = Some(now);
        }
        info!("scheduler loop stopped");
        record_event(&self.store, now, EventKind::LoopStopped, None, None, json!({}));
        self.snapshot()
    }

    /// Stop the loop, refuse any new execution and wait up to
    /// `shutdown_timeout` for the one in flight. Used at process exit.
    ///
    /// Returns `false` when an execution was still running at the deadline.
    pub async fn shutdown(&self) -> bool {
        self.stop_loop().await;
        self.guard.close();
        let Some(current) = self.guard.current() else {
            return true;
        };

        info!(
            holder = current.identity.label(),
            run_id = ?current.run_id,
            "waiting for in-flight execution before exit"
        );
        match tokio::time::timeout(self.settings.shutdown_timeout, self.guard.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    holder = current.identity.label(),
                    timeout_secs = self.settings.shutdown_timeout.as_secs(),
                    "execution still in flight at shutdown deadline"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// One tick outside the timer, whether or not the loop is running.
    pub async fn run_once(&self, max_jobs: Option<u32>) -> Result<CycleReport> {
        if max_jobs == Some(0) {
            return Err(SchedulerError::validation("max_jobs must be >= 1"));
        }
        let max_jobs = max_jobs.unwrap_or_else(|| self.state().max_jobs_per_cycle);
        let result = self.tick(max_jobs).await;
        self.record_cycle(&result);
        result
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let state = self.state();
        LoopSnapshot {
            running: state.running,
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            poll_seconds: state.poll_seconds,
            max_jobs_per_cycle: state.max_jobs_per_cycle,
            last_cycle: state.last_cycle.clone(),
            last_error: state.last_error.clone(),
        }
    }

    /// Main event loop. Ticks every `poll_seconds` until `shutdown` flips.
    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = self.state().poll_seconds;
        let mut interval = tokio::time::interval(Duration::from_secs(poll));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Outside the select so a stop request never cancels a tick.
            let max_jobs = self.state().max_jobs_per_cycle;
            let result = self.tick(max_jobs).await;
            if let Err(e) = &result {
                error!("scheduler tick error: {e}");
            }
            self.record_cycle(&result);

            if *shutdown.borrow() {
                break;
            }
        }
        debug!("scheduler loop exited");
    }

    /// Run up to `max_jobs` due jobs, earliest first, one at a time.
    ///
    /// The guard is taken per job. When it is busy the rest of the batch is
    /// left due for the next tick. Each job is re-read once its slot is held,
    /// since an earlier run in the batch may have taken hours.
    async fn tick(&self, max_jobs: u32) -> Result<CycleReport> {
        let now = self.clock.now();
        let due = self.store.due_jobs(now, max_jobs)?;
        let mut report = CycleReport {
            checked_at: now,
            due_jobs: due.len(),
            executed: Vec::new(),
            skipped_busy: 0,
            skipped_stale: 0,
            errors: Vec::new(),
        };

        for (idx, queued) in due.iter().enumerate() {
            let slot = match self
                .guard
                .try_acquire(ExecutionIdentity::for_job(queued), queued.mode, now)
            {
                Admission::Admitted(slot) => slot,
                Admission::Rejected(rejection) => {
                    report.skipped_busy = due.len() - idx;
                    debug!(
                        job_id = queued.id,
                        job_name = %queued.name,
                        reason = %rejection.reason,
                        skipped = report.skipped_busy,
                        "guard busy; deferring due jobs"
                    );
                    break;
                }
            };

            let job = match self.store.get_job(queued.id) {
                Ok(job) if still_due(&job, now) => job,
                Ok(_) | Err(SchedulerError::JobNotFound { .. }) => {
                    debug!(job_id = queued.id, job_name = %queued.name, "job changed since selection; skipping");
                    report.skipped_stale += 1;
                    continue;
                }
                Err(e) => {
                    error!(job_id = queued.id, "failed to reload due job: {e}");
                    report.errors.push(format!("job {}: {e}", queued.id));
                    continue;
                }
            };

            match self.execute_job(&job, RunKind::Scheduler, slot, now).await {
                Ok(run) => report.executed.push(run),
                Err(e) => report.errors.push(format!("job {}: {e}", job.id)),
            }
        }

        if report.due_jobs > 0 {
            info!(
                due = report.due_jobs,
                executed = report.executed.len(),
                skipped_busy = report.skipped_busy,
                skipped_stale = report.skipped_stale,
                errors = report.errors.len(),
                "scheduler tick complete"
            );
        }
        Ok(report)
    }

    fn record_cycle(&self, result: &Result<CycleReport>) {
        let mut state = self.state();
        match result {
            Ok(report) => {
                if report.skipped_busy > 0 {
                    state.busy_streak += 1;
                    if state.busy_streak == STARVATION_WARN_CYCLES {
                        warn!(
                            cycles = state.busy_streak,
                            deferred = report.skipped_busy,
                            "due jobs deferred by a busy guard for consecutive cycles"
                        );
                    }
                } else {
                    state.busy_streak = 0;
                }
                state.last_error = report.errors.last().cloned();
                state.last_cycle = Some(report.clone());
            }
            Err(e) => state.last_error = Some(e.to_string()),
        }
    }

    /// Open a run for `job`, execute it and record the outcome.
    ///
    /// `slot` is held until the run and the job row are both written.
    /// `reference` is the instant the next run is computed from.
    pub(crate) async fn execute_job(
        &self,
        job: &Job,
        kind: RunKind,
        slot: GuardSlot,
        reference: DateTime<Utc>,
    ) -> Result<Run> {
        let started_at = self.clock.now();
        let run = match self.store.open_job_run(job, kind, started_at) {
            Ok(run) => run,
            Err(e) => {
                error!(job_id = job.id, job_name = %job.name, "failed to open run: {e}");
                record_event(
                    &self.store,
                    started_at,
                    EventKind::Error,
                    Some(job.id),
                    None,
                    json!({ "job_name": job.name, "error_text": e.to_string() }),
                );
                return Err(e);
            }
        };
        slot.attach_run(run.id);
        info!(run_id = run.id, job_id = job.id, job_name = %job.name, mode = %job.mode, %kind, "job run started");
        record_event(
            &self.store,
            started_at,
            EventKind::Started,
            Some(job.id),
            Some(run.id),
            json!({
                "job_name": job.name,
                "mode": job.mode,
                "kind": kind,
                "options": job.options,
            }),
        );

        let progress = slot.progress_handle(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Some(job.id),
            run.id,
        );
        let outcome = run_pipeline(
            Arc::clone(&self.executor),
            job.mode,
            job.options.clone(),
            progress,
        )
        .await;

        let finished_at = self.clock.now();
        let finished = self
            .store
            .finish_job_run(run.id, job.id, &outcome, finished_at, reference);
        if let Err(e) = &finished {
            error!(run_id = run.id, job_id = job.id, "failed to record run completion: {e}");
            self.abandon(run.id, Some(job.id), e, finished_at);
        }
        self.record_finish(Some(job.id), run.id, &outcome, started_at, finished_at);
        drop(slot);
        finished
    }

    /// Finish a forced run on the task that owns its slot.
    pub(crate) async fn complete_forced(&self, slot: GuardSlot, run: Run) {
        let progress = slot.progress_handle(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            None,
            run.id,
        );
        let outcome = run_pipeline(
            Arc::clone(&self.executor),
            run.mode,
            run.options.clone(),
            progress,
        )
        .await;

        let finished_at = self.clock.now();
        if let Err(e) = self.store.finish_forced_run(run.id, &outcome, finished_at) {
            error!(run_id = run.id, "failed to record forced run completion: {e}");
            self.abandon(run.id, None, &e, finished_at);
        }
        self.record_finish(None, run.id, &outcome, run.started_at, finished_at);
        drop(slot);
    }

    /// Second, narrower write after a failed completion so neither the run
    /// nor its job stays `running` until the next boot.
    fn abandon(
        &self,
        run_id: i64,
        job_id: Option<i64>,
        cause: &SchedulerError,
        finished_at: DateTime<Utc>,
    ) {
        let text = format!("{UNRECORDED_PREFIX}{cause}");
        if let Err(e) = self.store.abandon_run(run_id, job_id, &text, finished_at) {
            error!(run_id, ?job_id, "failed to close unrecorded run: {e}");
        }
    }

    fn record_finish(
        &self,
        job_id: Option<i64>,
        run_id: i64,
        outcome: &RunOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        let kind = match outcome.status {
            RunStatus::Success => EventKind::Finished,
            _ => EventKind::Error,
        };
        if let Some(err) = &outcome.error_text {
            warn!(run_id, ?job_id, "run failed: {err}");
        }
        record_event(
            &self.store,
            finished_at,
            kind,
            job_id,
            Some(run_id),
            json!({
                "status": outcome.status,
                "error_text": outcome.error_text,
                "duration_seconds": (finished_at - started_at).num_seconds(),
            }),
        );
    }
}

/// Enabled, scheduled and not pushed past `now` by an edit.
fn still_due(job: &Job, now: DateTime<Utc>) -> bool {
    job.enabled && job.next_run_at.is_some_and(|at| at <= now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use dwsched_core::{parse_instant, ManualClock, PipelineMode, RunOptions};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    use crate::{
        executor::ExecutorError,
        guard::ProgressHandle,
        types::{JobSpec, Schedule},
    };

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PipelineExecutor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(
            &self,
            _mode: PipelineMode,
            _options: &RunOptions,
            progress: &ProgressHandle,
        ) -> std::result::Result<Value, ExecutorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            progress.report(json!({ "call": n }));
            Ok(json!({ "call": n }))
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl PipelineExecutor for AlwaysFail {
        fn name(&self) -> &str {
            "always-fail"
        }

        async fn execute(
            &self,
            _mode: PipelineMode,
            _options: &RunOptions,
            _progress: &ProgressHandle,
        ) -> std::result::Result<Value, ExecutorError> {
            Err(ExecutorError::Failed("source unavailable".into()))
        }
    }

    fn t(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    /// Runs `action` against the store during its first execution, the way
    /// an operator editing jobs mid-batch would.
    struct Meddling {
        store: Arc<SchedulerStore>,
        action: fn(&SchedulerStore),
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PipelineExecutor for Meddling {
        fn name(&self) -> &str {
            "meddling"
        }

        async fn execute(
            &self,
            _mode: PipelineMode,
            _options: &RunOptions,
            _progress: &ProgressHandle,
        ) -> std::result::Result<Value, ExecutorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                (self.action)(&self.store);
            }
            Ok(json!({}))
        }
    }

    /// Blocks until released.
    #[derive(Default)]
    struct Gate {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl PipelineExecutor for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn execute(
            &self,
            _mode: PipelineMode,
            _options: &RunOptions,
            _progress: &ProgressHandle,
        ) -> std::result::Result<Value, ExecutorError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(json!({ "released": true }))
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            poll_seconds: 1,
            max_jobs_per_cycle: 1,
            stop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_history_limit: 500,
            max_log_limit: 1000,
        }
    }

    fn store() -> Arc<SchedulerStore> {
        let zone = CivilZone::from_name("America/Sao_Paulo").unwrap();
        Arc::new(SchedulerStore::in_memory(zone).unwrap())
    }

    fn engine_with(
        executor: Arc<dyn PipelineExecutor>,
        start: &str,
    ) -> (Arc<SchedulerEngine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t(start)));
        let engine = SchedulerEngine::new(store(), executor, clock.clone(), settings());
        (Arc::new(engine), clock)
    }

    /// Engine whose executor runs `action` during the first job of a batch.
    /// Jobs `a` (every 60s) and `b` (every 120s) are both due.
    fn meddled_batch(action: fn(&SchedulerStore)) -> (Arc<SchedulerEngine>, Arc<Meddling>) {
        let store = store();
        let clock = Arc::new(ManualClock::new(t("2026-01-01T00:00:00Z")));
        store.upsert_job(interval_job("a", 60), clock.now()).unwrap();
        store.upsert_job(interval_job("b", 120), clock.now()).unwrap();
        clock.advance(ChronoDuration::seconds(600));

        let exec = Arc::new(Meddling {
            store: Arc::clone(&store),
            action,
            calls: AtomicUsize::new(0),
        });
        let engine = SchedulerEngine::new(store, exec.clone(), clock, settings());
        (Arc::new(engine), exec)
    }

    fn interval_job(name: &str, secs: u64) -> JobSpec {
        JobSpec {
            name: name.into(),
            mode: PipelineMode::Incremental,
            schedule: Schedule::Interval {
                interval_seconds: secs,
            },
            options: RunOptions::default(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn tick_runs_due_job_and_advances() {
        let exec = Arc::new(Counting::default());
        let (engine, clock) = engine_with(exec.clone(), "2026-01-01T00:00:00Z");
        let job = engine
            .store()
            .upsert_job(interval_job("every-30m", 1800), clock.now())
            .unwrap()
            .job;

        let idle = engine.run_once(None).await.unwrap();
        assert_eq!(idle.due_jobs, 0);
        assert!(idle.executed.is_empty());

        clock.advance(ChronoDuration::seconds(1800));
        let report = engine.run_once(None).await.unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].status, RunStatus::Success);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        let job = engine.store().get_job(job.id).unwrap();
        assert_eq!(job.next_run_at, Some(t("2026-01-01T01:00:00Z")));
        assert!(!engine.guard().is_busy());

        let kinds: Vec<_> = engine
            .store()
            .recent_events(10)
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec!["finished", "progress", "started"]);
    }

    #[tokio::test]
    async fn failed_run_is_recorded_and_job_still_advances() {
        let (engine, clock) = engine_with(Arc::new(AlwaysFail), "2026-01-01T00:00:00Z");
        let job = engine
            .store()
            .upsert_job(interval_job("flaky", 600), clock.now())
            .unwrap()
            .job;
        clock.advance(ChronoDuration::seconds(600));

        let report = engine.run_once(None).await.unwrap();
        let run = &report.executed[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_text.as_deref(), Some("pipeline failed: source unavailable"));

        let job = engine.store().get_job(job.id).unwrap();
        assert_eq!(job.last_status, Some(RunStatus::Failed));
        assert_eq!(job.next_run_at, Some(t("2026-01-01T00:20:00Z")));
        assert!(!engine.guard().is_busy());
    }

    #[tokio::test]
    async fn busy_guard_defers_the_batch() {
        let (engine, clock) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        engine
            .store()
            .upsert_job(interval_job("a", 60), clock.now())
            .unwrap();
        clock.advance(ChronoDuration::seconds(120));

        let held = engine
            .guard()
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, clock.now())
            .admitted()
            .unwrap();
        let report = engine.run_once(None).await.unwrap();
        assert_eq!(report.due_jobs, 1);
        assert_eq!(report.skipped_busy, 1);
        assert!(report.executed.is_empty());
        // Still due; nothing was marked failed.
        assert_eq!(engine.store().due_jobs(clock.now(), 10).unwrap().len(), 1);

        drop(held);
        let report = engine.run_once(None).await.unwrap();
        assert_eq!(report.executed.len(), 1);
    }

    #[tokio::test]
    async fn busy_streak_resets_after_a_clear_cycle() {
        let (engine, clock) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        engine
            .store()
            .upsert_job(interval_job("a", 60), clock.now())
            .unwrap();
        clock.advance(ChronoDuration::seconds(60));

        let held = engine
            .guard()
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, clock.now())
            .admitted()
            .unwrap();
        for _ in 0..STARVATION_WARN_CYCLES {
            engine.run_once(None).await.unwrap();
        }
        assert_eq!(engine.state().busy_streak, STARVATION_WARN_CYCLES);

        drop(held);
        engine.run_once(None).await.unwrap();
        assert_eq!(engine.state().busy_streak, 0);
    }

    #[tokio::test]
    async fn run_once_rejects_zero_batch() {
        let (engine, _) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        assert!(matches!(
            engine.run_once(Some(0)).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (engine, _) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");

        let stopped = engine.stop_loop().await;
        assert!(!stopped.running);

        let started = engine.start_loop(Some(5), Some(2)).unwrap();
        assert!(started.running);
        assert_eq!(started.poll_seconds, 5);
        assert_eq!(started.max_jobs_per_cycle, 2);

        // Second start keeps the running configuration.
        let again = engine.start_loop(Some(60), None).unwrap();
        assert!(again.running);
        assert_eq!(again.poll_seconds, 5);

        let stopped = engine.stop_loop().await;
        assert!(!stopped.running);
        assert!(stopped.stopped_at.is_some());
        assert!(!engine.stop_loop().await.running);
    }

    #[tokio::test]
    async fn loop_executes_due_jobs_on_its_own() {
        let exec = Arc::new(Counting::default());
        let (engine, clock) = engine_with(exec.clone(), "2026-01-01T00:00:00Z");
        engine
            .store()
            .upsert_job(interval_job("a", 60), clock.now())
            .unwrap();
        clock.advance(ChronoDuration::seconds(60));

        engine.start_loop(None, None).unwrap();
        for _ in 0..50 {
            if exec.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.stop_loop().await;
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(engine.snapshot().last_cycle.is_some());
    }

    #[tokio::test]
    async fn start_rejects_zero_poll() {
        let (engine, _) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        assert!(engine.start_loop(Some(0), None).is_err());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn shutdown_closes_the_guard() {
        let (engine, clock) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        engine.start_loop(None, None).unwrap();
        engine.shutdown().await;
        assert!(!engine.is_running());
        assert!(engine
            .guard()
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, clock.now())
            .is_rejected());
    }

    #[tokio::test]
    async fn recover_reports_orphans_once() {
        let (engine, clock) = engine_with(Arc::new(Counting::default()), "2026-01-01T00:00:00Z");
        engine
            .store()
            .open_forced_run(PipelineMode::Full, &RunOptions::default(), clock.now())
            .unwrap();
        assert_eq!(engine.recover().unwrap(), 1);
        assert_eq!(engine.recover().unwrap(), 0);
        assert_eq!(engine.store().recent_events(5).unwrap()[0].event_type, "recovered");
    }

    #[tokio::test]
    async fn job_disabled_mid_batch_is_not_run() {
        let (engine, exec) = meddled_batch(|store| {
            store
                .set_enabled("b", false, t("2026-01-01T00:10:00Z"))
                .unwrap();
        });

        let report = engine.run_once(Some(2)).await.unwrap();
        assert_eq!(report.due_jobs, 2);
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].job_name.as_deref(), Some("a"));
        assert_eq!(report.skipped_stale, 1);
        assert!(report.errors.is_empty());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);

        let b = engine.store().find_job("b").unwrap();
        assert!(!b.enabled);
        assert_eq!(b.last_run_at, None);
        assert_eq!(b.last_status, None);
    }

    #[tokio::test]
    async fn job_deleted_mid_batch_does_not_fail_the_tick() {
        let (engine, exec) = meddled_batch(|store| {
            store.delete_job("b").unwrap();
        });

        let report = engine.run_once(Some(2)).await.unwrap();
        assert_eq!(report.executed.len(), 1);
        assert_eq!(report.executed[0].status, RunStatus::Success);
        assert_eq!(report.skipped_stale, 1);
        assert!(report.errors.is_empty());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(engine.snapshot().last_error.is_none());

        let runs = engine.store().recent_runs(RunKind::Scheduler, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn failed_completion_write_still_closes_the_run() {
        // An undecodable job row makes the completion transaction fail.
        let (engine, _exec) = meddled_batch(|store| {
            store
                .conn()
                .execute("UPDATE jobs SET interval_seconds = NULL WHERE name = 'a'", [])
                .unwrap();
        });

        let report = engine.run_once(Some(1)).await.unwrap();
        assert!(report.executed.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(engine.snapshot().last_error.is_some());
        assert!(!engine.guard().is_busy());

        let runs = engine.store().recent_runs(RunKind::Scheduler, 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].finished_at.is_some());
        assert!(runs[0]
            .error_text
            .as_deref()
            .unwrap()
            .starts_with(UNRECORDED_PREFIX));

        let last_status: String = engine
            .store()
            .conn()
            .query_row("SELECT last_status FROM jobs WHERE name = 'a'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(last_status, "failed");
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_forced_run() {
        let gate = Arc::new(Gate::default());
        let (engine, _clock) = engine_with(gate.clone(), "2026-01-01T00:00:00Z");
        let run = engine
            .force_execute(PipelineMode::Full, RunOptions::default())
            .unwrap()
            .admitted()
            .unwrap();
        gate.started.notified().await;

        let stopping = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        gate.release.notify_one();
        assert!(stopping.await.unwrap());
        assert!(!engine.guard().is_busy());
        assert_eq!(engine.get_run(run.id).unwrap().status, RunStatus::Success);
    }

    #[tokio::test]
    async fn shutdown_gives_up_at_its_deadline() {
        let gate = Arc::new(Gate::default());
        let clock = Arc::new(ManualClock::new(t("2026-01-01T00:00:00Z")));
        let engine = Arc::new(SchedulerEngine::new(
            store(),
            gate.clone(),
            clock,
            EngineSettings {
                shutdown_timeout: Duration::from_millis(50),
                ..settings()
            },
        ));
        engine
            .force_execute(PipelineMode::Full, RunOptions::default())
            .unwrap()
            .admitted()
            .unwrap();
        gate.started.notified().await;

        assert!(!engine.shutdown().await);
        assert!(engine.guard().is_busy());
        gate.release.notify_one();
    }
}
