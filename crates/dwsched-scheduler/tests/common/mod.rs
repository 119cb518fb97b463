#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dwsched_core::{parse_instant, CivilZone, ManualClock, PipelineMode, RunOptions};
use dwsched_scheduler::{
    EngineSettings, ExecutorError, JobSpec, PipelineExecutor, ProgressHandle, Run, RunStatus,
    Schedule, SchedulerEngine, SchedulerStore,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

pub fn t(s: &str) -> DateTime<Utc> {
    parse_instant(s).unwrap()
}

/// Succeeds immediately and counts calls.
#[derive(Default)]
pub struct Immediate {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PipelineExecutor for Immediate {
    fn name(&self) -> &str {
        "immediate"
    }

    async fn execute(
        &self,
        mode: PipelineMode,
        _options: &RunOptions,
        _progress: &ProgressHandle,
    ) -> Result<Value, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "mode": mode }))
    }
}

/// Blocks inside `execute` until released, so a test can observe an
/// execution in flight.
#[derive(Default)]
pub struct Gated {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl PipelineExecutor for Gated {
    fn name(&self) -> &str {
        "gated"
    }

    async fn execute(
        &self,
        _mode: PipelineMode,
        _options: &RunOptions,
        progress: &ProgressHandle,
    ) -> Result<Value, ExecutorError> {
        self.started.notify_one();
        progress.report(json!({ "stage": "waiting" }));
        self.release.notified().await;
        Ok(json!({ "gated": true }))
    }
}

pub struct Harness {
    pub engine: Arc<SchedulerEngine>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(executor: Arc<dyn PipelineExecutor>, start: &str, max_jobs: u32) -> Harness {
    let zone = CivilZone::from_name("America/Sao_Paulo").unwrap();
    let store = Arc::new(SchedulerStore::in_memory(zone).unwrap());
    let clock = Arc::new(ManualClock::new(t(start)));
    let settings = EngineSettings {
        poll_seconds: 1,
        max_jobs_per_cycle: max_jobs,
        ..EngineSettings::default()
    };
    let engine = Arc::new(SchedulerEngine::new(store, executor, clock.clone(), settings));
    Harness { engine, clock }
}

pub fn interval(name: &str, secs: u64) -> JobSpec {
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

/// Poll until the run leaves `running`.
pub async fn wait_finished(engine: &SchedulerEngine, run_id: i64) -> Run {
    for _ in 0..200 {
        let run = engine.get_run(run_id).unwrap();
        if run.status != RunStatus::Running {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never finished");
}

/// Poll until the guard is free again.
pub async fn wait_idle(engine: &SchedulerEngine) {
    for _ in 0..200 {
        if !engine.guard().is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("guard never released");
}
