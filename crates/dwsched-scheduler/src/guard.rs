//! Single-flight execution guard.
//!
//! At most one pipeline execution may be in flight per process. Callers race
//! through [`ExecutionGuard::try_acquire`]; the winner receives a
//! [`GuardSlot`] and everyone else gets an immediate
//! [`Admission::Rejected`]. Nobody waits.
//!
//! The slot releases the guard when dropped, so every exit path (normal
//! return, `?`, panic unwinding, task abort) frees it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dwsched_core::{Clock, PipelineMode};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::{
    events::{record_event, EventKind},
    store::SchedulerStore,
    types::{Admission, CurrentExecution, ExecutionIdentity, Rejection},
};

#[derive(Debug, Default)]
struct GuardState {
    current: Option<CurrentExecution>,
    closed: bool,
}

#[derive(Debug, Default)]
struct GuardInner {
    state: Mutex<GuardState>,
    released: Notify,
}

/// Cheap to clone; all clones share one slot.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    inner: Arc<GuardInner>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot if it is free. Never blocks beyond the internal lock.
    pub fn try_acquire(
        &self,
        identity: ExecutionIdentity,
        mode: PipelineMode,
        now: DateTime<Utc>,
    ) -> Admission<GuardSlot> {
        let mut state = self.state();
        if state.closed {
            return Admission::Rejected(Rejection::closed());
        }
        if let Some(current) = &state.current {
            return Admission::Rejected(Rejection::busy(Some(current.clone())));
        }

        let token = Uuid::now_v7();
        debug!(%token, holder = identity.label(), "execution guard acquired");
        state.current = Some(CurrentExecution {
            token,
            identity,
            mode,
            run_id: None,
            started_at: now,
            progress: None,
        });
        Admission::Admitted(GuardSlot {
            guard: self.clone(),
            token,
        })
    }

    /// The in-flight execution, if any.
    pub fn current(&self) -> Option<CurrentExecution> {
        self.state().current.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state().current.is_some()
    }

    /// Reject every future acquisition. The current holder, if any, keeps
    /// its slot until it finishes.
    pub fn close(&self) {
        self.state().closed = true;
    }

    /// Resolve once nothing holds the slot.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not lost.
            released.as_mut().enable();
            if !self.is_busy() {
                return;
            }
            released.await;
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the current execution if `token` still owns it.
    fn update(&self, token: Uuid, f: impl FnOnce(&mut CurrentExecution)) {
        let mut state = self.state();
        if let Some(current) = state.current.as_mut().filter(|c| c.token == token) {
            f(current);
        }
    }

    fn release(&self, token: Uuid) {
        let mut state = self.state();
        if state.current.as_ref().is_some_and(|c| c.token == token) {
            state.current = None;
            drop(state);
            self.inner.released.notify_waiters();
            debug!(%token, "execution guard released");
        }
    }
}

/// Proof of holding the guard. Dropping it releases the guard.
#[derive(Debug)]
pub struct GuardSlot {
    guard: ExecutionGuard,
    token: Uuid,
}

impl GuardSlot {
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Record the run this slot is executing so status reports can show it.
    pub fn attach_run(&self, run_id: i64) {
        self.guard.update(self.token, |c| c.run_id = Some(run_id));
    }

    /// Handle the executor uses to publish in-flight progress.
    pub(crate) fn progress_handle(
        &self,
        store: Arc<SchedulerStore>,
        clock: Arc<dyn Clock>,
        job_id: Option<i64>,
        run_id: i64,
    ) -> ProgressHandle {
        ProgressHandle {
            guard: Some(self.guard.clone()),
            token: self.token,
            sink: Some(ProgressSink {
                store,
                clock,
                job_id,
                run_id,
            }),
        }
    }
}

impl Drop for GuardSlot {
    fn drop(&mut self) {
        self.guard.release(self.token);
    }
}

#[derive(Clone)]
struct ProgressSink {
    store: Arc<SchedulerStore>,
    clock: Arc<dyn Clock>,
    job_id: Option<i64>,
    run_id: i64,
}

/// Given to [`crate::executor::PipelineExecutor::execute`] so a long run can
/// report where it is. Reports after the slot is released are ignored.
#[derive(Clone)]
pub struct ProgressHandle {
    guard: Option<ExecutionGuard>,
    token: Uuid,
    sink: Option<ProgressSink>,
}

impl ProgressHandle {
    /// A handle that goes nowhere.
    pub fn detached() -> Self {
        Self {
            guard: None,
            token: Uuid::nil(),
            sink: None,
        }
    }

    pub fn report(&self, progress: Value) {
        if let Some(guard) = &self.guard {
            let snapshot = progress.clone();
            guard.update(self.token, |c| c.progress = Some(snapshot));
        }
        if let Some(sink) = &self.sink {
            record_event(
                &sink.store,
                sink.clock.now(),
                EventKind::Progress,
                sink.job_id,
                Some(sink.run_id),
                progress,
            );
        }
    }
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("token", &self.token)
            .field("attached", &self.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn now() -> DateTime<Utc> {
        dwsched_core::parse_instant("2026-03-01T12:00:00Z").unwrap()
    }

    #[test]
    fn second_acquire_is_rejected_with_holder() {
        let guard = ExecutionGuard::new();
        let slot = guard
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
            .admitted()
            .unwrap();

        match guard.try_acquire(ExecutionIdentity::Forced, PipelineMode::Incremental, now()) {
            Admission::Rejected(r) => {
                assert_eq!(r.reason, "execution in progress");
                let holder = r.current.unwrap();
                assert_eq!(holder.token, slot.token());
                assert_eq!(holder.mode, PipelineMode::Full);
            }
            Admission::Admitted(_) => panic!("guard admitted twice"),
        }
    }

    #[test]
    fn drop_releases_and_reacquire_succeeds() {
        let guard = ExecutionGuard::new();
        {
            let _slot = guard
                .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
                .admitted()
                .unwrap();
            assert!(guard.is_busy());
        }
        assert!(!guard.is_busy());
        assert!(guard
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
            .admitted()
            .is_some());
    }

    #[test]
    fn panic_while_holding_still_releases() {
        let guard = ExecutionGuard::new();
        let g = guard.clone();
        let result = thread::spawn(move || {
            let _slot = g
                .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
                .admitted()
                .unwrap();
            panic!("pipeline blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!guard.is_busy());
    }

    #[test]
    fn closed_guard_rejects_new_work() {
        let guard = ExecutionGuard::new();
        guard.close();
        let rejected = guard.try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now());
        assert!(rejected.is_rejected());
    }

    #[tokio::test]
    async fn wait_idle_resolves_on_release() {
        let guard = ExecutionGuard::new();
        guard.wait_idle().await;

        let slot = guard
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
            .admitted()
            .unwrap();
        let waiter = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.wait_idle().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(slot);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn exactly_one_winner_under_contention() {
        let guard = ExecutionGuard::new();
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let slot = guard
                        .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
                        .admitted();
                    // Hold the slot until every thread has tried.
                    barrier.wait();
                    slot.is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(!guard.is_busy());
    }

    #[test]
    fn attach_run_and_progress_show_in_current() {
        let guard = ExecutionGuard::new();
        let slot = guard
            .try_acquire(
                ExecutionIdentity::Job {
                    job_id: 3,
                    job_name: "nightly".into(),
                },
                PipelineMode::Incremental,
                now(),
            )
            .admitted()
            .unwrap();
        slot.attach_run(42);
        let handle = ProgressHandle {
            guard: Some(guard.clone()),
            token: slot.token(),
            sink: None,
        };
        handle.report(serde_json::json!({"step": "validate"}));

        let current = guard.current().unwrap();
        assert_eq!(current.run_id, Some(42));
        assert_eq!(current.progress.unwrap()["step"], "validate");

        drop(slot);
        // A stale handle cannot touch the next holder.
        let next = guard
            .try_acquire(ExecutionIdentity::Forced, PipelineMode::Full, now())
            .admitted()
            .unwrap();
        handle.report(serde_json::json!({"step": "late"}));
        assert_eq!(guard.current().unwrap().progress, None);
        drop(next);
    }

    #[test]
    fn detached_handle_is_inert() {
        ProgressHandle::detached().report(serde_json::json!({"rows": 10}));
    }
}
