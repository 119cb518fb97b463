use chrono::{DateTime, Utc};
use dwsched_core::format_instant;
use rusqlite::Row;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    error::Result,
    store::{instant, SchedulerStore},
    types::EventLogEntry,
};

/// Tags written to the event log by the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Progress,
    Finished,
    Error,
    LoopStarted,
    LoopStopped,
    Recovered,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Progress => "progress",
            EventKind::Finished => "finished",
            EventKind::Error => "error",
            EventKind::LoopStarted => "loop_started",
            EventKind::LoopStopped => "loop_stopped",
            EventKind::Recovered => "recovered",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SchedulerStore {
    /// Append one immutable entry. Returns its id.
    pub fn append_event(
        &self,
        at: DateTime<Utc>,
        kind: EventKind,
        job_id: Option<i64>,
        run_id: Option<i64>,
        payload: &Value,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO event_log (ts, event_type, job_id, run_id, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                format_instant(at),
                kind.as_str(),
                job_id,
                run_id,
                serde_json::to_string(payload)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The newest `limit` entries, newest first.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<EventLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, event_type, job_id, run_id, payload
             FROM event_log ORDER BY id DESC LIMIT ?1",
        )?;
        let zone = *self.zone();
        let entries = stmt
            .query_map([limit], |row| {
                let timestamp_utc = instant(row, 1)?;
                Ok(EventLogEntry {
                    id: row.get(0)?,
                    timestamp_utc,
                    timestamp_civil: zone.render(timestamp_utc),
                    event_type: row.get(2)?,
                    job_id: row.get(3)?,
                    run_id: row.get(4)?,
                    payload: payload_column(row, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

/// Unreadable payloads are surfaced raw rather than failing the whole page.
fn payload_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    Ok(serde_json::from_str(&raw).unwrap_or_else(|_| json!({ "raw": raw })))
}

/// Append an event, logging instead of failing. A broken audit trail must
/// never interrupt a run.
pub(crate) fn record_event(
    store: &SchedulerStore,
    at: DateTime<Utc>,
    kind: EventKind,
    job_id: Option<i64>,
    run_id: Option<i64>,
    payload: Value,
) {
    if let Err(e) = store.append_event(at, kind, job_id, run_id, &payload) {
        warn!(event = %kind, ?job_id, ?run_id, "event log write failed: {e}");
    }
}
