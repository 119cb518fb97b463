use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dwsched_core::{format_instant, parse_instant, CivilZone, RunOptions};
use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    schedule::{compute_next_run, normalize_spec},
    types::{Job, JobSpec, RunStatus, Schedule},
};

pub(crate) const JOB_COLUMNS: &str = "id, name, mode, schedule_type, interval_seconds, daily_time,
     daily_date, daily_repeat, rows_override, continue_on_error, skip_validation, enabled,
     next_run_at, last_run_at, last_status, last_error, created_at, updated_at";

/// Durable home of jobs, runs and the event log.
///
/// One SQLite connection behind a `Mutex`; every method holds the lock only
/// for its own statements, never across an `.await`.
pub struct SchedulerStore {
    conn: Mutex<Connection>,
    zone: CivilZone,
}

/// Whether an upsert inserted a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct Upserted {
    pub action: UpsertAction,
    pub job: Job,
}

impl SchedulerStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection, zone: CivilZone) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            zone,
        })
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &str, zone: CivilZone) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=30000;",
        )?;
        Self::new(conn, zone)
    }

    pub fn in_memory(zone: CivilZone) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::new(conn, zone)
    }

    pub fn zone(&self) -> &CivilZone {
        &self.zone
    }

    /// Lock the connection. A panic elsewhere must not wedge the store.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a job or replace the one with the same name in place.
    ///
    /// The id (and therefore history linkage) of an existing job is kept;
    /// `last_*` fields survive the replace. `next_run_at` is recomputed from
    /// `now`.
    pub fn upsert_job(&self, spec: JobSpec, now: DateTime<Utc>) -> Result<Upserted> {
        let spec = normalize_spec(spec, &self.zone, now)?;
        let next = if spec.enabled {
            compute_next_run(&spec.schedule, &self.zone, None, now)
        } else {
            None
        };
        let cols = ScheduleColumns::from(&spec.schedule);
        let now_str = format_instant(now);
        let next_str = next.map(format_instant);

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM jobs WHERE name = ?1", [&spec.name], |row| {
                row.get(0)
            })
            .optional()?;

        let (job_id, action) = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE jobs SET mode=?1, schedule_type=?2, interval_seconds=?3,
                       daily_time=?4, daily_date=?5, daily_repeat=?6, rows_override=?7,
                       continue_on_error=?8, skip_validation=?9, enabled=?10,
                       next_run_at=?11, updated_at=?12
                     WHERE id=?13",
                    rusqlite::params![
                        spec.mode.as_str(),
                        cols.schedule_type,
                        cols.interval_seconds,
                        cols.daily_time,
                        cols.daily_date,
                        cols.daily_repeat,
                        spec.options.rows_override,
                        spec.options.continue_on_error,
                        spec.options.skip_validation,
                        spec.enabled,
                        next_str,
                        now_str,
                        id,
                    ],
                )?;
                (id, UpsertAction::Updated)
            }
            None => {
                tx.execute(
                    "INSERT INTO jobs
                     (name, mode, schedule_type, interval_seconds, daily_time, daily_date,
                      daily_repeat, rows_override, continue_on_error, skip_validation,
                      enabled, next_run_at, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)",
                    rusqlite::params![
                        spec.name,
                        spec.mode.as_str(),
                        cols.schedule_type,
                        cols.interval_seconds,
                        cols.daily_time,
                        cols.daily_date,
                        cols.daily_repeat,
                        spec.options.rows_override,
                        spec.options.continue_on_error,
                        spec.options.skip_validation,
                        spec.enabled,
                        next_str,
                        now_str,
                    ],
                )?;
                (tx.last_insert_rowid(), UpsertAction::Created)
            }
        };
        tx.commit()?;

        let job = query_job(&conn, job_id)?;
        info!(job_id, name = %job.name, ?action, next_run_at = ?job.next_run_at, "job upserted");
        Ok(Upserted { action, job })
    }

    /// All jobs, soonest `next_run_at` first (jobs without one last).
    pub fn list_jobs(&self, include_disabled: bool) -> Result<Vec<Job>> {
        let conn = self.conn();
        let filter = if include_disabled { "" } else { "WHERE enabled = 1" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs {filter}
             ORDER BY next_run_at IS NULL, next_run_at ASC, id ASC"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get_job(&self, id: i64) -> Result<Job> {
        let conn = self.conn();
        query_job(&conn, id)
    }

    /// Resolve a job by numeric id first, then by name.
    pub fn find_job(&self, reference: &str) -> Result<Job> {
        let conn = self.conn();
        find_by_ref(&conn, reference)
    }

    /// Enabled jobs with `next_run_at <= now`, earliest first, at most `limit`.
    pub fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC, id ASC
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(rusqlite::params![format_instant(now), limit], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Flip the enabled flag.
    ///
    /// Disabling clears `next_run_at`. Re-enabling a disabled job computes a
    /// fresh one from `now`; enabling an enabled job changes nothing.
    pub fn set_enabled(&self, reference: &str, enabled: bool, now: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn();
        let job = find_by_ref(&conn, reference)?;
        let next = match (enabled, job.enabled) {
            (false, _) => None,
            (true, true) => job.next_run_at,
            (true, false) => compute_next_run(&job.schedule, &self.zone, None, now),
        };
        conn.execute(
            "UPDATE jobs SET enabled=?1, next_run_at=?2, updated_at=?3 WHERE id=?4",
            rusqlite::params![enabled, next.map(format_instant), format_instant(now), job.id],
        )?;
        info!(job_id = job.id, name = %job.name, enabled, "job enabled flag changed");
        query_job(&conn, job.id)
    }

    /// Delete a job together with its runs and event-log entries.
    pub fn delete_job(&self, reference: &str) -> Result<Job> {
        let mut conn = self.conn();
        let job = find_by_ref(&conn, reference)?;
        let tx = conn.transaction()?;
        let events = tx.execute("DELETE FROM event_log WHERE job_id = ?1", [job.id])?;
        let runs = tx.execute("DELETE FROM runs WHERE job_id = ?1", [job.id])?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", [job.id])?;
        tx.commit()?;
        info!(job_id = job.id, name = %job.name, runs, events, "job deleted");
        Ok(job)
    }
}

/// Flat column values for a [`Schedule`].
struct ScheduleColumns {
    schedule_type: &'static str,
    interval_seconds: Option<i64>,
    daily_time: Option<String>,
    daily_date: Option<String>,
    daily_repeat: bool,
}

impl From<&Schedule> for ScheduleColumns {
    fn from(schedule: &Schedule) -> Self {
        match schedule {
            Schedule::Interval { interval_seconds } => Self {
                schedule_type: schedule.type_name(),
                interval_seconds: i64::try_from(*interval_seconds).ok(),
                daily_time: None,
                daily_date: None,
                daily_repeat: true,
            },
            Schedule::Daily {
                daily_time,
                daily_date,
                daily_repeat,
            } => Self {
                schedule_type: schedule.type_name(),
                interval_seconds: None,
                daily_time: Some(daily_time.format("%H:%M").to_string()),
                daily_date: daily_date.map(|d| d.format("%Y-%m-%d").to_string()),
                daily_repeat: *daily_repeat,
            },
        }
    }
}

pub(crate) fn query_job(conn: &Connection, id: i64) -> Result<Job> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::JobNotFound {
        reference: id.to_string(),
    })
}

fn find_by_ref(conn: &Connection, reference: &str) -> Result<Job> {
    let reference = reference.trim();
    if let Ok(id) = reference.parse::<i64>() {
        let by_id = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        if let Some(job) = by_id {
            return Ok(job);
        }
    }
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
        [reference],
        row_to_job,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::JobNotFound {
        reference: reference.to_string(),
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let schedule_type: String = row.get(3)?;
    let schedule = match schedule_type.as_str() {
        "interval" => {
            let secs: i64 = row.get(4)?;
            Schedule::Interval {
                interval_seconds: u64::try_from(secs).map_err(|e| conversion(4, e))?,
            }
        }
        "daily" => {
            let time: String = row.get(5)?;
            let date: Option<String> = row.get(6)?;
            Schedule::Daily {
                daily_time: NaiveTime::parse_from_str(&time, "%H:%M")
                    .map_err(|e| conversion(5, e))?,
                daily_date: date
                    .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                    .transpose()
                    .map_err(|e| conversion(6, e))?,
                daily_repeat: row.get(7)?,
            }
        }
        other => return Err(conversion(3, format!("unknown schedule type: {other}"))),
    };

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        mode: parse_text(row, 2)?,
        schedule,
        options: RunOptions {
            rows_override: row.get(8)?,
            continue_on_error: row.get(9)?,
            skip_validation: row.get(10)?,
        },
        enabled: row.get(11)?,
        next_run_at: opt_instant(row, 12)?,
        last_run_at: opt_instant(row, 13)?,
        last_status: row
            .get::<_, Option<String>>(14)?
            .map(|s| s.parse::<RunStatus>().map_err(|e| conversion(14, e)))
            .transpose()?,
        last_error: row.get(15)?,
        created_at: instant(row, 16)?,
        updated_at: instant(row, 17)?,
    })
}

pub(crate) fn conversion(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

pub(crate) fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| conversion(idx, e))
}

pub(crate) fn instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_instant(&raw).ok_or_else(|| conversion(idx, format!("bad timestamp: {raw}")))
}

pub(crate) fn opt_instant(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_instant(&s).ok_or_else(|| conversion(idx, format!("bad timestamp: {s}"))))
        .transpose()
}
