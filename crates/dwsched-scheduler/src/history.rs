use chrono::{DateTime, Utc};
use dwsched_core::{format_instant, PipelineMode, RunOptions};
use rusqlite::{OptionalExtension, Row};
use tracing::{info, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::RunOutcome,
    schedule::next_run_for_job,
    store::{conversion, instant, opt_instant, parse_text, query_job, SchedulerStore},
    types::{Job, Run, RunKind, RunStatus},
};

const RUN_COLUMNS: &str = "r.id, r.kind, r.job_id, j.name, r.mode, r.rows_override,
     r.continue_on_error, r.skip_validation, r.started_at, r.finished_at, r.status,
     r.error_text";

pub(crate) const INTERRUPTED: &str = "interrupted: process exited before completion";

impl SchedulerStore {
    /// Open a run for `job` and mark the job as running, atomically.
    pub fn open_job_run(&self, job: &Job, kind: RunKind, started_at: DateTime<Utc>) -> Result<Run> {
        let started = format_instant(started_at);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (kind, job_id, mode, rows_override, continue_on_error,
                               skip_validation, started_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'running')",
            rusqlite::params![
                kind.to_string(),
                job.id,
                job.mode.as_str(),
                job.options.rows_override,
                job.options.continue_on_error,
                job.options.skip_validation,
                started,
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE jobs SET last_status = 'running', updated_at = ?1 WHERE id = ?2",
            rusqlite::params![started, job.id],
        )?;
        tx.commit()?;

        Ok(Run {
            id: run_id,
            kind,
            job_id: Some(job.id),
            job_name: Some(job.name.clone()),
            mode: job.mode,
            options: job.options.clone(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            error_text: None,
            result: None,
        })
    }

    /// Open an ad-hoc run with no job attached.
    pub fn open_forced_run(
        &self,
        mode: PipelineMode,
        options: &RunOptions,
        started_at: DateTime<Utc>,
    ) -> Result<Run> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (kind, job_id, mode, rows_override, continue_on_error,
                               skip_validation, started_at, status)
             VALUES ('manual', NULL, ?1, ?2, ?3, ?4, ?5, 'running')",
            rusqlite::params![
                mode.as_str(),
                options.rows_override,
                options.continue_on_error,
                options.skip_validation,
                format_instant(started_at),
            ],
        )?;
        Ok(Run {
            id: conn.last_insert_rowid(),
            kind: RunKind::Manual,
            job_id: None,
            job_name: None,
            mode,
            options: options.clone(),
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            error_text: None,
            result: None,
        })
    }

    /// Close a job run and advance its job in one transaction.
    ///
    /// The job row is re-read inside the transaction so an upsert or
    /// enable/disable that landed mid-run is honoured. `reference` is the
    /// "now" the next run is computed from.
    pub fn finish_job_run(
        &self,
        run_id: i64,
        job_id: i64,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
        reference: DateTime<Utc>,
    ) -> Result<Run> {
        let finished = format_instant(finished_at);
        let result_json = outcome.result.as_ref().map(serde_json::to_string).transpose()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE runs SET finished_at = ?1, status = ?2, error_text = ?3, result_json = ?4
             WHERE id = ?5 AND status = 'running'",
            rusqlite::params![
                finished,
                outcome.status.to_string(),
                outcome.error_text,
                result_json,
                run_id
            ],
        )?;
        if updated == 0 {
            // Job deleted mid-run (cascade took the run) or run already closed.
            return Err(SchedulerError::RunNotFound { id: run_id });
        }

        let job = query_job(&tx, job_id)?;
        let next = next_run_for_job(&job, self.zone(), reference);
        tx.execute(
            "UPDATE jobs SET last_run_at = ?1, last_status = ?2, last_error = ?3,
                             next_run_at = ?4, updated_at = ?1
             WHERE id = ?5",
            rusqlite::params![
                finished,
                outcome.status.to_string(),
                outcome.error_text,
                next.map(format_instant),
                job_id,
            ],
        )?;
        let run = query_run(&tx, run_id)?;
        tx.commit()?;

        info!(
            run_id,
            job_id,
            job_name = %job.name,
            status = %outcome.status,
            next_run_at = ?next,
            "job run finished"
        );
        Ok(run)
    }

    /// Close a forced run.
    pub fn finish_forced_run(
        &self,
        run_id: i64,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<Run> {
        let result_json = outcome.result.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE runs SET finished_at = ?1, status = ?2, error_text = ?3, result_json = ?4
             WHERE id = ?5 AND status = 'running'",
            rusqlite::params![
                format_instant(finished_at),
                outcome.status.to_string(),
                outcome.error_text,
                result_json,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(SchedulerError::RunNotFound { id: run_id });
        }
        query_run(&conn, run_id)
    }

    /// Close a run whose completion could not be recorded, and clear the
    /// job's `running` status.
    ///
    /// Each statement only touches rows still marked `running`, so a run
    /// that did get closed is left as it is.
    pub fn abandon_run(
        &self,
        run_id: i64,
        job_id: Option<i64>,
        error_text: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let finished = format_instant(finished_at);
        let conn = self.conn();
        conn.execute(
            "UPDATE runs SET status = 'failed', finished_at = ?1, error_text = ?2
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![finished, error_text, run_id],
        )?;
        if let Some(job_id) = job_id {
            conn.execute(
                "UPDATE jobs SET last_status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND last_status = 'running'",
                rusqlite::params![error_text, finished, job_id],
            )?;
        }
        Ok(())
    }

    /// A single run including its result payload.
    pub fn get_run(&self, id: i64) -> Result<Run> {
        let conn = self.conn();
        query_run(&conn, id)
    }

    /// Most recent runs of one kind, newest first. Result payloads are not
    /// loaded.
    pub fn recent_runs(&self, kind: RunKind, limit: u32) -> Result<Vec<Run>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM runs r LEFT JOIN jobs j ON j.id = r.job_id
             WHERE r.kind = ?1
             ORDER BY r.started_at DESC, r.id DESC
             LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(rusqlite::params![kind.to_string(), limit], |row| {
                row_to_run(row, None)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Close runs a previous process left in `running`, and fail their jobs.
    ///
    /// Returns the ids of the recovered runs.
    pub fn recover_interrupted_runs(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let now_str = format_instant(now);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM runs WHERE status = 'running' ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        if ids.is_empty() {
            return Ok(ids);
        }
        tx.execute(
            "UPDATE jobs SET last_status = 'failed', last_error = ?1, updated_at = ?2
             WHERE id IN (SELECT job_id FROM runs WHERE status = 'running' AND job_id IS NOT NULL)",
            rusqlite::params![INTERRUPTED, now_str],
        )?;
        tx.execute(
            "UPDATE runs SET status = 'failed', finished_at = ?1, error_text = ?2
             WHERE status = 'running'",
            rusqlite::params![now_str, INTERRUPTED],
        )?;
        tx.commit()?;
        warn!(count = ids.len(), "closed runs interrupted by a previous shutdown");
        Ok(ids)
    }
}

fn query_run(conn: &rusqlite::Connection, id: i64) -> Result<Run> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS}, r.result_json FROM runs r LEFT JOIN jobs j ON j.id = r.job_id
             WHERE r.id = ?1"
        ),
        [id],
        |row| row_to_run(row, Some(12)),
    )
    .optional()?
    .ok_or(SchedulerError::RunNotFound { id })
}

fn row_to_run(row: &Row<'_>, result_idx: Option<usize>) -> rusqlite::Result<Run> {
    let result = match result_idx {
        Some(idx) => row
            .get::<_, Option<String>>(idx)?
            .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion(idx, e)))
            .transpose()?,
        None => None,
    };
    Ok(Run {
        id: row.get(0)?,
        kind: parse_text(row, 1)?,
        job_id: row.get(2)?,
        job_name: row.get(3)?,
        mode: parse_text(row, 4)?,
        options: RunOptions {
            rows_override: row.get(5)?,
            continue_on_error: row.get(6)?,
            skip_validation: row.get(7)?,
        },
        started_at: instant(row, 8)?,
        finished_at: opt_instant(row, 9)?,
        status: parse_text(row, 10)?,
        error_text: row.get(11)?,
        result,
    })
}
