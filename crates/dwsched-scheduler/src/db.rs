use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `runs` and `event_log` tables (idempotent) plus the
/// indexes behind the due-job poll and the history views.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            name              TEXT    NOT NULL UNIQUE,
            mode              TEXT    NOT NULL CHECK (mode IN ('full', 'incremental')),
            schedule_type     TEXT    NOT NULL CHECK (schedule_type IN ('interval', 'daily')),
            interval_seconds  INTEGER,
            daily_time        TEXT,               -- HH:MM civil time
            daily_date        TEXT,               -- YYYY-MM-DD civil date or NULL
            daily_repeat      INTEGER NOT NULL DEFAULT 1,
            rows_override     INTEGER,
            continue_on_error INTEGER NOT NULL DEFAULT 0,
            skip_validation   INTEGER NOT NULL DEFAULT 0,
            enabled           INTEGER NOT NULL DEFAULT 1,
            next_run_at       TEXT,               -- RFC 3339 UTC or NULL
            last_run_at       TEXT,
            last_status       TEXT CHECK (last_status IN ('running', 'success', 'failed')),
            last_error        TEXT,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        -- Due poll: WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (enabled, next_run_at);

        CREATE TABLE IF NOT EXISTS runs (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            kind              TEXT    NOT NULL CHECK (kind IN ('scheduler', 'manual')),
            job_id            INTEGER REFERENCES jobs (id) ON DELETE CASCADE,
            mode              TEXT    NOT NULL,
            rows_override     INTEGER,
            continue_on_error INTEGER NOT NULL DEFAULT 0,
            skip_validation   INTEGER NOT NULL DEFAULT 0,
            started_at        TEXT    NOT NULL,
            finished_at       TEXT,
            status            TEXT    NOT NULL CHECK (status IN ('running', 'success', 'failed')),
            error_text        TEXT,
            result_json       TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_runs_kind_started ON runs (kind, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_runs_job ON runs (job_id, started_at DESC);

        CREATE TABLE IF NOT EXISTS event_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            ts          TEXT    NOT NULL,
            event_type  TEXT    NOT NULL,
            job_id      INTEGER,
            run_id      INTEGER,
            payload     TEXT    NOT NULL    -- JSON object
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_event_log_job ON event_log (job_id);
        ",
    )?;
    Ok(())
}
