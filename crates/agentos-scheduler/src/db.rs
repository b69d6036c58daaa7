use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` and `task_executions` tables (idempotent) plus the
/// indexes behind the due-task poll and the per-task history query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id             TEXT    NOT NULL PRIMARY KEY,
            name           TEXT    NOT NULL,
            description    TEXT,
            type           TEXT    NOT NULL,   -- cron | interval | once | manual
            schedule       TEXT    NOT NULL,
            command        TEXT    NOT NULL,
            status         TEXT    NOT NULL DEFAULT 'active',
            enabled        INTEGER NOT NULL DEFAULT 1,
            retries        INTEGER NOT NULL DEFAULT 0,
            retry_delay_ms INTEGER NOT NULL DEFAULT 1000,
            timeout_ms     INTEGER NOT NULL DEFAULT 300000,
            last_run       TEXT,               -- RFC 3339 UTC or NULL
            next_run       TEXT,               -- RFC 3339 UTC or NULL
            run_count      INTEGER NOT NULL DEFAULT 0,
            success_count  INTEGER NOT NULL DEFAULT 0,
            failure_count  INTEGER NOT NULL DEFAULT 0,
            data           TEXT    NOT NULL DEFAULT 'null',  -- opaque JSON
            metadata       TEXT    NOT NULL DEFAULT 'null',  -- opaque JSON
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL
        ) STRICT;

        -- Due poll: WHERE enabled AND status = 'active' AND next_run <= ? ORDER BY next_run
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, enabled, next_run);

        CREATE TABLE IF NOT EXISTS task_executions (
            id           TEXT    NOT NULL PRIMARY KEY,
            task_id      TEXT    NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            status       TEXT    NOT NULL,
            started_at   TEXT    NOT NULL,
            completed_at TEXT,
            duration_ms  INTEGER,
            result       TEXT,
            error        TEXT,
            retry_count  INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_task
            ON task_executions (task_id, started_at DESC);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC encoding so that string comparison in SQL is
/// chronological comparison.
pub(crate) fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}
