use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{format_ts, init_db, parse_opt_ts, parse_ts};
use crate::error::{Result, SchedulerError};
use crate::store::TaskStore;
use crate::types::{
    CounterOutcome, ExecutionStatus, ExecutionUpdate, ScheduledTask, TaskExecution, TaskStats,
    TaskStatus,
};

const TASK_COLUMNS: &str = "id, name, description, type, schedule, command, status, enabled,
     retries, retry_delay_ms, timeout_ms, last_run, next_run,
     run_count, success_count, failure_count, data, metadata, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "id, task_id, status, started_at, completed_at, duration_ms, result, error, retry_count";

/// SQLite-backed [`TaskStore`].
///
/// Wraps a single connection in a `Mutex`; every statement runs to completion
/// while the lock is held, so concurrent firings see serialised writes.
pub struct SqliteTaskStore {
    db: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Wrap an open connection, enabling WAL and foreign keys and running
    /// the schema migration.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("connection mutex poisoned".to_string()))
    }

    /// Run an UPDATE/DELETE keyed by task id, mapping zero affected rows to
    /// `TaskNotFound`.
    fn touch_task(&self, id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let n = self.conn()?.execute(sql, params)?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        let data = serde_json::to_string(&task.data)?;
        let metadata = serde_json::to_string(&task.metadata)?;
        self.conn()?.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)"
            ),
            params![
                task.id,
                task.name,
                task.description,
                task.task_type.as_str(),
                task.schedule,
                task.command,
                task.status.as_str(),
                task.enabled,
                task.retries as i64,
                task.retry_delay_ms as i64,
                task.timeout_ms as i64,
                task.last_run.map(format_ts),
                task.next_run.map(format_ts),
                task.run_count as i64,
                task.success_count as i64,
                task.failure_count as i64,
                data,
                metadata,
                format_ts(task.created_at),
                format_ts(task.updated_at),
            ],
        )?;
        debug!("task row inserted");
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, id"
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn delete_task(&self, id: &str) -> Result<()> {
        self.touch_task(id, "DELETE FROM tasks WHERE id = ?1", &[&id])?;
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    async fn get_tasks_due_for_execution(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn()?;
        // Rows are decoded one at a time so a single corrupt row cannot
        // block the whole page.
        let rows: Vec<(String, rusqlite::Result<ScheduledTask>)> = {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE enabled = 1 AND status = 'active' AND type != 'manual'
                   AND (next_run IS NULL OR next_run <= ?1)
                 ORDER BY next_run ASC, created_at ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![format_ts(now), limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row_to_task(row)))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, decoded) in rows {
            match decoded {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(task_id = %id, "undecodable task row, marking errored: {e}");
                    conn.execute(
                        "UPDATE tasks SET status = 'error', updated_at = ?1 WHERE id = ?2",
                        params![format_ts(Utc::now()), id],
                    )?;
                }
            }
        }
        Ok(tasks)
    }

    async fn update_task_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        let now = format_ts(Utc::now());
        let next = next_run.map(format_ts);
        self.touch_task(
            id,
            "UPDATE tasks SET next_run = ?1, updated_at = ?2 WHERE id = ?3",
            &[&next, &now, &id],
        )
    }

    async fn update_task_last_run(&self, id: &str, last_run: DateTime<Utc>) -> Result<()> {
        let now = format_ts(Utc::now());
        let last = format_ts(last_run);
        self.touch_task(
            id,
            "UPDATE tasks SET last_run = ?1, updated_at = ?2 WHERE id = ?3",
            &[&last, &now, &id],
        )
    }

    #[instrument(skip(self))]
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let now = format_ts(Utc::now());
        self.touch_task(
            id,
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            &[&status.as_str(), &now, &id],
        )
    }

    #[instrument(skip(self))]
    async fn set_task_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let now = format_ts(Utc::now());
        self.touch_task(
            id,
            "UPDATE tasks SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
            &[&enabled, &now, &id],
        )
    }

    async fn increment_task_counters(&self, id: &str, outcome: CounterOutcome) -> Result<()> {
        let (ok, failed): (i64, i64) = match outcome {
            CounterOutcome::Success => (1, 0),
            CounterOutcome::Failure => (0, 1),
        };
        let now = format_ts(Utc::now());
        // One statement keeps success_count + failure_count == run_count.
        self.touch_task(
            id,
            "UPDATE tasks
             SET run_count     = run_count + 1,
                 success_count = success_count + ?1,
                 failure_count = failure_count + ?2,
                 updated_at    = ?3
             WHERE id = ?4",
            &[&ok, &failed, &now, &id],
        )
    }

    #[instrument(skip(self))]
    async fn create_execution(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        started_at: DateTime<Utc>,
    ) -> Result<TaskExecution> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO task_executions (id, task_id, status, started_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![id, task_id, status.as_str(), format_ts(started_at)],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                }
            }
            other => other.into(),
        })?;

        Ok(TaskExecution {
            id,
            task_id: task_id.to_string(),
            status,
            started_at,
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            retry_count: 0,
        })
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()> {
        let n = self.conn()?.execute(
            "UPDATE task_executions
             SET status = ?1, completed_at = ?2, duration_ms = ?3,
                 result = ?4, error = ?5, retry_count = ?6
             WHERE id = ?7",
            params![
                update.status.as_str(),
                update.completed_at.map(format_ts),
                update.duration_ms.map(|d| d as i64),
                update.result,
                update.error,
                update.retry_count as i64,
                id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::StoreUnavailable(format!(
                "execution {id} vanished before it could be finalised"
            )));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        let conn = self.conn()?;
        let execution = conn
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                [id],
                row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    async fn list_executions(&self, task_id: &str, limit: usize) -> Result<Vec<TaskExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions
             WHERE task_id = ?1
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let executions = stmt
            .query_map(params![task_id, limit as i64], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(executions)
    }

    async fn get_task_stats(&self) -> Result<TaskStats> {
        let conn = self.conn()?;
        let (total, active, paused, completed, errored, enabled, runs, successes, failures) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(status = 'active'), 0),
                        COALESCE(SUM(status = 'paused'), 0),
                        COALESCE(SUM(status = 'completed'), 0),
                        COALESCE(SUM(status = 'error'), 0),
                        COALESCE(SUM(enabled), 0),
                        COALESCE(SUM(run_count), 0),
                        COALESCE(SUM(success_count), 0),
                        COALESCE(SUM(failure_count), 0)
                 FROM tasks",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )?;
        let (executions, running): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'running'), 0) FROM task_executions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let run_count = runs as u64;
        let success_count = successes as u64;
        Ok(TaskStats {
            total_tasks: total as u64,
            active_tasks: active as u64,
            paused_tasks: paused as u64,
            completed_tasks: completed as u64,
            error_tasks: errored as u64,
            enabled_tasks: enabled as u64,
            run_count,
            success_count,
            failure_count: failures as u64,
            total_executions: executions as u64,
            running_executions: running as u64,
            success_rate: TaskStats::compute_success_rate(success_count, run_count),
        })
    }

    #[instrument(skip(self))]
    async fn cleanup_old_executions(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let n = self.conn()?.execute(
            "DELETE FROM task_executions
             WHERE started_at < ?1 AND status IN ('completed', 'failed')",
            [format_ts(cutoff)],
        )?;
        if n > 0 {
            info!(removed = n, retention_days, "old executions purged");
        }
        Ok(n)
    }
}

/// Map a SQLite row (in `TASK_COLUMNS` order) to a `ScheduledTask`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let type_str: String = row.get(3)?;
    let status_str: String = row.get(6)?;
    let data: String = row.get(16)?;
    let metadata: String = row.get(17)?;

    Ok(ScheduledTask {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        task_type: type_str.parse().map_err(|e| text_error(3, e))?,
        schedule: row.get(4)?,
        command: row.get(5)?,
        status: status_str.parse().map_err(|e| text_error(6, e))?,
        enabled: row.get(7)?,
        retries: row.get::<_, i64>(8)? as u32,
        retry_delay_ms: row.get::<_, i64>(9)? as u64,
        timeout_ms: row.get::<_, i64>(10)? as u64,
        last_run: parse_opt_ts(row.get(11)?)?,
        next_run: parse_opt_ts(row.get(12)?)?,
        run_count: row.get::<_, i64>(13)? as u64,
        success_count: row.get::<_, i64>(14)? as u64,
        failure_count: row.get::<_, i64>(15)? as u64,
        data: serde_json::from_str(&data).map_err(|e| text_error(16, e.to_string()))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| text_error(17, e.to_string()))?,
        created_at: parse_ts(&row.get::<_, String>(18)?)?,
        updated_at: parse_ts(&row.get::<_, String>(19)?)?,
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskExecution> {
    let status_str: String = row.get(2)?;
    Ok(TaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: status_str.parse().map_err(|e| text_error(2, e))?,
        started_at: parse_ts(&row.get::<_, String>(3)?)?,
        completed_at: parse_opt_ts(row.get(4)?)?,
        duration_ms: row.get::<_, Option<i64>>(5)?.map(|d| d as u64),
        result: row.get(6)?,
        error: row.get(7)?,
        retry_count: row.get::<_, i64>(8)? as u32,
    })
}

fn text_error(column: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        reason.into(),
    )
}
