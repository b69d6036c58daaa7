use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    CounterOutcome, ExecutionStatus, ExecutionUpdate, ScheduledTask, TaskExecution, TaskStats,
    TaskStatus,
};

/// Persistence for task definitions and execution records.
///
/// Implementations must tolerate concurrent calls from the dispatch tick and
/// from any number of simultaneous firings; the engine adds no locking of its
/// own beyond the in-flight set.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &ScheduledTask) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>>;

    /// All tasks, oldest first.
    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>>;

    /// Delete a task and its executions. Returns `TaskNotFound` if absent.
    async fn delete_task(&self, id: &str) -> Result<()>;

    /// Enabled, active, non-manual tasks whose `next_run` is unset or at or
    /// before `now`, ordered by `next_run` ascending.
    async fn get_tasks_due_for_execution(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledTask>>;

    async fn update_task_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()>;

    async fn update_task_last_run(&self, id: &str, last_run: DateTime<Utc>) -> Result<()>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()>;

    async fn set_task_enabled(&self, id: &str, enabled: bool) -> Result<()>;

    /// Bump `run_count` and exactly one of the outcome counters, atomically.
    async fn increment_task_counters(&self, id: &str, outcome: CounterOutcome) -> Result<()>;

    async fn create_execution(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        started_at: DateTime<Utc>,
    ) -> Result<TaskExecution>;

    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>>;

    /// Most recent executions of a task, newest first.
    async fn list_executions(&self, task_id: &str, limit: usize) -> Result<Vec<TaskExecution>>;

    async fn get_task_stats(&self) -> Result<TaskStats>;

    /// Purge finished executions that started more than `retention_days` ago.
    /// Returns the number of rows removed.
    async fn cleanup_old_executions(&self, retention_days: u32) -> Result<usize>;
}
