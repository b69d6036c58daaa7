use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The schedule string does not fit the grammar of its task type.
    /// Raised at task creation, never retried.
    #[error("Invalid schedule '{schedule}': {reason}")]
    ScheduleParse { schedule: String, reason: String },

    /// A single attempt failed or timed out. Recovered locally by the retry policy.
    #[error("Attempt {attempt} failed: {reason}")]
    ExecutionAttempt { attempt: u32, reason: String },

    /// Every attempt of a firing failed. Persisted as a failed execution.
    #[error("Task {task_id} failed after {attempts} attempt(s): {last_error}")]
    ExecutionExhausted {
        task_id: String,
        attempts: u32,
        last_error: String,
    },

    /// A Task Store call failed.
    #[error("Task store unavailable: {0}")]
    StoreUnavailable(String),

    /// No task with the given ID exists in the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// No job with the given ID is registered with the engine.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A firing for this task is already in flight.
    #[error("Task already running: {id}")]
    AlreadyRunning { id: String },

    /// The task definition is rejected for a reason other than its schedule.
    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

impl SchedulerError {
    pub(crate) fn schedule(schedule: &str, reason: impl Into<String>) -> Self {
        SchedulerError::ScheduleParse {
            schedule: schedule.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the dispatch loop may recover from this error on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SchedulerError::StoreUnavailable(_) | SchedulerError::ExecutionAttempt { .. }
        )
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::StoreUnavailable(format!("corrupt JSON column: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
