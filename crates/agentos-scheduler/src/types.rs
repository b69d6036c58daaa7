use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

/// How a task's `schedule` string is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// 5-field cron expression or `@daily`-style alias.
    Cron,
    /// Fixed period such as `30s`, `5m`, `2h`, `1d`.
    Interval,
    /// Fires a single time, then completes.
    Once,
    /// Never scheduled; fires only on explicit trigger.
    Manual,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Cron => "cron",
            TaskType::Interval => "interval",
            TaskType::Once => "once",
            TaskType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TaskType::Cron),
            "interval" => Ok(TaskType::Interval),
            "once" => Ok(TaskType::Once),
            "manual" => Ok(TaskType::Manual),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Lifecycle state of a task definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    /// No further runs (a once-task after its firing).
    Completed,
    /// The stored schedule could not be evaluated.
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "error" => Ok(TaskStatus::Error),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// State of a single execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Terminal outcome of a firing, used to bump the task counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Success,
    Failure,
}

/// A persisted task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// UUID v4 string unless supplied by a config seed — primary key.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub schedule: String,
    /// Opaque payload handed to the command executor.
    pub command: String,
    pub status: TaskStatus,
    pub enabled: bool,
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Per-attempt budget. `0` disables the limit.
    pub timeout_ms: u64,
    pub last_run: Option<DateTime<Utc>>,
    /// `None` means not currently scheduled.
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// A task fires only when it is both enabled and active.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.status == TaskStatus::Active
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Request to create a task. Fields left unset take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    /// Explicit id; a UUID is generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    /// Inferred from `schedule` when absent.
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub schedule: String,
    pub command: String,
    pub enabled: bool,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
}

impl NewTask {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            task_type: None,
            schedule: schedule.into(),
            command: command.into(),
            enabled: true,
            retries: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            data: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    pub fn with_retries(mut self, retries: u32, retry_delay_ms: u64) -> Self {
        self.retries = retries;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// One firing of a task, including all of its retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Command output, present only when `status == Completed`.
    pub result: Option<String>,
    /// Last attempt's error, present only when `status == Failed`.
    pub error: Option<String>,
    /// Attempts consumed beyond the first.
    pub retry_count: u32,
}

/// Terminal write for an execution record.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
}

impl ExecutionUpdate {
    pub fn completed(result: String, duration_ms: u64, retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            result: Some(result),
            error: None,
            retry_count,
        }
    }

    pub fn failed(error: String, duration_ms: u64, retry_count: u32) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            result: None,
            error: Some(error),
            retry_count,
        }
    }
}

/// Aggregate view over all tasks and executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub paused_tasks: u64,
    pub completed_tasks: u64,
    pub error_tasks: u64,
    pub enabled_tasks: u64,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_executions: u64,
    pub running_executions: u64,
    /// `success_count / run_count`, `0.0` when nothing has run yet.
    pub success_rate: f64,
}

impl TaskStats {
    pub fn compute_success_rate(success_count: u64, run_count: u64) -> f64 {
        if run_count == 0 {
            0.0
        } else {
            success_count as f64 / run_count as f64
        }
    }
}
