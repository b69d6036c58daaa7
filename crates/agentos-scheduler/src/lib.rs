//! `agentos-scheduler` — cron dispatch engine with pluggable persistence.
//!
//! # Overview
//!
//! Tasks live in a [`store::TaskStore`] (SQLite by default). The
//! [`engine::DispatchEngine`] ticks once per second, selects due tasks,
//! advances their `next_run`, and hands each firing to the
//! [`lifecycle::ExecutionManager`], which runs the command through a
//! [`executor::CommandExecutor`] with retries and records the outcome.
//!
//! # Task types
//!
//! | Type       | Schedule                              | Next run                         |
//! |------------|---------------------------------------|----------------------------------|
//! | `cron`     | 5-field expression or `@daily` etc.   | Next matching minute (UTC)       |
//! | `interval` | `30s`, `5m`, `2h`, `1d`               | `last_run + interval`            |
//! | `once`     | `now`, empty, or RFC 3339 instant     | Fires once, then `completed`     |
//! | `manual`   | ignored                               | Never; only `execute_task_now`   |

pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod registry;
pub mod schedule;
pub mod shell;
pub mod sqlite;
pub mod store;
pub mod types;

pub use engine::{DispatchEngine, EngineConfig, TickReport};
pub use error::{Result, SchedulerError};
pub use events::{EventBus, EventKind, SchedulerEvent};
pub use executor::{CommandExecutor, CommandOutcome};
pub use lifecycle::ExecutionManager;
pub use registry::JobEntry;
pub use shell::ShellExecutor;
pub use sqlite::SqliteTaskStore;
pub use store::TaskStore;
pub use types::{
    ExecutionStatus, NewTask, ScheduledTask, TaskExecution, TaskStats, TaskStatus, TaskType,
};
