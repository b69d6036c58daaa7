use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A firing started and its execution record exists.
    Executed,
    Completed,
    Failed,
}

/// Lifecycle notification for status views and notification layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SchedulerEvent {
    pub fn new(kind: EventKind, task_id: &str, execution_id: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Best-effort fan-out of [`SchedulerEvent`]s over a tokio broadcast channel.
///
/// Emitting never blocks. Events are dropped when nobody is subscribed, and a
/// subscriber that falls more than `capacity` events behind skips ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(agentos_core::config::DEFAULT_EVENT_CAPACITY)
    }
}
