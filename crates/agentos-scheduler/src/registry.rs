//! In-process bookkeeping: the in-flight set and the job registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Task ids with a firing in progress.
///
/// The tick inserts and the lifecycle manager removes from different tokio
/// tasks, so membership lives in a `DashSet`; `Notify` wakes `stop()` when
/// the set drains.
#[derive(Default)]
pub struct InFlightSet {
    ids: DashSet<String>,
    idle: Notify,
}

impl InFlightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot for `task_id`. `None` if a firing already holds it.
    pub fn try_acquire(self: &Arc<Self>, task_id: &str) -> Option<InFlightGuard> {
        if !self.ids.insert(task_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(self),
            task_id: task_id.to_string(),
        })
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.ids.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Wait until no firing is in flight. Returns `false` if `limit` elapsed first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                // Register before checking so a release in between is not missed.
                notified.as_mut().enable();
                if self.ids.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, drained).await.is_ok()
    }
}

/// Holds a task's in-flight slot; dropping it releases the slot on every
/// exit path of a firing, panics included.
pub struct InFlightGuard {
    set: Arc<InFlightSet>,
    task_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.ids.remove(&self.task_id);
        if self.set.ids.is_empty() {
            self.set.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard").field("task_id", &self.task_id).finish()
    }
}

/// In-memory entry for a task the engine has seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub task_id: String,
    /// `false` while paused: the tick skips the task but keeps the entry.
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub last_dispatched: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task_id` if absent. Returns `true` when a new entry was made.
    pub fn ensure(&self, task_id: &str) -> bool {
        let mut created = false;
        self.jobs.entry(task_id.to_string()).or_insert_with(|| {
            created = true;
            JobEntry {
                task_id: task_id.to_string(),
                active: true,
                registered_at: Utc::now(),
                last_dispatched: None,
            }
        });
        created
    }

    pub fn remove(&self, task_id: &str) -> bool {
        self.jobs.remove(task_id).is_some()
    }

    /// Flip the active flag. Returns `false` if the job is not registered.
    pub fn set_active(&self, task_id: &str, active: bool) -> bool {
        match self.jobs.get_mut(task_id) {
            Some(mut entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, task_id: &str) -> Option<bool> {
        self.jobs.get(task_id).map(|e| e.active)
    }

    /// Number of registered jobs currently paused.
    pub fn paused_count(&self) -> usize {
        self.jobs.iter().filter(|e| !e.active).count()
    }

    pub fn mark_dispatched(&self, task_id: &str, at: DateTime<Utc>) {
        if let Some(mut entry) = self.jobs.get_mut(task_id) {
            entry.last_dispatched = Some(at);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<JobEntry> {
        self.jobs.get(task_id).map(|e| e.clone())
    }

    /// Snapshot of all entries, sorted by task id for stable output.
    pub fn snapshot(&self) -> Vec<JobEntry> {
        let mut entries: Vec<JobEntry> = self.jobs.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        entries
    }

    pub fn clear(&self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
