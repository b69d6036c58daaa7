use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentos_core::config::SchedulerConfig;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    events::{EventBus, SchedulerEvent},
    executor::CommandExecutor,
    lifecycle::ExecutionManager,
    registry::{InFlightGuard, InFlightSet, JobEntry, JobRegistry},
    schedule::{compute_next_run, infer_type, validate},
    store::TaskStore,
    types::{NewTask, ScheduledTask, TaskExecution, TaskStats, TaskStatus},
};

/// Tunables for [`DispatchEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    /// Maximum number of due tasks dispatched per tick.
    pub page_limit: usize,
    /// How long `stop()` waits for in-flight firings.
    pub drain_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(cfg.tick_interval_ms.max(1)),
            page_limit: cfg.page_limit.max(1),
            drain_timeout: Duration::from_secs(cfg.drain_timeout_secs),
            event_capacity: cfg.event_capacity,
        }
    }
}

/// What a single tick did. Counts are per task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_in_flight: usize,
    pub skipped_paused: usize,
    /// Tasks moved to `completed` because they have no further run.
    pub completed: usize,
    /// Tasks moved to `error` because their stored schedule no longer parses.
    pub errored: usize,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    lifecycle: ExecutionManager,
    events: EventBus,
    in_flight: Arc<InFlightSet>,
    jobs: JobRegistry,
    config: EngineConfig,
    state: Mutex<Option<Running>>,
}

/// Drives due tasks from the store into firings on a fixed tick.
///
/// Cheap to clone; every clone controls the same engine.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<Inner>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn CommandExecutor>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let lifecycle = ExecutionManager::new(Arc::clone(&store), executor, events.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                lifecycle,
                events,
                in_flight: InFlightSet::new(),
                jobs: JobRegistry::new(),
                config,
                state: Mutex::new(None),
            }),
        }
    }

    // --- run state ---------------------------------------------------------

    /// Start the tick loop. Calling it on a running engine does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if state.is_some() {
            debug!("dispatch engine already running");
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let period = self.inner.config.tick_interval;

        let handle = tokio::spawn(async move {
            info!(tick_ms = period.as_millis() as u64, "dispatch engine started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match engine.tick_once().await {
                            Ok(report) if report.due > 0 => debug!(?report, "tick"),
                            Ok(_) => {}
                            Err(e) if e.is_transient() => {
                                warn!("dispatch tick failed, retrying next tick: {e}")
                            }
                            Err(e) => error!("dispatch tick failed: {e}"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("dispatch loop exited");
        });

        *state = Some(Running { shutdown, handle });
    }

    /// Stop the tick loop and wait for in-flight firings to finish, bounded
    /// by the drain timeout. Calling it on a stopped engine does nothing.
    ///
    /// The job registry is cleared, so registry-level pauses do not survive
    /// a restart.
    pub async fn stop(&self) {
        let running = self.lock_state().take();
        let Some(running) = running else {
            debug!("dispatch engine already stopped");
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            error!("dispatch loop panicked: {e}");
        }
        self.inner.jobs.clear();

        let limit = self.inner.config.drain_timeout;
        if self.inner.in_flight.wait_idle(limit).await {
            info!("dispatch engine stopped");
        } else {
            warn!(
                in_flight = self.inner.in_flight.len(),
                drain_secs = limit.as_secs(),
                "dispatch engine stopped with firings still running"
            );
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.lock_state().is_some()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- dispatch ----------------------------------------------------------

    /// Run one tick now: fire every due task and advance its schedule.
    ///
    /// At most `page_limit` tasks are dispatched or errored per tick. Paused
    /// and in-flight tasks stay due, so the query over-fetches by their count
    /// and they never take the place of a runnable task.
    ///
    /// Fails only when the due query itself fails; per-task store errors are
    /// logged and the remaining tasks are still processed.
    pub async fn tick_once(&self) -> Result<TickReport> {
        let inner = &self.inner;
        let now = Utc::now();
        let page_limit = inner.config.page_limit;
        let fetch = page_limit
            .saturating_add(inner.jobs.paused_count())
            .saturating_add(inner.in_flight.len());
        let due = inner.store.get_tasks_due_for_execution(now, fetch).await?;

        let mut report = TickReport::default();

        for task in due {
            if report.dispatched + report.errored >= page_limit {
                break;
            }
            report.due += 1;

            if !task.is_runnable() {
                debug!(task_id = %task.id, "store returned a task that cannot run, skipped");
                continue;
            }
            if inner.jobs.ensure(&task.id) {
                debug!(task_id = %task.id, "job registered");
            }
            if inner.jobs.is_active(&task.id) == Some(false) {
                report.skipped_paused += 1;
                continue;
            }
            if inner.in_flight.contains(&task.id) {
                debug!(task_id = %task.id, "previous firing still running, skipped");
                report.skipped_in_flight += 1;
                continue;
            }

            let next = match compute_next_run(task.task_type, &task.schedule, now, Some(now)) {
                Ok(next) => next,
                Err(e) => {
                    error!(task_id = %task.id, "stored schedule is invalid: {e}");
                    if let Err(e) = inner.store.update_task_status(&task.id, TaskStatus::Error).await {
                        error!(task_id = %task.id, "failed to mark task errored: {e}");
                    }
                    inner.jobs.remove(&task.id);
                    report.errored += 1;
                    continue;
                }
            };

            let Some(slot) = inner.in_flight.try_acquire(&task.id) else {
                report.skipped_in_flight += 1;
                continue;
            };

            // Advance the schedule before the firing can finish.
            if let Err(e) = inner.store.update_task_next_run(&task.id, next).await {
                error!(task_id = %task.id, "failed to persist next_run: {e}");
            }
            if next.is_none() {
                if let Err(e) = inner
                    .store
                    .update_task_status(&task.id, TaskStatus::Completed)
                    .await
                {
                    error!(task_id = %task.id, "failed to mark task completed: {e}");
                }
                inner.jobs.remove(&task.id);
                report.completed += 1;
            } else {
                inner.jobs.mark_dispatched(&task.id, now);
            }

            info!(
                task_id = %task.id,
                name = %task.name,
                next_run = ?next,
                "dispatching task"
            );
            self.spawn_firing(task, slot);
            report.dispatched += 1;
        }

        Ok(report)
    }

    fn spawn_firing(&self, task: ScheduledTask, slot: InFlightGuard) {
        let lifecycle = self.inner.lifecycle.clone();
        tokio::spawn(async move {
            match lifecycle.run_firing(&task, slot).await {
                Ok(_) | Err(SchedulerError::ExecutionExhausted { .. }) => {}
                Err(e) => error!(task_id = %task.id, "firing aborted: {e}"),
            }
        });
    }

    /// Fire `id` immediately, ignoring its schedule, and wait for the outcome.
    ///
    /// `next_run` is left untouched.
    pub async fn execute_task_now(&self, id: &str) -> Result<TaskExecution> {
        let task = self.require_task(id).await?;
        let slot = self
            .inner
            .in_flight
            .try_acquire(id)
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: id.to_string() })?;
        self.inner.jobs.mark_dispatched(id, Utc::now());
        info!(task_id = %id, "manual execution requested");
        self.inner.lifecycle.run_firing(&task, slot).await
    }

    // --- job controls ------------------------------------------------------

    /// Register an engine job for an existing task.
    pub async fn add_job(&self, id: &str) -> Result<JobEntry> {
        self.require_task(id).await?;
        self.inner.jobs.ensure(id);
        info!(task_id = %id, "job added");
        self.inner
            .jobs
            .get(id)
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub fn remove_job(&self, id: &str) -> Result<()> {
        if !self.inner.jobs.remove(id) {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "job removed");
        Ok(())
    }

    /// Stop dispatching `id` without touching its stored status.
    ///
    /// A task the engine has not seen yet is registered in the paused state.
    pub async fn pause_job(&self, id: &str) -> Result<()> {
        if !self.inner.jobs.set_active(id, false) {
            if self.inner.store.get_task(id).await?.is_none() {
                return Err(SchedulerError::JobNotFound { id: id.to_string() });
            }
            self.inner.jobs.ensure(id);
            self.inner.jobs.set_active(id, false);
        }
        info!(task_id = %id, "job paused");
        Ok(())
    }

    pub fn resume_job(&self, id: &str) -> Result<()> {
        if !self.inner.jobs.set_active(id, true) {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(task_id = %id, "job resumed");
        Ok(())
    }

    pub fn list_jobs(&self) -> Vec<JobEntry> {
        self.inner.jobs.snapshot()
    }

    // --- task management ---------------------------------------------------

    /// Validate, schedule and persist a new task.
    pub async fn create_task(&self, new: NewTask) -> Result<ScheduledTask> {
        if new.name.trim().is_empty() {
            return Err(SchedulerError::InvalidTask("name must not be empty".into()));
        }
        let task_type = new.task_type.unwrap_or_else(|| infer_type(&new.schedule));
        validate(task_type, &new.schedule)?;

        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.inner.store.get_task(&id).await?.is_some() {
            return Err(SchedulerError::InvalidTask(format!("task {id} already exists")));
        }

        let now = Utc::now();
        let next_run = compute_next_run(task_type, &new.schedule, now, None)?;
        let task = ScheduledTask {
            id,
            name: new.name,
            description: new.description,
            task_type,
            schedule: new.schedule,
            command: new.command,
            status: TaskStatus::Active,
            enabled: new.enabled,
            retries: new.retries,
            retry_delay_ms: new.retry_delay_ms,
            timeout_ms: new.timeout_ms,
            last_run: None,
            next_run,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            data: new.data,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };

        self.inner.store.create_task(&task).await?;
        info!(
            task_id = %task.id,
            name = %task.name,
            task_type = %task.task_type,
            next_run = ?task.next_run,
            "task created"
        );
        Ok(task)
    }

    /// Delete a task, its executions and its job entry.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.inner.store.delete_task(id).await?;
        self.inner.jobs.remove(id);
        info!(task_id = %id, "task deleted");
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.inner.store.get_task(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.inner.store.list_tasks().await
    }

    pub async fn list_executions(&self, task_id: &str, limit: usize) -> Result<Vec<TaskExecution>> {
        self.inner.store.list_executions(task_id, limit).await
    }

    /// Persistently pause a task. Survives restarts, unlike [`Self::pause_job`].
    pub async fn pause_task(&self, id: &str) -> Result<()> {
        self.inner.store.update_task_status(id, TaskStatus::Paused).await?;
        info!(task_id = %id, "task paused");
        Ok(())
    }

    /// Reactivate a paused or errored task. Completed tasks stay completed.
    pub async fn resume_task(&self, id: &str) -> Result<()> {
        let task = self.require_task(id).await?;
        if task.status == TaskStatus::Completed {
            return Err(SchedulerError::InvalidTask(format!(
                "task {id} is completed and cannot be resumed"
            )));
        }
        self.inner.store.update_task_status(id, TaskStatus::Active).await?;
        info!(task_id = %id, "task resumed");
        Ok(())
    }

    pub async fn set_task_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.inner.store.set_task_enabled(id, enabled).await?;
        info!(task_id = %id, enabled, "task enabled flag changed");
        Ok(())
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.inner.store.get_task_stats().await
    }

    /// Drop finished execution records older than `retention_days`.
    pub async fn cleanup_old_executions(&self, retention_days: u32) -> Result<usize> {
        let removed = self.inner.store.cleanup_old_executions(retention_days).await?;
        if removed > 0 {
            info!(removed, retention_days, "old executions pruned");
        }
        Ok(removed)
    }

    // --- events ------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    async fn require_task(&self, id: &str) -> Result<ScheduledTask> {
        self.inner
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }
}
