use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    events::{EventBus, EventKind, SchedulerEvent},
    executor::CommandExecutor,
    registry::InFlightGuard,
    store::TaskStore,
    types::{CounterOutcome, ExecutionStatus, ExecutionUpdate, ScheduledTask, TaskExecution},
};

/// Runs one firing of a task to completion: execution record, attempts with
/// retry, counters, events.
#[derive(Clone)]
pub struct ExecutionManager {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn CommandExecutor>,
    events: EventBus,
}

impl ExecutionManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn CommandExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            executor,
            events,
        }
    }

    /// Execute `task` once, retrying failed attempts in place.
    ///
    /// `_slot` is the task's in-flight claim; it is released when this
    /// future finishes, whatever the outcome. Returns the finalised execution
    /// on success and `ExecutionExhausted` once every attempt has failed.
    pub async fn run_firing(
        &self,
        task: &ScheduledTask,
        _slot: InFlightGuard,
    ) -> Result<TaskExecution> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut execution = self
            .store
            .create_execution(&task.id, ExecutionStatus::Running, started_at)
            .await?;
        if let Err(e) = self.store.update_task_last_run(&task.id, started_at).await {
            warn!(task_id = %task.id, error = %e, "failed to record last_run");
        }
        self.events
            .emit(SchedulerEvent::new(EventKind::Executed, &task.id, &execution.id));
        info!(task_id = %task.id, execution_id = %execution.id, "firing started");

        let max_attempts = task.retries.saturating_add(1);
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            match self.attempt(task, attempt).await {
                Ok(output) => break Ok(output),
                Err(e) => {
                    if attempt < max_attempts {
                        warn!(
                            task_id = %task.id,
                            execution_id = %execution.id,
                            attempt,
                            retries = task.retries,
                            delay_ms = task.retry_delay_ms,
                            error = %e,
                            "attempt failed, retrying"
                        );
                        tokio::time::sleep(task.retry_delay()).await;
                    } else {
                        break Err(e);
                    }
                }
            }
        };

        let duration_ms = clock.elapsed().as_millis() as u64;
        let retry_count = attempt - 1;

        match outcome {
            Ok(output) => {
                let update = ExecutionUpdate::completed(output, duration_ms, retry_count);
                self.finish(task, &mut execution, update, CounterOutcome::Success)
                    .await;
                self.events.emit(
                    SchedulerEvent::new(EventKind::Completed, &task.id, &execution.id)
                        .with_data(serde_json::json!({
                            "duration_ms": duration_ms,
                            "attempts": attempt,
                        })),
                );
                info!(
                    task_id = %task.id,
                    execution_id = %execution.id,
                    attempts = attempt,
                    duration_ms,
                    "firing completed"
                );
                Ok(execution)
            }
            Err(last) => {
                let last_error = match last {
                    SchedulerError::ExecutionAttempt { reason, .. } => reason,
                    other => other.to_string(),
                };
                let update = ExecutionUpdate::failed(last_error.clone(), duration_ms, retry_count);
                self.finish(task, &mut execution, update, CounterOutcome::Failure)
                    .await;
                self.events.emit(
                    SchedulerEvent::new(EventKind::Failed, &task.id, &execution.id)
                        .with_data(serde_json::json!({
                            "duration_ms": duration_ms,
                            "attempts": attempt,
                            "error": last_error,
                        })),
                );
                error!(
                    task_id = %task.id,
                    execution_id = %execution.id,
                    attempts = attempt,
                    error = %last_error,
                    "firing failed, retries exhausted"
                );
                Err(SchedulerError::ExecutionExhausted {
                    task_id: task.id.clone(),
                    attempts: attempt,
                    last_error,
                })
            }
        }
    }

    /// One bounded call to the executor. A timeout is an ordinary failure.
    async fn attempt(&self, task: &ScheduledTask, attempt: u32) -> Result<String> {
        debug!(task_id = %task.id, attempt, "attempt starting");
        let budget = task.attempt_timeout();
        let call = self.executor.execute(&task.command, &task.data, budget);

        let outcome = match budget {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                SchedulerError::ExecutionAttempt {
                    attempt,
                    reason: format!("timed out after {}ms", limit.as_millis()),
                }
            })?,
            None => call.await,
        };

        if outcome.success {
            Ok(outcome.output.unwrap_or_default())
        } else {
            Err(SchedulerError::ExecutionAttempt {
                attempt,
                reason: outcome
                    .error
                    .unwrap_or_else(|| "command reported failure".to_string()),
            })
        }
    }

    /// Persist the terminal execution state and bump the task counters.
    ///
    /// Both writes are attempted independently; a failure is logged and the
    /// firing still reports its outcome.
    async fn finish(
        &self,
        task: &ScheduledTask,
        execution: &mut TaskExecution,
        update: ExecutionUpdate,
        outcome: CounterOutcome,
    ) {
        execution.status = update.status;
        execution.completed_at = update.completed_at;
        execution.duration_ms = update.duration_ms;
        execution.result = update.result.clone();
        execution.error = update.error.clone();
        execution.retry_count = update.retry_count;

        if let Err(e) = self.store.update_execution(&execution.id, update).await {
            error!(
                task_id = %task.id,
                execution_id = %execution.id,
                error = %e,
                "failed to record execution outcome"
            );
        }
        if let Err(e) = self.store.increment_task_counters(&task.id, outcome).await {
            error!(
                task_id = %task.id,
                execution_id = %execution.id,
                error = %e,
                "failed to update task counters"
            );
        }
    }
}
