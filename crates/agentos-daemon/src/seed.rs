use std::str::FromStr;

use agentos_core::config::TaskSeed;
use agentos_scheduler::{DispatchEngine, NewTask, TaskType};
use agentos_scheduler::types::{DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS};
use tracing::{info, warn};

/// Create every configured task whose id is not in the store yet.
///
/// A bad seed is logged and skipped; it never stops the daemon.
/// Returns the number of tasks created.
pub async fn seed_tasks(engine: &DispatchEngine, seeds: &[TaskSeed]) -> usize {
    let mut created = 0;
    for seed in seeds {
        match engine.get_task(&seed.id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                warn!(task_id = %seed.id, "seed lookup failed: {e}");
                continue;
            }
        }

        let new = match to_new_task(seed) {
            Ok(n) => n,
            Err(e) => {
                warn!(task_id = %seed.id, "invalid seed: {e}");
                continue;
            }
        };
        match engine.create_task(new).await {
            Ok(task) => {
                info!(task_id = %task.id, name = %task.name, "seeded task");
                created += 1;
            }
            Err(e) => warn!(task_id = %seed.id, "failed to seed task: {e}"),
        }
    }
    created
}

fn to_new_task(seed: &TaskSeed) -> Result<NewTask, String> {
    let mut new = NewTask::new(seed.name.clone(), seed.schedule.clone(), seed.command.clone())
        .with_id(seed.id.clone())
        .with_retries(
            seed.retries,
            seed.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        )
        .with_timeout_ms(seed.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));

    if let Some(ref t) = seed.task_type {
        new = new.with_type(TaskType::from_str(t)?);
    }
    if let Some(ref d) = seed.description {
        new = new.with_description(d.clone());
    }
    if let Some(ref data) = seed.data {
        new = new.with_data(data.clone());
    }
    if !seed.enabled {
        new = new.disabled();
    }
    Ok(new)
}
