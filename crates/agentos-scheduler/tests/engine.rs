use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentos_scheduler::types::{CounterOutcome, ExecutionUpdate};
use agentos_scheduler::{
    CommandExecutor, CommandOutcome, DispatchEngine, EngineConfig, EventKind, ExecutionStatus,
    NewTask, ScheduledTask, SchedulerError, SqliteTaskStore, TaskExecution, TaskStats, TaskStatus,
    TaskStore, TaskType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

/// Fails the first `fail_first` calls, then succeeds.
struct Scripted {
    calls: AtomicUsize,
    fail_first: usize,
}

impl Scripted {
    fn new(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for Scripted {
    async fn execute(
        &self,
        _command: &str,
        _data: &serde_json::Value,
        _timeout: Option<Duration>,
    ) -> CommandOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            CommandOutcome::failed(format!("boom #{n}"), Duration::ZERO)
        } else {
            CommandOutcome::ok("ok", Duration::ZERO)
        }
    }
}

/// Blocks every call until the test hands out a permit.
struct Gated {
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
}

#[async_trait]
impl CommandExecutor for Gated {
    async fn execute(
        &self,
        _command: &str,
        _data: &serde_json::Value,
        _timeout: Option<Duration>,
    ) -> CommandOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        CommandOutcome::ok("released", Duration::ZERO)
    }
}

/// Never returns on its own.
struct Hanging;

#[async_trait]
impl CommandExecutor for Hanging {
    async fn execute(
        &self,
        _command: &str,
        _data: &serde_json::Value,
        _timeout: Option<Duration>,
    ) -> CommandOutcome {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// SQLite store whose schedule and execution writes can be made to fail.
struct FlakyStore {
    inner: SqliteTaskStore,
    fail_schedule_writes: AtomicBool,
    fail_execution_updates: AtomicBool,
}

impl FlakyStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteTaskStore::open_in_memory().unwrap(),
            fail_schedule_writes: AtomicBool::new(false),
            fail_execution_updates: AtomicBool::new(false),
        })
    }

    fn outage(what: &str) -> SchedulerError {
        SchedulerError::StoreUnavailable(format!("{what}: disk I/O error"))
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create_task(&self, task: &ScheduledTask) -> agentos_scheduler::Result<()> {
        self.inner.create_task(task).await
    }
    async fn get_task(&self, id: &str) -> agentos_scheduler::Result<Option<ScheduledTask>> {
        self.inner.get_task(id).await
    }
    async fn list_tasks(&self) -> agentos_scheduler::Result<Vec<ScheduledTask>> {
        self.inner.list_tasks().await
    }
    async fn delete_task(&self, id: &str) -> agentos_scheduler::Result<()> {
        self.inner.delete_task(id).await
    }
    async fn get_tasks_due_for_execution(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> agentos_scheduler::Result<Vec<ScheduledTask>> {
        self.inner.get_tasks_due_for_execution(now, limit).await
    }
    async fn update_task_next_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
    ) -> agentos_scheduler::Result<()> {
        if self.fail_schedule_writes.load(Ordering::SeqCst) {
            return Err(Self::outage("next_run"));
        }
        self.inner.update_task_next_run(id, next_run).await
    }
    async fn update_task_last_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
    ) -> agentos_scheduler::Result<()> {
        self.inner.update_task_last_run(id, last_run).await
    }
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> agentos_scheduler::Result<()> {
        if self.fail_schedule_writes.load(Ordering::SeqCst) {
            return Err(Self::outage("status"));
        }
        self.inner.update_task_status(id, status).await
    }
    async fn set_task_enabled(&self, id: &str, enabled: bool) -> agentos_scheduler::Result<()> {
        self.inner.set_task_enabled(id, enabled).await
    }
    async fn increment_task_counters(
        &self,
        id: &str,
        outcome: CounterOutcome,
    ) -> agentos_scheduler::Result<()> {
        self.inner.increment_task_counters(id, outcome).await
    }
    async fn create_execution(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        started_at: DateTime<Utc>,
    ) -> agentos_scheduler::Result<TaskExecution> {
        self.inner.create_execution(task_id, status, started_at).await
    }
    async fn update_execution(&self, id: &str, update: ExecutionUpdate) -> agentos_scheduler::Result<()> {
        if self.fail_execution_updates.load(Ordering::SeqCst) {
            return Err(Self::outage("execution"));
        }
        self.inner.update_execution(id, update).await
    }
    async fn get_execution(&self, id: &str) -> agentos_scheduler::Result<Option<TaskExecution>> {
        self.inner.get_execution(id).await
    }
    async fn list_executions(
        &self,
        task_id: &str,
        limit: usize,
    ) -> agentos_scheduler::Result<Vec<TaskExecution>> {
        self.inner.list_executions(task_id, limit).await
    }
    async fn get_task_stats(&self) -> agentos_scheduler::Result<TaskStats> {
        self.inner.get_task_stats().await
    }
    async fn cleanup_old_executions(&self, retention_days: u32) -> agentos_scheduler::Result<usize> {
        self.inner.cleanup_old_executions(retention_days).await
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        tick_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

fn setup(executor: Arc<dyn CommandExecutor>) -> (DispatchEngine, Arc<SqliteTaskStore>) {
    setup_with(executor, test_config())
}

fn setup_with(
    executor: Arc<dyn CommandExecutor>,
    config: EngineConfig,
) -> (DispatchEngine, Arc<SqliteTaskStore>) {
    let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
    let engine = DispatchEngine::new(store.clone(), executor, config);
    (engine, store)
}

async fn wait_until_in_flight(engine: &DispatchEngine, n: usize) {
    for _ in 0..500 {
        if engine.in_flight_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} firing(s) in flight");
}

async fn wait_until_idle(engine: &DispatchEngine) {
    for _ in 0..500 {
        if engine.in_flight_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("firings did not finish");
}

async fn make_due(store: &SqliteTaskStore, id: &str) {
    let past = Utc::now() - chrono::Duration::seconds(1);
    store.update_task_next_run(id, Some(past)).await.unwrap();
}

#[tokio::test]
async fn interval_task_advances_from_dispatch_time() {
    let (engine, store) = setup(Scripted::new(0));
    let before = Utc::now();
    let task = engine
        .create_task(NewTask::new("sync", "5m", "sync-repos"))
        .await
        .unwrap();

    assert_eq!(task.task_type, TaskType::Interval);
    let first = task.next_run.unwrap();
    assert!(first >= before + chrono::Duration::minutes(5));
    assert!(first <= Utc::now() + chrono::Duration::minutes(5));

    make_due(&store, &task.id).await;
    let dispatch_floor = Utc::now();
    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.dispatched, 1);

    // next_run is persisted by the tick itself, before the firing finishes.
    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert!(stored.next_run.unwrap() >= dispatch_floor + chrono::Duration::minutes(5));
    assert_eq!(stored.status, TaskStatus::Active);

    wait_until_idle(&engine).await;
}

#[tokio::test]
async fn once_task_fires_once_then_completes() {
    let exec = Scripted::new(0);
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("bootstrap", "now", "init"))
        .await
        .unwrap();
    assert_eq!(task.task_type, TaskType::Once);

    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.completed, 1);
    wait_until_idle(&engine).await;

    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.next_run.is_none());
    assert_eq!(stored.run_count, 1);
    assert!(stored.last_run.is_some());

    let again = engine.tick_once().await.unwrap();
    assert_eq!(again.due, 0);
    assert_eq!(exec.calls(), 1);
    assert!(engine.list_jobs().is_empty());
}

#[tokio::test]
async fn counters_add_up_across_firings() {
    let (engine, store) = setup(Scripted::new(1));
    let task = engine
        .create_task(NewTask::new("flaky", "1h", "flaky"))
        .await
        .unwrap();

    let first = engine.execute_task_now(&task.id).await;
    assert!(matches!(first, Err(SchedulerError::ExecutionExhausted { .. })));
    let second = engine.execute_task_now(&task.id).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);

    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.run_count, 2);
    assert_eq!(stored.success_count, 1);
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.success_count + stored.failure_count, stored.run_count);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total_executions, 2);
    assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn in_flight_task_is_not_dispatched_twice() {
    let gate = Arc::new(Semaphore::new(0));
    let exec = Arc::new(Gated {
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("slow", "1s", "slow"))
        .await
        .unwrap();

    make_due(&store, &task.id).await;
    let first = engine.tick_once().await.unwrap();
    assert_eq!(first.dispatched, 1);

    make_due(&store, &task.id).await;
    let second = engine.tick_once().await.unwrap();
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.skipped_in_flight, 1);

    assert!(matches!(
        engine.execute_task_now(&task.id).await,
        Err(SchedulerError::AlreadyRunning { .. })
    ));

    gate.add_permits(1);
    wait_until_idle(&engine).await;

    assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    let executions = store.list_executions(&task.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn failing_command_runs_retries_plus_one_attempts() {
    let exec = Scripted::new(usize::MAX);
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("doomed", "1h", "false").with_retries(2, 0))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let err = engine.execute_task_now(&task.id).await.unwrap_err();
    match err {
        SchedulerError::ExecutionExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, "boom #3");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(exec.calls(), 3);

    let executions = store.list_executions(&task.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(executions[0].retry_count, 2);
    assert!(executions[0].result.is_none());

    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.failure_count, 1);
    assert_eq!(stored.run_count, 1);

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Executed);
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Failed);
}

#[tokio::test(start_paused = true)]
async fn fails_twice_then_succeeds_with_retry_delay() {
    let exec = Scripted::new(2);
    let (engine, _store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("retrying", "1h", "deploy").with_retries(3, 1_000))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let started = tokio::time::Instant::now();
    let execution = engine.execute_task_now(&task.id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.retry_count, 2);
    assert_eq!(execution.result.as_deref(), Some("ok"));
    assert!(execution.error.is_none());
    assert_eq!(exec.calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));

    assert_eq!(events.recv().await.unwrap().kind, EventKind::Executed);
    let done = events.recv().await.unwrap();
    assert_eq!(done.kind, EventKind::Completed);
    assert_eq!(done.execution_id, execution.id);

    let task = engine.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!((task.run_count, task.success_count, task.failure_count), (1, 1, 0));
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_counts_as_failure() {
    let (engine, store) = setup(Arc::new(Hanging));
    let task = engine
        .create_task(NewTask::new("stuck", "1h", "hang").with_timeout_ms(50))
        .await
        .unwrap();

    let err = engine.execute_task_now(&task.id).await.unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");

    let executions = store.list_executions(&task.id, 10).await.unwrap();
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert!(executions[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(engine.in_flight_count(), 0);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let (engine, _store) = setup(Scripted::new(0));
    let task = engine
        .create_task(NewTask::new("hourly", "@hourly", "report"))
        .await
        .unwrap();

    assert!(!engine.is_healthy());
    engine.start();
    engine.start();
    assert!(engine.is_healthy());

    engine.add_job(&task.id).await.unwrap();
    engine.pause_job(&task.id).await.unwrap();
    assert_eq!(engine.list_jobs().len(), 1);

    engine.stop().await;
    assert!(!engine.is_healthy());
    assert!(engine.list_jobs().is_empty());

    engine.stop().await;
    assert!(!engine.is_healthy());

    engine.start();
    assert!(engine.is_healthy());
    engine.stop().await;
}

#[tokio::test]
async fn running_engine_fires_due_tasks_on_its_own() {
    let exec = Scripted::new(0);
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("asap", "now", "go"))
        .await
        .unwrap();

    engine.start();
    for _ in 0..200 {
        let t = store.get_task(&task.id).await.unwrap().unwrap();
        if t.run_count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.stop().await;

    let t = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(t.run_count, 1);
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(exec.calls(), 1);
}

#[tokio::test]
async fn paused_job_is_skipped_until_resumed() {
    let exec = Scripted::new(0);
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("nightly", "0 3 * * *", "backup"))
        .await
        .unwrap();
    assert_eq!(task.task_type, TaskType::Cron);

    engine.pause_job(&task.id).await.unwrap();
    make_due(&store, &task.id).await;
    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.skipped_paused, 1);
    assert_eq!(report.dispatched, 0);

    engine.resume_job(&task.id).unwrap();
    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
    wait_until_idle(&engine).await;
    assert_eq!(exec.calls(), 1);

    assert!(matches!(
        engine.resume_job("ghost"),
        Err(SchedulerError::JobNotFound { .. })
    ));
    assert!(matches!(
        engine.pause_job("ghost").await,
        Err(SchedulerError::JobNotFound { .. })
    ));
}

#[tokio::test]
async fn persisted_pause_excludes_task_from_due_query() {
    let (engine, store) = setup(Scripted::new(0));
    let task = engine
        .create_task(NewTask::new("weekly", "@weekly", "digest"))
        .await
        .unwrap();

    engine.pause_task(&task.id).await.unwrap();
    make_due(&store, &task.id).await;
    assert_eq!(engine.tick_once().await.unwrap().due, 0);

    engine.resume_task(&task.id).await.unwrap();
    engine.set_task_enabled(&task.id, false).await.unwrap();
    assert_eq!(engine.tick_once().await.unwrap().due, 0);

    engine.set_task_enabled(&task.id, true).await.unwrap();
    assert_eq!(engine.tick_once().await.unwrap().dispatched, 1);
    wait_until_idle(&engine).await;
}

#[tokio::test]
async fn manual_tasks_only_run_on_request() {
    let exec = Scripted::new(0);
    let (engine, _store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("adhoc", "", "cleanup").with_type(TaskType::Manual))
        .await
        .unwrap();
    assert!(task.next_run.is_none());

    assert_eq!(engine.tick_once().await.unwrap().due, 0);
    assert_eq!(exec.calls(), 0);

    engine.execute_task_now(&task.id).await.unwrap();
    assert_eq!(exec.calls(), 1);
}

#[tokio::test]
async fn malformed_schedules_are_rejected_at_creation() {
    let (engine, _store) = setup(Scripted::new(0));

    let bad_cron = engine
        .create_task(NewTask::new("bad", "61 * * * *", "x").with_type(TaskType::Cron))
        .await;
    assert!(matches!(bad_cron, Err(SchedulerError::ScheduleParse { .. })));

    let bad_interval = engine
        .create_task(NewTask::new("bad", "0m", "x").with_type(TaskType::Interval))
        .await;
    assert!(matches!(bad_interval, Err(SchedulerError::ScheduleParse { .. })));

    let bad_once = engine.create_task(NewTask::new("bad", "tomorrow", "x")).await;
    assert!(matches!(bad_once, Err(SchedulerError::ScheduleParse { .. })));

    assert!(engine.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_stored_schedule_marks_task_errored() {
    let (engine, store) = setup(Scripted::new(0));
    let now = Utc::now();
    let task = ScheduledTask {
        id: "corrupt".to_string(),
        name: "corrupt".to_string(),
        description: None,
        task_type: TaskType::Cron,
        schedule: "not a cron line".to_string(),
        command: "x".to_string(),
        status: TaskStatus::Active,
        enabled: true,
        retries: 0,
        retry_delay_ms: 0,
        timeout_ms: 0,
        last_run: None,
        next_run: Some(now - chrono::Duration::seconds(5)),
        run_count: 0,
        success_count: 0,
        failure_count: 0,
        data: serde_json::Value::Null,
        metadata: serde_json::Value::Null,
        created_at: now,
        updated_at: now,
    };
    store.create_task(&task).await.unwrap();

    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(report.dispatched, 0);
    let stored = store.get_task("corrupt").await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Error);
}

#[tokio::test]
async fn stats_over_empty_store_have_zero_rate() {
    let (engine, _store) = setup(Scripted::new(0));
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total_tasks, 0);
    assert_eq!(stats.run_count, 0);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn delete_task_removes_job_and_executions() {
    let (engine, store) = setup(Scripted::new(0));
    let task = engine
        .create_task(NewTask::new("temp", "10m", "x").with_id("temp"))
        .await
        .unwrap();
    engine.add_job("temp").await.unwrap();
    engine.execute_task_now("temp").await.unwrap();

    let dup = engine.create_task(NewTask::new("temp", "10m", "x").with_id("temp")).await;
    assert!(matches!(dup, Err(SchedulerError::InvalidTask(_))));

    engine.delete_task(&task.id).await.unwrap();
    assert!(engine.get_task("temp").await.unwrap().is_none());
    assert!(store.list_executions("temp", 10).await.unwrap().is_empty());
    assert!(engine.list_jobs().is_empty());
    assert!(matches!(
        engine.execute_task_now("temp").await,
        Err(SchedulerError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn far_future_interval_is_rejected_and_does_not_block_dispatch() {
    let exec = Scripted::new(0);
    let (engine, _store) = setup(exec.clone());

    let far = engine.create_task(NewTask::new("far", "4000000d", "x")).await;
    assert!(matches!(far, Err(SchedulerError::ScheduleParse { .. })));

    let task = engine
        .create_task(NewTask::new("soon", "now", "x"))
        .await
        .unwrap();
    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
    wait_until_idle(&engine).await;
    assert_eq!(engine.get_task(&task.id).await.unwrap().unwrap().run_count, 1);
}

#[tokio::test]
async fn paused_jobs_do_not_starve_the_page() {
    let exec = Scripted::new(0);
    let config = EngineConfig {
        page_limit: 1,
        ..test_config()
    };
    let (engine, store) = setup_with(exec.clone(), config);

    let paused = engine
        .create_task(NewTask::new("paused", "1h", "a"))
        .await
        .unwrap();
    let runnable = engine
        .create_task(NewTask::new("runnable", "1h", "b"))
        .await
        .unwrap();
    engine.pause_job(&paused.id).await.unwrap();

    // The paused task is due earlier, so it sorts first.
    let now = Utc::now();
    store
        .update_task_next_run(&paused.id, Some(now - chrono::Duration::seconds(60)))
        .await
        .unwrap();
    store
        .update_task_next_run(&runnable.id, Some(now - chrono::Duration::seconds(1)))
        .await
        .unwrap();

    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.skipped_paused, 1);
    assert_eq!(report.dispatched, 1);
    wait_until_idle(&engine).await;

    assert_eq!(exec.calls(), 1);
    let runnable = store.get_task(&runnable.id).await.unwrap().unwrap();
    assert_eq!(runnable.run_count, 1);
    let paused = store.get_task(&paused.id).await.unwrap().unwrap();
    assert_eq!(paused.run_count, 0);
}

#[tokio::test]
async fn page_limit_caps_dispatches_per_tick() {
    let exec = Scripted::new(0);
    let config = EngineConfig {
        page_limit: 2,
        ..test_config()
    };
    let (engine, _store) = setup_with(exec.clone(), config);
    for i in 0..3 {
        engine
            .create_task(NewTask::new(format!("t{i}"), "now", "x"))
            .await
            .unwrap();
    }

    assert_eq!(engine.tick_once().await.unwrap().dispatched, 2);
    wait_until_idle(&engine).await;
    assert_eq!(engine.tick_once().await.unwrap().dispatched, 1);
    wait_until_idle(&engine).await;
    assert_eq!(exec.calls(), 3);
}

#[tokio::test]
async fn stop_gives_up_on_hung_firing_after_drain_timeout() {
    let config = EngineConfig {
        drain_timeout: Duration::from_millis(150),
        ..test_config()
    };
    let (engine, _store) = setup_with(Arc::new(Hanging), config);
    engine
        .create_task(NewTask::new("hung", "now", "x").with_timeout_ms(0))
        .await
        .unwrap();

    engine.start();
    wait_until_in_flight(&engine, 1).await;

    let started = std::time::Instant::now();
    engine.stop().await;
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(!engine.is_healthy());
    assert!(engine.list_jobs().is_empty());
    assert_eq!(engine.in_flight_count(), 1);
}

#[tokio::test]
async fn stop_waits_for_firing_that_finishes_in_time() {
    let gate = Arc::new(Semaphore::new(0));
    let exec = Arc::new(Gated {
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let (engine, store) = setup(exec.clone());
    let task = engine
        .create_task(NewTask::new("slow", "now", "x"))
        .await
        .unwrap();

    engine.start();
    wait_until_in_flight(&engine, 1).await;

    let release = {
        let gate = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.add_permits(1);
        })
    };

    let started = std::time::Instant::now();
    engine.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(engine.in_flight_count(), 0);
    assert!(!engine.is_healthy());
    release.await.unwrap();

    let executions = store.list_executions(&task.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn tick_survives_failed_schedule_writes() {
    let exec = Scripted::new(0);
    let store = FlakyStore::new();
    let engine = DispatchEngine::new(store.clone(), exec.clone(), test_config());

    let once = engine
        .create_task(NewTask::new("once", "now", "x"))
        .await
        .unwrap();
    let every = engine
        .create_task(NewTask::new("every", "1h", "y"))
        .await
        .unwrap();
    store
        .update_task_next_run(&every.id, Some(Utc::now() - chrono::Duration::seconds(1)))
        .await
        .unwrap();

    store.fail_schedule_writes.store(true, Ordering::SeqCst);
    let report = engine.tick_once().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.dispatched, 2);
    wait_until_idle(&engine).await;
    assert_eq!(exec.calls(), 2);

    for id in [&once.id, &every.id] {
        let t = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(t.run_count, 1, "{id}");
    }
}

#[tokio::test]
async fn counters_are_bumped_when_execution_update_fails() {
    let store = FlakyStore::new();
    let engine = DispatchEngine::new(store.clone(), Scripted::new(0), test_config());
    let task = engine
        .create_task(NewTask::new("partial", "1h", "x"))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    store.fail_execution_updates.store(true, Ordering::SeqCst);
    let execution = engine.execute_task_now(&task.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let stored = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!((stored.run_count, stored.success_count), (1, 1));
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Executed);
    assert_eq!(events.recv().await.unwrap().kind, EventKind::Completed);
}
