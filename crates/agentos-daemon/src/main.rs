use std::sync::Arc;
use std::time::Duration;

use agentos_core::AgentosConfig;
use agentos_scheduler::{DispatchEngine, EngineConfig, ShellExecutor, SqliteTaskStore};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod seed;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("AGENTOS_GIT_SHA"), ")");

#[derive(Parser)]
#[command(name = "agentos-daemon")]
#[command(about = "AgentOS task scheduler daemon")]
#[command(version = VERSION)]
struct Cli {
    /// Config file path (falls back to $AGENTOS_CONFIG, then ~/.agentos/agentos.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // load config: --config > AGENTOS_CONFIG env > ~/.agentos/agentos.toml
    let config_path = cli.config.or_else(|| std::env::var("AGENTOS_CONFIG").ok());
    let loaded = AgentosConfig::load(config_path.as_deref());
    let json_logs = loaded.as_ref().map(|c| c.logging.json).unwrap_or(false);
    init_tracing(json_logs);

    let config = loaded.unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        AgentosConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteTaskStore::open(db_path)?);

    let executor = Arc::new(ShellExecutor::from_config(&config.executor));
    let engine = DispatchEngine::new(store, executor, EngineConfig::from(&config.scheduler));

    let seeded = seed::seed_tasks(&engine, &config.scheduler.tasks).await;
    if seeded > 0 {
        info!(count = seeded, "seed tasks created");
    }

    tokio::spawn(log_events(engine.clone()));
    if config.scheduler.cleanup_interval_secs > 0 {
        tokio::spawn(retention_sweep(
            engine.clone(),
            config.scheduler.retention_days,
            Duration::from_secs(config.scheduler.cleanup_interval_secs),
        ));
    } else {
        info!("retention sweep disabled");
    }

    engine.start();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("AGENTOS_GIT_SHA"),
        "AgentOS scheduler running"
    );

    shutdown_signal().await;
    engine.stop().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "agentos_daemon=info,agentos_scheduler=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Forward lifecycle events to the log until the engine goes away.
async fn log_events(engine: DispatchEngine) {
    let mut rx = engine.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let data = event
                    .data
                    .as_ref()
                    .map(serde_json::Value::to_string)
                    .unwrap_or_default();
                info!(
                    event = ?event.kind,
                    task_id = %event.task_id,
                    execution_id = %event.execution_id,
                    %data,
                    "scheduler event"
                );
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Periodically prune finished executions past the retention window.
async fn retention_sweep(engine: DispatchEngine, retention_days: u32, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.cleanup_old_executions(retention_days).await {
            Ok(n) => debug!(removed = n, "retention sweep finished"),
            Err(e) => warn!("retention sweep failed: {e}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
