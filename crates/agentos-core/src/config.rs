use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3_600;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 30_000;

/// Top-level config (agentos.toml + AGENTOS_* env overrides).
///
/// Nested keys are addressed with a double underscore in env vars, e.g.
/// `AGENTOS_SCHEDULER__TICK_INTERVAL_MS=500`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentosConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatch engine and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the scan-and-dispatch tick.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum number of due tasks considered per tick.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    /// How long `stop()` waits for in-flight firings before giving up.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Executions older than this are purged by the retention sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Period of the retention sweep. `0` disables it.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Buffer size of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Tasks created on startup when no task with the same id exists.
    #[serde(default)]
    pub tasks: Vec<TaskSeed>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            page_limit: DEFAULT_PAGE_LIMIT,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            tasks: Vec::new(),
        }
    }
}

/// A declarative task definition from the config file.
///
/// `task_type` is optional; when absent the type is inferred from the
/// shape of `schedule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSeed {
    pub id: String,
    pub name: String,
    pub schedule: String,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Settings for the built-in shell command executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_page_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}
fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_shell() -> String {
    "sh".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.agentos/agentos.db", home)
}

impl AgentosConfig {
    /// Load config from a TOML file with AGENTOS_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.agentos/agentos.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AGENTOS_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.agentos/agentos.toml", home)
}
