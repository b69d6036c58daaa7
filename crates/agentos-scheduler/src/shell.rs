//! Shell-backed [`CommandExecutor`].
//!
//! Runs `<shell> -c <command>` through `tokio::process`, so a running command
//! never blocks the runtime. The task's `data` payload is exported to the
//! child as JSON in `AGENTOS_TASK_DATA`.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::executor::{CommandExecutor, CommandOutcome};

pub const TASK_DATA_ENV: &str = "AGENTOS_TASK_DATA";

pub struct ShellExecutor {
    shell: String,
    max_output_chars: usize,
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>, max_output_chars: usize) -> Self {
        Self {
            shell: shell.into(),
            max_output_chars,
        }
    }

    pub fn from_config(config: &agentos_core::config::ExecutorConfig) -> Self {
        Self::new(config.shell.clone(), config.max_output_chars)
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new("sh", agentos_core::config::DEFAULT_MAX_OUTPUT_CHARS)
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        data: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> CommandOutcome {
        let started = Instant::now();
        debug!(shell = %self.shell, "exec: {command}");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .env(TASK_DATA_ENV, data.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout drops the child, which kills it.
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => return CommandOutcome::failed(format!("spawn failed: {e}"), started.elapsed()),
        };

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "command timed out, killed");
                    return CommandOutcome::failed(
                        format!("timed out after {}ms", limit.as_millis()),
                        started.elapsed(),
                    );
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match output {
            Ok(o) => o,
            Err(e) => return CommandOutcome::failed(format!("wait failed: {e}"), started.elapsed()),
        };

        let stdout = clean_output(&output.stdout, self.max_output_chars);
        let stderr = clean_output(&output.stderr, self.max_output_chars);
        let duration = started.elapsed();

        if output.status.success() {
            CommandOutcome::ok(stdout, duration)
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            CommandOutcome::failed(
                format!("exit code {code}: {}", detail.trim()),
                duration,
            )
        }
    }
}

/// Strip ANSI escapes and clamp to `max_chars`, keeping both ends.
fn clean_output(raw: &[u8], max_chars: usize) -> String {
    let stripped = strip_ansi_escapes::strip(raw);
    let text = String::from_utf8_lossy(&stripped);

    let total = text.chars().count();
    if total <= max_chars {
        return text.into_owned();
    }
    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    format!("{head}\n... [{} chars omitted] ...\n{tail}", total - keep * 2)
}
