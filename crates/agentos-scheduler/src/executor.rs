use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of one command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn ok(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }
}

/// The work a task ultimately invokes.
///
/// `timeout` is advisory for implementations: the lifecycle manager also
/// enforces it around the call, so an executor that ignores it is still
/// bounded. `None` means no limit.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        data: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> CommandOutcome;
}
