//! `agentos-core` — configuration and shared error types for AgentOS.

pub mod config;
pub mod error;

pub use config::AgentosConfig;
pub use error::{CoreError, Result};
