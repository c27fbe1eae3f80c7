//! Terminal Agent Library
//!
//! Persistent, multiplexed shell sessions for an agent that can only run
//! one-off commands in a remote sandbox. Sessions live in tmux inside the
//! sandbox; the [`TerminalManager`] creates and reuses them, runs commands
//! with sentinel-based completion detection, and persists pending-command
//! state so a fresh manager instance can pick up where another left off.
//! [`tools`] exposes everything as a single action-dispatch surface and
//! [`server`] serves it as JSON lines.

pub mod backend;
pub mod cleaner;
pub mod config;
pub mod error;
mod exec_engine;
pub mod framing;
pub mod keys;
pub mod multiplexer;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod state_store;
pub mod terminal_manager;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod tools;
mod wait_engine;

pub use config::TerminalConfig;
pub use error::{Result, TerminalError};
pub use registry::SessionInfo;
pub use sandbox::{DockerSandbox, LocalSandbox, OutputSink, RunOptions, RunOutput, Sandbox};
pub use server::TerminalAgentServer;
pub use state_store::{BackendEnvStore, FileStateStore, PendingState, StateStore};
pub use terminal_manager::{CommandOutcome, TerminalManager};
pub use tools::{TerminalAction, TerminalToolHandler, TerminalToolResult};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = TerminalConfig::default();
        assert_eq!(config.multiplexer.binary, "tmux");
        assert_eq!(config.session_prefix, "ta");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manager_creation() {
        let sandbox = Arc::new(testing::FakeSandbox::new());
        let manager = TerminalManager::new("chat-42", sandbox, TerminalConfig::default()).unwrap();
        assert_eq!(manager.scope_id(), "chat-42");
        assert_eq!(manager.backend_name_for("s0"), "ta-chat-42-s0");
    }

    #[test]
    fn test_manager_rejects_unusable_scope() {
        let sandbox = Arc::new(testing::FakeSandbox::new());
        let long = "c".repeat(80);
        for scope in ["!!!", "chat.1", "chat 1", long.as_str()] {
            let result = TerminalManager::new(scope, sandbox.clone(), TerminalConfig::default());
            assert!(matches!(result, Err(TerminalError::InvalidInput(_))), "{:?}", scope);
        }
    }

    #[test]
    fn test_custom_config() {
        let mut config = TerminalConfig::default();
        config.polling.batch_interval_ms = 250;
        config.limits.max_timeout_secs = 60;

        let sandbox = Arc::new(testing::FakeSandbox::new());
        let manager = TerminalManager::new("chat", sandbox, config).unwrap();
        assert_eq!(manager.config().polling.batch_interval_ms, 250);
        assert_eq!(
            manager.config().limits.clamp_timeout(3600),
            std::time::Duration::from_secs(60)
        );
    }
}
