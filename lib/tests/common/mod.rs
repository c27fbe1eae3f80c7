//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use terminal_agent_lib::config::StateStoreConfig;
use terminal_agent_lib::testing::FakeSandbox;
use terminal_agent_lib::{TerminalConfig, TerminalManager, TerminalToolHandler};

/// Default configuration with poll intervals short enough for tests
pub fn fast_config() -> TerminalConfig {
    let mut config = TerminalConfig::default();
    config.polling.batch_interval_ms = 5;
    config.polling.stream_interval_ms = 5;
    config
}

/// Fast configuration persisting pending state as files under `dir`
pub fn file_store_config(dir: &std::path::Path) -> TerminalConfig {
    let mut config = fast_config();
    config.state = StateStoreConfig::File {
        dir: dir.to_path_buf(),
    };
    config
}

pub fn create_manager(scope: &str, sandbox: &Arc<FakeSandbox>) -> TerminalManager {
    TerminalManager::new(scope, sandbox.clone(), fast_config()).unwrap()
}

pub fn create_handler(scope: &str, sandbox: &Arc<FakeSandbox>) -> TerminalToolHandler {
    TerminalToolHandler::new(create_manager(scope, sandbox))
}
