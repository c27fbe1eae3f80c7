//! Configuration types for the terminal session manager

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub multiplexer: MultiplexerConfig,
    pub polling: PollingConfig,
    pub limits: LimitsConfig,
    pub state: StateStoreConfig,
    /// Prefix for every derived backend session name
    pub session_prefix: String,
    pub log_level: String,
}

/// How to reach the terminal multiplexer inside the sandbox
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Binary name looked up on PATH
    pub binary: String,
    /// Well-known absolute location probed when PATH lookup fails
    pub fallback_path: String,
    pub cols: u16,
    pub rows: u16,
    /// Scrollback lines kept per pane
    pub history_limit: u32,
}

/// Poll cadence and sandbox call budgets, all in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub batch_interval_ms: u64,
    pub stream_interval_ms: u64,
    /// Timeout for each individual multiplexer call
    pub probe_timeout_ms: u64,
    /// Timeout for a package-manager installation attempt
    pub install_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Requested timeouts are clamped to this many seconds
    pub max_timeout_secs: u64,
    pub max_session_name_len: usize,
}

/// Where pending-command state is persisted between manager instances
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(tag = "store", rename_all = "lowercase")]
pub enum StateStoreConfig {
    /// Key/value pairs in the backend session's own environment
    #[default]
    Backend,
    /// One JSON document per backend session in a local directory
    File { dir: PathBuf },
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            polling: PollingConfig::default(),
            limits: LimitsConfig::default(),
            state: StateStoreConfig::default(),
            session_prefix: "ta".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            fallback_path: "/usr/bin/tmux".to_string(),
            cols: 250,
            rows: 50,
            history_limit: 50_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 500,
            stream_interval_ms: 100,
            probe_timeout_ms: 10_000,
            install_timeout_ms: 120_000,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: 600,
            max_session_name_len: 64,
        }
    }
}

impl PollingConfig {
    /// Poll interval for the given mode
    pub fn interval(&self, streaming: bool) -> Duration {
        if streaming {
            Duration::from_millis(self.stream_interval_ms)
        } else {
            Duration::from_millis(self.batch_interval_ms)
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }
}

impl LimitsConfig {
    /// Convert a caller timeout in seconds into a bounded duration (at least one second)
    pub fn clamp_timeout(&self, seconds: u64) -> Duration {
        Duration::from_secs(seconds.clamp(1, self.max_timeout_secs.max(1)))
    }
}

impl TerminalConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.multiplexer.binary.trim().is_empty() {
            return Err(crate::error::TerminalError::Config(
                "Multiplexer binary cannot be empty".to_string(),
            ));
        }

        if self.multiplexer.cols == 0 || self.multiplexer.rows == 0 {
            return Err(crate::error::TerminalError::Config(format!(
                "Invalid terminal geometry: {}x{}",
                self.multiplexer.cols, self.multiplexer.rows
            )));
        }

        if self.polling.batch_interval_ms == 0 || self.polling.stream_interval_ms == 0 {
            return Err(crate::error::TerminalError::Config(
                "Poll intervals must be greater than zero".to_string(),
            ));
        }

        if self.limits.max_timeout_secs == 0 {
            return Err(crate::error::TerminalError::Config(
                "max_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.limits.max_session_name_len < 8 {
            return Err(crate::error::TerminalError::Config(format!(
                "max_session_name_len too small: {}",
                self.limits.max_session_name_len
            )));
        }

        if self.session_prefix.is_empty()
            || !self
                .session_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(crate::error::TerminalError::Config(format!(
                "Invalid session prefix: {:?}",
                self.session_prefix
            )));
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            return Err(crate::error::TerminalError::Config(format!(
                "Invalid log level: {}",
                self.log_level
            )));
        }

        if let StateStoreConfig::File { dir } = &self.state {
            if dir.as_os_str().is_empty() {
                return Err(crate::error::TerminalError::Config(
                    "File state store requires a directory".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let config: TerminalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON string
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TerminalConfig::default();

        assert_eq!(config.multiplexer.binary, "tmux");
        assert_eq!(config.multiplexer.cols, 250);
        assert_eq!(config.multiplexer.rows, 50);
        assert_eq!(config.multiplexer.history_limit, 50_000);
        assert_eq!(config.polling.batch_interval_ms, 500);
        assert_eq!(config.polling.stream_interval_ms, 100);
        assert_eq!(config.limits.max_timeout_secs, 600);
        assert_eq!(config.state, StateStoreConfig::Backend);
        assert_eq!(config.session_prefix, "ta");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_validation_success() {
        let config = TerminalConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_geometry() {
        let mut config = TerminalConfig::default();
        config.multiplexer.cols = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid terminal geometry"));
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = TerminalConfig::default();
        config.log_level = "invalid".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log level"));
    }

    #[test]
    fn test_config_validation_bad_prefix() {
        let mut config = TerminalConfig::default();
        config.session_prefix = "ta;rm".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_timeout() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.clamp_timeout(0), Duration::from_secs(1));
        assert_eq!(limits.clamp_timeout(30), Duration::from_secs(30));
        assert_eq!(limits.clamp_timeout(10_000), Duration::from_secs(600));
    }

    #[test]
    fn test_poll_interval_by_mode() {
        let polling = PollingConfig::default();
        assert_eq!(polling.interval(true), Duration::from_millis(100));
        assert_eq!(polling.interval(false), Duration::from_millis(500));
    }

    #[test]
    fn test_json_deserialization_with_defaults() {
        let json = r#"{
            "multiplexer": { "cols": 120 },
            "state": { "store": "file", "dir": "/tmp/ta-state" },
            "log_level": "debug"
        }"#;

        let config = TerminalConfig::from_json(json).unwrap();

        assert_eq!(config.multiplexer.cols, 120);
        assert_eq!(config.multiplexer.rows, 50);
        assert_eq!(config.log_level, "debug");
        assert_eq!(
            config.state,
            StateStoreConfig::File {
                dir: PathBuf::from("/tmp/ta-state")
            }
        );
        assert_eq!(config.polling.batch_interval_ms, 500);
    }

    #[test]
    fn test_round_trip_serialization() {
        let original = TerminalConfig::default();
        let json = original.to_json().unwrap();
        let deserialized = TerminalConfig::from_json(&json).unwrap();

        assert_eq!(original.multiplexer.binary, deserialized.multiplexer.binary);
        assert_eq!(original.limits.max_timeout_secs, deserialized.limits.max_timeout_secs);
        assert_eq!(original.state, deserialized.state);
    }
}
