//! Error types for the terminal session manager

use thiserror::Error;

/// Manual installation hints shown when the multiplexer cannot be provisioned
pub const MANUAL_INSTALL_GUIDANCE: &str = "Install tmux manually and retry: \
Debian/Ubuntu: `apt-get install -y tmux`; Alpine: `apk add tmux`; \
Fedora/RHEL: `dnf install -y tmux`; Arch: `pacman -S tmux`; macOS: `brew install tmux`. \
Until then only one-shot, non-interactive commands are available.";

/// Main error type for the terminal session manager
#[derive(Error, Debug)]
pub enum TerminalError {
    /// The terminal multiplexer is missing and could not be installed
    ///
    /// Fatal for every session-based action. Callers may still fall back to
    /// one-shot execution through the sandbox directly.
    #[error("Terminal backend unavailable: {guidance}")]
    BackendUnavailable { guidance: String },

    /// No logical session with this id exists (or its backend session is gone)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Caller supplied an unusable session name, key, or command
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The sandbox run primitive itself failed (transport, spawn, ...)
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// A multiplexer command ran but reported failure
    #[error("Execution error: {0}")]
    Execution(String),

    /// Reading or writing the persisted pending-command state failed
    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TerminalError {
    /// Backend-unavailable error carrying the default manual-install guidance
    pub fn backend_unavailable() -> Self {
        TerminalError::BackendUnavailable {
            guidance: MANUAL_INSTALL_GUIDANCE.to_string(),
        }
    }

    /// Whether no session-based action can succeed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, TerminalError::BackendUnavailable { .. })
    }

    /// Stable tag used in logs and dispatch results
    pub fn kind(&self) -> &'static str {
        match self {
            TerminalError::BackendUnavailable { .. } => "backend_unavailable",
            TerminalError::SessionNotFound(_) => "session_not_found",
            TerminalError::InvalidInput(_) => "invalid_input",
            TerminalError::Sandbox(_) => "sandbox",
            TerminalError::Execution(_) => "execution",
            TerminalError::StateStore(_) => "state_store",
            TerminalError::Config(_) => "config",
            TerminalError::Io(_) => "io",
            TerminalError::Serialization(_) => "serialization",
            TerminalError::Internal(_) => "internal",
        }
    }
}

/// Convenience type alias for Results using TerminalError
pub type Result<T> = std::result::Result<T, TerminalError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = TerminalError::SessionNotFound("build".to_string());
        assert_eq!(err.to_string(), "Session not found: build");

        let err = TerminalError::InvalidInput("bad key".to_string());
        assert_eq!(err.to_string(), "Invalid input: bad key");

        let err = TerminalError::Execution("capture failed".to_string());
        assert_eq!(err.to_string(), "Execution error: capture failed");

        let err = TerminalError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");

        let err = TerminalError::Internal("internal error".to_string());
        assert_eq!(err.to_string(), "Internal error: internal error");
    }

    #[test]
    fn test_backend_unavailable_carries_guidance() {
        let err = TerminalError::backend_unavailable();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "backend_unavailable");
        let message = err.to_string();
        assert!(message.contains("apt-get install -y tmux"));
        assert!(message.contains("brew install tmux"));
    }

    #[test]
    fn test_only_backend_unavailable_is_fatal() {
        assert!(!TerminalError::SessionNotFound("x".to_string()).is_fatal());
        assert!(!TerminalError::Sandbox("x".to_string()).is_fatal());
        assert!(!TerminalError::Execution("x".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: TerminalError = io_error.into();

        match err {
            TerminalError::Io(_) => {} // Expected
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_serde_error_conversion() {
        let json = "{invalid json";
        let serde_error = serde_json::from_str::<serde_json::Value>(json).unwrap_err();
        let err: TerminalError = serde_error.into();

        assert_eq!(err.kind(), "serialization");
    }
}
