//! tmux command layer on top of the sandbox run primitive
//!
//! Every operation is rendered into a single shell command string and sent
//! through [`Sandbox::run`]. All arguments are single-quoted, and session
//! names are sanitized before they ever reach this module.

use crate::config::{MultiplexerConfig, PollingConfig};
use crate::sandbox::{RunOptions, RunOutput, Sandbox};
use base64::{engine::general_purpose, Engine as _};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Replace anything outside `[A-Za-z0-9_-]` and cap the length
pub fn sanitize_component(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    trimmed.chars().take(max_len).collect()
}

/// Deterministic backend session name for a scope and logical session id
///
/// Distinct scopes never collide because the scope id is part of the name.
/// Callers validate both ids first so that sanitizing leaves them unchanged;
/// otherwise distinct ids could share a backend session.
pub fn derive_backend_name(prefix: &str, scope_id: &str, logical_id: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        sanitize_component(scope_id, usize::MAX),
        sanitize_component(logical_id, usize::MAX)
    )
}

/// Thin async wrapper around the tmux CLI inside a sandbox
#[derive(Clone)]
pub struct Multiplexer {
    sandbox: Arc<dyn Sandbox>,
    binary: Arc<RwLock<String>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("binary", &self.binary())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Multiplexer {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &MultiplexerConfig, polling: &PollingConfig) -> Self {
        Self {
            sandbox,
            binary: Arc::new(RwLock::new(config.binary.clone())),
            call_timeout: polling.probe_timeout(),
        }
    }

    pub fn binary(&self) -> String {
        match self.binary.read() {
            Ok(binary) => binary.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Point every clone of this multiplexer at a resolved binary path
    pub fn set_binary(&self, path: &str) {
        match self.binary.write() {
            Ok(mut binary) => *binary = path.to_string(),
            Err(poisoned) => *poisoned.into_inner() = path.to_string(),
        }
    }

    fn exact_session(name: &str) -> String {
        format!("={}", name)
    }

    fn pane_target(name: &str) -> String {
        format!("={}:", name)
    }

    fn render(&self, args: &[&str]) -> String {
        let mut command = shell_quote(&self.binary());
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        command
    }

    async fn run_raw(&self, command: &str) -> crate::Result<RunOutput> {
        tracing::trace!("multiplexer: {}", command);
        self.sandbox
            .run(command, RunOptions::with_timeout(self.call_timeout))
            .await
    }

    async fn run(&self, args: &[&str]) -> crate::Result<RunOutput> {
        let command = self.render(args);
        self.run_raw(&command).await
    }

    async fn run_checked(&self, args: &[&str]) -> crate::Result<RunOutput> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(crate::TerminalError::Execution(format!(
                "tmux {} failed (exit {}): {}",
                args.first().copied().unwrap_or_default(),
                output.exit_code,
                output.combined()
            )));
        }
        Ok(output)
    }

    pub async fn has_session(&self, name: &str) -> crate::Result<bool> {
        let output = self
            .run(&["has-session", "-t", &Self::exact_session(name)])
            .await?;
        Ok(output.success())
    }

    /// Create a detached session with a fixed geometry and scrollback limit
    ///
    /// One tmux invocation starts the server, raises the global history limit
    /// and creates the session, so even the first session gets the limit.
    pub async fn new_session(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        history_limit: u32,
    ) -> crate::Result<()> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        let limit = history_limit.to_string();
        let output = self
            .run(&[
                "start-server",
                ";",
                "set-option",
                "-g",
                "history-limit",
                &limit,
                ";",
                "new-session",
                "-d",
                "-s",
                name,
                "-x",
                &cols,
                "-y",
                &rows,
            ])
            .await?;
        if !output.success() {
            return Err(crate::TerminalError::Execution(format!(
                "tmux new-session {} failed (exit {}): {}",
                name,
                output.exit_code,
                output.combined()
            )));
        }
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> crate::Result<()> {
        self.run_checked(&["kill-session", "-t", &Self::exact_session(name)])
            .await?;
        Ok(())
    }

    /// Send key names (or literal words) to the session's active pane
    pub async fn send_keys(&self, name: &str, keys: &[&str]) -> crate::Result<()> {
        let target = Self::pane_target(name);
        let mut args = vec!["send-keys", "-t", target.as_str()];
        args.extend_from_slice(keys);
        self.run_checked(&args).await?;
        Ok(())
    }

    /// Type arbitrary text into the pane through a paste buffer
    ///
    /// The text travels base64-encoded and is decoded inside the sandbox, so
    /// it is never interpolated into a command line.
    pub async fn paste_text(&self, name: &str, text: &str) -> crate::Result<()> {
        let encoded = general_purpose::STANDARD.encode(text.as_bytes());
        let buffer = format!("ta_{}", name);
        let command = format!(
            "printf '%s' {} | base64 -d | {} && {}",
            shell_quote(&encoded),
            self.render(&["load-buffer", "-b", &buffer, "-"]),
            self.render(&["paste-buffer", "-d", "-b", &buffer, "-t", &Self::pane_target(name)]),
        );
        let output = self.run_raw(&command).await?;
        if !output.success() {
            return Err(crate::TerminalError::Execution(format!(
                "paste into {} failed: {}",
                name,
                output.combined()
            )));
        }
        Ok(())
    }

    /// Full pane contents including scrollback, with wrapped lines joined
    ///
    /// Trailing blank lines are dropped and the result always ends in a newline.
    pub async fn capture(&self, name: &str) -> crate::Result<String> {
        let output = self
            .run(&["capture-pane", "-p", "-J", "-S", "-", "-t", &Self::pane_target(name)])
            .await?;
        if !output.success() {
            return Err(crate::TerminalError::SessionNotFound(format!(
                "{} ({})",
                name,
                output.combined()
            )));
        }
        Ok(normalize_capture(&output.stdout))
    }

    pub async fn clear_history(&self, name: &str) -> crate::Result<()> {
        self.run_checked(&["clear-history", "-t", &Self::pane_target(name)])
            .await?;
        Ok(())
    }

    pub async fn set_environment(&self, name: &str, key: &str, value: &str) -> crate::Result<()> {
        self.run_checked(&["set-environment", "-t", &Self::exact_session(name), key, value])
            .await?;
        Ok(())
    }

    pub async fn unset_environment(&self, name: &str, key: &str) -> crate::Result<()> {
        // Unsetting a variable that was never set is not an error for us
        let _ = self
            .run(&["set-environment", "-u", "-t", &Self::exact_session(name), key])
            .await?;
        Ok(())
    }

    pub async fn show_environment(&self, name: &str, key: &str) -> crate::Result<Option<String>> {
        let output = self
            .run(&["show-environment", "-t", &Self::exact_session(name), key])
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let line = output.stdout.trim_end_matches(['\n', '\r']);
        Ok(line
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string))
    }

    async fn display(&self, name: &str, format: &str) -> crate::Result<String> {
        let output = self
            .run_checked(&["display-message", "-p", "-t", &Self::pane_target(name), format])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Name of the pane's foreground process
    pub async fn pane_current_command(&self, name: &str) -> crate::Result<String> {
        self.display(name, "#{pane_current_command}").await
    }

    /// PID of the pane's controlling shell
    pub async fn pane_pid(&self, name: &str) -> crate::Result<Option<u32>> {
        Ok(self.display(name, "#{pane_pid}").await?.parse().ok())
    }

    /// Whether `pid` has any live child process
    pub async fn has_child_processes(&self, pid: u32) -> crate::Result<bool> {
        let output = self.run_raw(&format!("pgrep -P {}", pid)).await?;
        Ok(output.success() && !output.stdout.trim().is_empty())
    }
}

/// Drop trailing blank lines and end with exactly one newline
pub fn normalize_capture(raw: &str) -> String {
    let without_cr = raw.replace('\r', "");
    let trimmed = without_cr.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}
