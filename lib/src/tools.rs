//! Action dispatch for agent tool calls
//!
//! An agent drives the terminal through one tool whose arguments are a
//! [`TerminalAction`]. [`TerminalToolHandler`] routes each action to the
//! [`TerminalManager`] and always answers with a [`TerminalToolResult`]:
//! failures become descriptive output instead of errors, so the calling
//! agent loop is never interrupted.

use crate::sandbox::{OutputSink, RunOptions, TIMEOUT_EXIT_CODE};
use crate::terminal_manager::{CommandOutcome, TerminalManager};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timeout in seconds when an action does not name one
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Receives `(session, chunk)` pairs of live output
pub type SessionOutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// One tool call against the terminal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TerminalAction {
    /// Run a command, in a new or named session
    Exec {
        command: String,
        #[serde(default)]
        session: Option<String>,
        /// Seconds
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    /// Keep waiting on a session
    Wait {
        session: String,
        #[serde(default = "default_timeout")]
        timeout: u64,
    },
    /// Type keys or text into a session
    Send { session: String, input: String },
    Kill { session: String },
    /// Output accumulated since the last look
    View { session: String },
    List,
}

impl TerminalAction {
    /// Parse a JSON action object
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::TerminalError::InvalidInput(format!("Malformed terminal action: {}", e))
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            TerminalAction::Exec { .. } => "exec",
            TerminalAction::Wait { .. } => "wait",
            TerminalAction::Send { .. } => "send",
            TerminalAction::Kill { .. } => "kill",
            TerminalAction::View { .. } => "view",
            TerminalAction::List => "list",
        }
    }

    /// Session the action targets, if it names one
    pub fn session(&self) -> Option<&str> {
        match self {
            TerminalAction::Exec { session, .. } => session.as_deref(),
            TerminalAction::Wait { session, .. }
            | TerminalAction::Send { session, .. }
            | TerminalAction::Kill { session }
            | TerminalAction::View { session } => Some(session),
            TerminalAction::List => None,
        }
    }
}

/// Answer to a [`TerminalAction`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalToolResult {
    pub output: String,
    /// Present for exec and wait; `null` while the command has not finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<Option<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
}

impl TerminalToolResult {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: Some(true),
            ..Self::default()
        }
    }

    fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error == Some(true)
    }
}

impl From<CommandOutcome> for TerminalToolResult {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            output: outcome.output,
            exit_code: Some(outcome.exit_code),
            session: Some(outcome.session),
            timed_out: Some(outcome.timed_out),
            ..Self::default()
        }
    }
}

/// Routes terminal actions to a [`TerminalManager`]
#[derive(Debug, Clone)]
pub struct TerminalToolHandler {
    manager: TerminalManager,
}

impl TerminalToolHandler {
    pub fn new(manager: TerminalManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &TerminalManager {
        &self.manager
    }

    /// Handle one action; never fails
    ///
    /// `sink` receives live output of exec and wait while they poll, when the
    /// sandbox can stream. `cancel` stops the local poll loop only.
    pub async fn handle(
        &self,
        action: TerminalAction,
        sink: Option<SessionOutputSink>,
        cancel: Option<&CancellationToken>,
    ) -> TerminalToolResult {
        let name = action.name();
        let session = action.session().map(str::to_string);
        tracing::info!("Handling terminal action: {} (session: {:?})", name, session);

        match self.execute_action(action, sink, cancel).await {
            Ok(result) => result,
            Err(crate::TerminalError::SessionNotFound(id)) => {
                tracing::info!("{} on unknown session {}", name, id);
                TerminalToolResult::text(format!(
                    "Session {} does not exist. Start a new session with the exec action.",
                    id
                ))
                .with_session(id)
            }
            Err(e) => {
                tracing::warn!("Terminal action {} failed ({}): {}", name, e.kind(), e);
                let result = TerminalToolResult::failure(format!("{} failed: {}", name, e));
                match session {
                    Some(id) => result.with_session(id),
                    None => result,
                }
            }
        }
    }

    async fn execute_action(
        &self,
        action: TerminalAction,
        sink: Option<SessionOutputSink>,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<TerminalToolResult> {
        match action {
            TerminalAction::Exec {
                command,
                session,
                timeout,
            } => {
                self.handle_exec(&command, session.as_deref(), timeout, sink, cancel)
                    .await
            }
            TerminalAction::Wait { session, timeout } => {
                self.handle_wait(&session, timeout, sink, cancel).await
            }
            TerminalAction::Send { session, input } => {
                self.manager.send(&session, &input).await?;
                Ok(TerminalToolResult::text(format!("Sent input to session {}", session))
                    .with_session(session))
            }
            TerminalAction::Kill { session } => {
                let killed = self.manager.kill(&session).await?;
                let output = if killed {
                    format!("Killed session {}", session)
                } else {
                    format!("No session {} to kill", session)
                };
                Ok(TerminalToolResult {
                    killed: Some(killed),
                    ..TerminalToolResult::text(output).with_session(session)
                })
            }
            TerminalAction::View { session } => {
                let output = self.manager.view(&session).await?;
                Ok(TerminalToolResult::text(output).with_session(session))
            }
            TerminalAction::List => Ok(self.handle_list().await),
        }
    }

    /// Handle exec, falling back to a one-shot run without a backend
    async fn handle_exec(
        &self,
        command: &str,
        session: Option<&str>,
        timeout: u64,
        sink: Option<SessionOutputSink>,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<TerminalToolResult> {
        if command.trim().is_empty() {
            return Err(crate::TerminalError::InvalidInput(
                "exec requires a non-empty command".to_string(),
            ));
        }
        let timeout = self.manager.config().limits.clamp_timeout(timeout);

        let id = match self.manager.acquire_session(session).await {
            Ok(id) => id,
            Err(e) if e.is_fatal() => {
                tracing::warn!("No terminal backend, running one-shot: {}", e);
                return self.run_one_shot(command, timeout, sink).await;
            }
            Err(e) => return Err(e),
        };

        self.subscribe(&id, sink).await;
        let result = self.manager.exec(&id, command, timeout, cancel).await;
        self.manager.unsubscribe(&id).await;

        match result {
            Ok(outcome) => Ok(outcome.into()),
            Err(e) => {
                if let Err(release_err) = self.manager.release_session(&id).await {
                    tracing::debug!("Could not release {} after failure: {}", id, release_err);
                }
                Err(e)
            }
        }
    }

    async fn handle_wait(
        &self,
        session: &str,
        timeout: u64,
        sink: Option<SessionOutputSink>,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<TerminalToolResult> {
        let timeout = self.manager.config().limits.clamp_timeout(timeout);
        self.subscribe(session, sink).await;
        let result = self.manager.wait(session, timeout, cancel).await;
        self.manager.unsubscribe(session).await;
        Ok(result?.into())
    }

    async fn handle_list(&self) -> TerminalToolResult {
        let sessions = self.manager.sessions().await;
        if sessions.is_empty() {
            return TerminalToolResult::text("No sessions");
        }
        let lines: Vec<String> = sessions
            .iter()
            .map(|info| {
                let state = match (info.busy, info.pending) {
                    (_, true) => "running",
                    (true, false) => "busy",
                    (false, false) => "idle",
                };
                format!("{}\t{}\t{}", info.id, info.backend_name, state)
            })
            .collect();
        TerminalToolResult::text(lines.join("\n"))
    }

    async fn subscribe(&self, id: &str, sink: Option<SessionOutputSink>) {
        if let Some(sink) = sink {
            let session = id.to_string();
            let forward: OutputSink = Arc::new(move |chunk: &str| sink(session.as_str(), chunk));
            self.manager.subscribe(id, forward).await;
        }
    }

    /// Run `command` once, outside any session
    async fn run_one_shot(
        &self,
        command: &str,
        timeout: Duration,
        sink: Option<SessionOutputSink>,
    ) -> crate::Result<TerminalToolResult> {
        let mut options = RunOptions::with_timeout(timeout);
        if let Some(sink) = sink {
            options = options.on_output(Arc::new(move |chunk: &str| sink("", chunk)));
        }
        let output = self.manager.sandbox().run(command, options).await?;

        let mut text = output.combined().trim_end().to_string();
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str("[persistent terminal sessions are unavailable; the command ran once without a session]");

        Ok(TerminalToolResult {
            exit_code: Some(Some(output.exit_code)),
            timed_out: Some(output.exit_code == TIMEOUT_EXIT_CODE),
            ..TerminalToolResult::text(text)
        })
    }
}
