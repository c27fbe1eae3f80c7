//! Terminal session management on top of a sandbox run primitive
//!
//! One [`TerminalManager`] exists per scope (a conversation, a chat). It owns
//! the registry of logical sessions, the idle pool and the stream
//! subscriptions, and talks to tmux inside the sandbox through
//! [`Multiplexer`]. Command execution and waiting live in the exec and wait
//! engines, which extend this type.

use crate::backend::BackendChecker;
use crate::cleaner::OutputCleaner;
use crate::config::{StateStoreConfig, TerminalConfig};
use crate::keys::{translate_input, KeyInput};
use crate::multiplexer::{derive_backend_name, sanitize_component, Multiplexer};
use crate::registry::{suffixed_names, SessionEntry, SessionInfo, SessionRegistry};
use crate::sandbox::{OutputSink, Sandbox};
use crate::state_store::{BackendEnvStore, FileStateStore, PendingState, StateStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};

/// Key that stops the foreground program without printing the done marker
const INTERRUPT_KEY: &str = "C-c";

/// Result of an exec or wait call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub session: String,
    pub output: String,
    /// Exit status when the command was seen to finish
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Manages persistent multiplexer sessions for one scope
#[derive(Clone)]
pub struct TerminalManager {
    scope_id: String,
    pub(crate) config: Arc<TerminalConfig>,
    pub(crate) sandbox: Arc<dyn Sandbox>,
    pub(crate) multiplexer: Multiplexer,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) cleaner: OutputCleaner,
    backend_path: Arc<OnceCell<String>>,
    pub(crate) registry: Arc<RwLock<SessionRegistry>>,
    subscriptions: Arc<RwLock<HashMap<String, OutputSink>>>,
}

impl std::fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalManager")
            .field("scope_id", &self.scope_id)
            .field("multiplexer", &self.multiplexer)
            .finish()
    }
}

impl TerminalManager {
    /// Create a manager using the state store selected in `config`
    pub fn new(
        scope_id: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
        config: TerminalConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let multiplexer = Multiplexer::new(sandbox.clone(), &config.multiplexer, &config.polling);
        let store: Arc<dyn StateStore> = match &config.state {
            StateStoreConfig::Backend => Arc::new(BackendEnvStore::new(multiplexer.clone())),
            StateStoreConfig::File { dir } => Arc::new(FileStateStore::new(dir.clone())),
        };
        Self::assemble(scope_id.into(), sandbox, multiplexer, store, config)
    }

    /// Create a manager with an explicit state store
    pub fn with_store(
        scope_id: impl Into<String>,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn StateStore>,
        config: TerminalConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let multiplexer = Multiplexer::new(sandbox.clone(), &config.multiplexer, &config.polling);
        Self::assemble(scope_id.into(), sandbox, multiplexer, store, config)
    }

    fn assemble(
        scope_id: String,
        sandbox: Arc<dyn Sandbox>,
        multiplexer: Multiplexer,
        store: Arc<dyn StateStore>,
        config: TerminalConfig,
    ) -> crate::Result<Self> {
        if scope_id.is_empty() || sanitize_component(&scope_id, usize::MAX) != scope_id {
            return Err(crate::TerminalError::InvalidInput(format!(
                "Scope id {:?} may only contain letters, digits, '-' and '_'",
                scope_id
            )));
        }
        // Leave room for at least a two-character session id
        let shortest = derive_backend_name(&config.session_prefix, &scope_id, "s0");
        if shortest.len() > config.limits.max_session_name_len {
            return Err(crate::TerminalError::InvalidInput(format!(
                "Scope id {:?} is too long for max_session_name_len {}",
                scope_id, config.limits.max_session_name_len
            )));
        }
        Ok(Self {
            scope_id,
            config: Arc::new(config),
            sandbox,
            multiplexer,
            store,
            cleaner: OutputCleaner::new()?,
            backend_path: Arc::new(OnceCell::new()),
            registry: Arc::new(RwLock::new(SessionRegistry::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn sandbox(&self) -> Arc<dyn Sandbox> {
        self.sandbox.clone()
    }

    /// Backend session name for a logical session in this scope
    pub fn backend_name_for(&self, logical_id: &str) -> String {
        derive_backend_name(&self.config.session_prefix, &self.scope_id, logical_id)
    }

    /// Accept only ids that map to their own backend session
    ///
    /// Ids that sanitizing would alter or truncate are rejected, since two of
    /// them could otherwise share one backend session.
    fn validate_logical_id(&self, logical_id: &str) -> crate::Result<()> {
        if logical_id.is_empty() || sanitize_component(logical_id, usize::MAX) != logical_id {
            return Err(crate::TerminalError::InvalidInput(format!(
                "Session name {:?} may only contain letters, digits, '-' and '_'",
                logical_id
            )));
        }
        let backend = self.backend_name_for(logical_id);
        if backend.len() > self.config.limits.max_session_name_len {
            return Err(crate::TerminalError::InvalidInput(format!(
                "Session name {:?} is too long: {} exceeds {} characters",
                logical_id,
                backend,
                self.config.limits.max_session_name_len
            )));
        }
        Ok(())
    }

    /// Make sure the multiplexer is installed; memoized after the first success
    pub async fn ensure_backend(&self) -> crate::Result<()> {
        let path = self
            .backend_path
            .get_or_try_init(|| async {
                let checker = BackendChecker::new(
                    self.sandbox.clone(),
                    &self.config.multiplexer,
                    &self.config.polling,
                );
                let path = checker.ensure_available().await?;
                tracing::info!("Terminal backend available at {}", path);
                Ok::<String, crate::TerminalError>(path)
            })
            .await?;
        self.multiplexer.set_binary(path);
        Ok(())
    }

    /// Create a fresh backend session for `logical_id` and register it idle
    pub async fn create_session(&self, logical_id: &str) -> crate::Result<String> {
        self.validate_logical_id(logical_id)?;
        self.ensure_backend().await?;
        let backend = self.backend_name_for(logical_id);

        // 1. Drop a stale session left behind under the same name
        if self.multiplexer.has_session(&backend).await? {
            tracing::info!("Killing stale backend session {}", backend);
            if let Err(e) = self.multiplexer.kill_session(&backend).await {
                tracing::warn!("Failed to kill stale session {}: {}", backend, e);
            }
        }

        // 2. Create it, tolerating a concurrent creator
        let geometry = &self.config.multiplexer;
        if let Err(e) = self
            .multiplexer
            .new_session(&backend, geometry.cols, geometry.rows, geometry.history_limit)
            .await
        {
            if self.multiplexer.has_session(&backend).await? {
                tracing::warn!("Session {} appeared while creating it, reusing: {}", backend, e);
            } else {
                return Err(e);
            }
        }

        // 3. Prepare the shell
        self.multiplexer
            .send_keys(&backend, &["set +H", "Enter"])
            .await?;
        self.multiplexer.clear_history(&backend).await?;
        if let Err(e) = self.store.clear(&backend).await {
            tracing::warn!("Failed to clear persisted state for {}: {}", backend, e);
        }

        self.registry
            .write()
            .await
            .insert(logical_id, SessionEntry::new(backend.clone()));
        tracing::info!("Created session {} ({})", logical_id, backend);
        Ok(logical_id.to_string())
    }

    /// Register a backend session that outlived a previous manager instance
    ///
    /// Returns whether `logical_id` is registered afterwards.
    pub async fn ensure_session_attached(&self, logical_id: &str) -> crate::Result<bool> {
        if self.registry.read().await.contains(logical_id) {
            return Ok(true);
        }
        if self.validate_logical_id(logical_id).is_err() {
            return Ok(false);
        }

        self.ensure_backend().await?;
        let backend = self.backend_name_for(logical_id);
        if !self.multiplexer.has_session(&backend).await? {
            return Ok(false);
        }

        let pending = match self.store.load(&backend).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Ignoring unreadable pending state for {}: {}", backend, e);
                None
            }
        };
        let captured = self.multiplexer.capture(&backend).await?;

        let mut entry = SessionEntry::new(backend.clone());
        match pending {
            Some(state) => {
                // Output produced since the timeout has not been seen yet
                entry.last_captured = prefix_at(&captured, state.baseline_len).to_string();
                entry.pending_sentinel = Some(state.sentinel);
                entry.interrupted = state.interrupted;
                entry.busy = true;
            }
            None => entry.last_captured = captured,
        }

        let mut registry = self.registry.write().await;
        if registry.contains(logical_id) {
            return Ok(true);
        }
        tracing::info!(
            "Reattached session {} ({}), pending: {}",
            logical_id,
            backend,
            entry.pending_sentinel.is_some()
        );
        registry.insert(logical_id, entry);
        Ok(true)
    }

    /// Pick a session for a new command and mark it busy
    pub async fn acquire_session(&self, preferred: Option<&str>) -> crate::Result<String> {
        match preferred {
            Some(name) => self.acquire_named(name).await,
            None => self.acquire_any().await,
        }
    }

    async fn acquire_named(&self, name: &str) -> crate::Result<String> {
        self.validate_logical_id(name)?;

        if self.ensure_session_attached(name).await? {
            let claimed = {
                let mut registry = self.registry.write().await;
                let idle = registry.get(name).is_some_and(|entry| !entry.busy);
                if idle {
                    registry.mark_busy(name)?;
                }
                idle
            };

            if claimed {
                self.reset_session(name).await?;
                return Ok(name.to_string());
            }

            for candidate in suffixed_names(name) {
                if self.registry.read().await.contains(&candidate) {
                    continue;
                }
                if self
                    .multiplexer
                    .has_session(&self.backend_name_for(&candidate))
                    .await?
                {
                    continue;
                }
                tracing::info!("Session {} is busy, using {}", name, candidate);
                return self.create_busy(&candidate).await;
            }
        }

        self.create_busy(name).await
    }

    async fn acquire_any(&self) -> crate::Result<String> {
        loop {
            let Some(id) = self.registry.write().await.pop_idle() else {
                break;
            };
            let backend = match self.registry.read().await.get(&id) {
                Some(entry) => entry.backend_name.clone(),
                None => continue,
            };

            if self.multiplexer.has_session(&backend).await? {
                self.registry.write().await.mark_busy(&id)?;
                self.reset_session(&id).await?;
                tracing::debug!("Reusing idle session {}", id);
                return Ok(id);
            }

            tracing::info!("Idle session {} died, recreating", id);
            self.registry.write().await.remove(&id);
            return self.create_busy(&id).await;
        }

        self.ensure_backend().await?;
        loop {
            let id = self.registry.write().await.next_auto_id();
            // Leave sessions from an earlier manager instance alone
            if !self.multiplexer.has_session(&self.backend_name_for(&id)).await? {
                return self.create_busy(&id).await;
            }
        }
    }

    async fn create_busy(&self, id: &str) -> crate::Result<String> {
        let id = self.create_session(id).await?;
        self.registry.write().await.mark_busy(&id)?;
        Ok(id)
    }

    /// Clear the screen and scrollback of a reused session and restart its baseline
    async fn reset_session(&self, id: &str) -> crate::Result<()> {
        let backend = self.backend_for(id).await?;
        self.multiplexer.send_keys(&backend, &["C-l"]).await?;
        self.multiplexer.clear_history(&backend).await?;
        let captured = self.multiplexer.capture(&backend).await?;
        if let Some(entry) = self.registry.write().await.get_mut(id) {
            entry.reset_baseline(&captured);
        }
        Ok(())
    }

    /// Return a session to the idle pool
    pub async fn release_session(&self, id: &str) -> crate::Result<()> {
        self.registry.write().await.release(id)?;
        tracing::debug!("Released session {}", id);
        Ok(())
    }

    pub(crate) async fn backend_for(&self, id: &str) -> crate::Result<String> {
        self.registry
            .read()
            .await
            .get(id)
            .map(|entry| entry.backend_name.clone())
            .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))
    }

    /// Attach if needed, failing with session-not-found otherwise
    pub(crate) async fn require_session(&self, id: &str) -> crate::Result<String> {
        if !self.ensure_session_attached(id).await? {
            return Err(crate::TerminalError::SessionNotFound(id.to_string()));
        }
        self.backend_for(id).await
    }

    /// Capture a session, forgetting it when the backend session is gone
    pub(crate) async fn capture_session(&self, id: &str, backend: &str) -> crate::Result<String> {
        match self.multiplexer.capture(backend).await {
            Ok(captured) => Ok(captured),
            Err(e @ crate::TerminalError::SessionNotFound(_)) => {
                if !self.multiplexer.has_session(backend).await.unwrap_or(true) {
                    tracing::warn!("Backend session {} disappeared, forgetting {}", backend, id);
                    self.registry.write().await.remove(id);
                    self.subscriptions.write().await.remove(id);
                    return Err(crate::TerminalError::SessionNotFound(id.to_string()));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the pending sentinel of `id` with its current baseline length
    pub(crate) async fn persist_pending(&self, id: &str) -> crate::Result<()> {
        let (backend, state) = {
            let registry = self.registry.read().await;
            let Some(entry) = registry.get(id) else {
                return Ok(());
            };
            let Some(sentinel) = entry.pending_sentinel.clone() else {
                return Ok(());
            };
            (
                entry.backend_name.clone(),
                PendingState::new(sentinel, entry.last_captured.len())
                    .with_interrupted(entry.interrupted),
            )
        };
        self.store.save(&backend, &state).await
    }

    /// Forget the pending sentinel of `id` in memory and in the store
    pub(crate) async fn clear_pending(&self, id: &str, backend: &str) -> crate::Result<()> {
        if let Some(entry) = self.registry.write().await.get_mut(id) {
            entry.pending_sentinel = None;
            entry.interrupted = false;
        }
        self.store.clear(backend).await
    }

    /// Type input into a session
    ///
    /// Symbolic keys go through `send-keys`; anything else is pasted, followed
    /// by Enter unless it already ends in a newline.
    pub async fn send(&self, id: &str, input: &str) -> crate::Result<()> {
        let backend = self.require_session(id).await?;

        let translated = translate_input(input);
        let needs_enter = translated.needs_enter();
        match translated {
            KeyInput::Keys(keys) => {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.multiplexer.send_keys(&backend, &key_refs).await?;
                if keys.iter().any(|key| key == INTERRUPT_KEY) {
                    let pending = match self.registry.write().await.get_mut(id) {
                        Some(entry) => {
                            entry.interrupted = entry.pending_sentinel.is_some();
                            entry.interrupted
                        }
                        None => false,
                    };
                    // A later manager instance may be the one that waits
                    if pending {
                        self.persist_pending(id).await?;
                    }
                }
                tracing::debug!("Sent keys {:?} to {}", keys, backend);
            }
            KeyInput::Text(text) => {
                self.multiplexer.paste_text(&backend, &text).await?;
                if needs_enter {
                    self.multiplexer.send_keys(&backend, &["Enter"]).await?;
                }
                tracing::debug!("Sent text input to {}", backend);
            }
        }
        Ok(())
    }

    /// Terminate a session and drop all bookkeeping for it
    ///
    /// Returns whether there was a session to kill.
    pub async fn kill(&self, id: &str) -> crate::Result<bool> {
        let registered = self
            .registry
            .read()
            .await
            .get(id)
            .map(|entry| entry.backend_name.clone());

        if registered.is_none() {
            if self.validate_logical_id(id).is_err() {
                return Ok(false);
            }
            if let Err(e) = self.ensure_backend().await {
                tracing::debug!("No backend to kill {} in: {}", id, e);
                return Ok(false);
            }
        }

        let backend = registered
            .clone()
            .unwrap_or_else(|| self.backend_name_for(id));
        let alive = self.multiplexer.has_session(&backend).await.unwrap_or(false);

        if let Err(e) = self.store.clear(&backend).await {
            tracing::warn!("Failed to clear persisted state for {}: {}", backend, e);
        }
        if alive {
            if let Err(e) = self.multiplexer.kill_session(&backend).await {
                tracing::warn!("Failed to kill backend session {}: {}", backend, e);
            }
        }

        self.registry.write().await.remove(id);
        self.subscriptions.write().await.remove(id);

        let existed = registered.is_some() || alive;
        if existed {
            tracing::info!("Killed session {} ({})", id, backend);
        }
        Ok(existed)
    }

    /// Output accumulated since the last look, without blocking
    pub async fn view(&self, id: &str) -> crate::Result<String> {
        let backend = self.require_session(id).await?;
        let captured = self.capture_session(id, &backend).await?;

        let (output, pending) = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))?;
            let output = self.cleaner.render_delta(&entry.last_captured, &captured);
            entry.advance_baseline(&captured);
            (output, entry.pending_sentinel.is_some())
        };

        if pending {
            self.persist_pending(id).await?;
        }
        Ok(output)
    }

    /// Forward live output of `id` to `sink` during exec and wait
    pub async fn subscribe(&self, id: &str, sink: OutputSink) {
        self.subscriptions.write().await.insert(id.to_string(), sink);
    }

    pub async fn unsubscribe(&self, id: &str) {
        self.subscriptions.write().await.remove(id);
    }

    pub(crate) async fn subscription(&self, id: &str) -> Option<OutputSink> {
        self.subscriptions.read().await.get(id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.read().await.snapshot()
    }
}

/// Longest prefix of `text` no longer than `len` bytes
pub(crate) fn prefix_at(text: &str, len: usize) -> &str {
    let mut end = len.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
