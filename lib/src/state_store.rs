//! Persistence of pending-command state across manager instances
//!
//! A manager may be constructed fresh for every request. The only state that
//! must survive is, per backend session, the done marker of a timed-out
//! command, the baseline length at the moment it timed out and whether the
//! command has since been interrupted.

use crate::multiplexer::Multiplexer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Session environment key holding the pending done marker
pub const PENDING_SENTINEL_KEY: &str = "TA_PENDING_SENTINEL";
/// Session environment key holding the baseline length
pub const BASELINE_LEN_KEY: &str = "TA_BASELINE_LEN";
/// Session environment key set while the pending command has been interrupted
pub const INTERRUPTED_KEY: &str = "TA_INTERRUPTED";

/// Outstanding command recorded for a backend session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingState {
    /// Done marker (without exit status) that signals completion
    pub sentinel: String,
    /// Length of the baseline capture when the command timed out
    pub baseline_len: usize,
    /// Ctrl-C was sent, so the done marker will never be printed
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

impl PendingState {
    pub fn new(sentinel: impl Into<String>, baseline_len: usize) -> Self {
        Self {
            sentinel: sentinel.into(),
            baseline_len,
            interrupted: false,
            recorded_at: Some(Utc::now()),
        }
    }

    pub fn with_interrupted(mut self, interrupted: bool) -> Self {
        self.interrupted = interrupted;
        self
    }
}

/// Storage for [`PendingState`], keyed by backend session name
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, backend_name: &str) -> crate::Result<Option<PendingState>>;

    async fn save(&self, backend_name: &str, state: &PendingState) -> crate::Result<()>;

    /// Forget any state for the session; absent state is not an error
    async fn clear(&self, backend_name: &str) -> crate::Result<()>;
}

/// Keeps state in the multiplexer session's own environment
#[derive(Debug, Clone)]
pub struct BackendEnvStore {
    multiplexer: Multiplexer,
}

impl BackendEnvStore {
    pub fn new(multiplexer: Multiplexer) -> Self {
        Self { multiplexer }
    }
}

#[async_trait]
impl StateStore for BackendEnvStore {
    async fn load(&self, backend_name: &str) -> crate::Result<Option<PendingState>> {
        let Some(sentinel) = self
            .multiplexer
            .show_environment(backend_name, PENDING_SENTINEL_KEY)
            .await?
        else {
            return Ok(None);
        };
        if sentinel.is_empty() {
            return Ok(None);
        }

        let baseline_len = self
            .multiplexer
            .show_environment(backend_name, BASELINE_LEN_KEY)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let interrupted = self
            .multiplexer
            .show_environment(backend_name, INTERRUPTED_KEY)
            .await?
            .is_some_and(|value| value == "1");

        Ok(Some(PendingState {
            sentinel,
            baseline_len,
            interrupted,
            recorded_at: None,
        }))
    }

    async fn save(&self, backend_name: &str, state: &PendingState) -> crate::Result<()> {
        self.multiplexer
            .set_environment(backend_name, PENDING_SENTINEL_KEY, &state.sentinel)
            .await
            .map_err(|e| crate::TerminalError::StateStore(e.to_string()))?;
        self.multiplexer
            .set_environment(backend_name, BASELINE_LEN_KEY, &state.baseline_len.to_string())
            .await
            .map_err(|e| crate::TerminalError::StateStore(e.to_string()))?;
        if state.interrupted {
            self.multiplexer
                .set_environment(backend_name, INTERRUPTED_KEY, "1")
                .await
                .map_err(|e| crate::TerminalError::StateStore(e.to_string()))?;
        } else {
            self.multiplexer
                .unset_environment(backend_name, INTERRUPTED_KEY)
                .await?;
        }
        Ok(())
    }

    async fn clear(&self, backend_name: &str) -> crate::Result<()> {
        self.multiplexer
            .unset_environment(backend_name, PENDING_SENTINEL_KEY)
            .await?;
        self.multiplexer
            .unset_environment(backend_name, BASELINE_LEN_KEY)
            .await?;
        self.multiplexer
            .unset_environment(backend_name, INTERRUPTED_KEY)
            .await?;
        Ok(())
    }
}

/// One JSON document per backend session in a local directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, backend_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", backend_name))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, backend_name: &str) -> crate::Result<Option<PendingState>> {
        let path = self.path_for(backend_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::TerminalError::StateStore(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn save(&self, backend_name: &str, state: &PendingState) -> crate::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(backend_name);
        let tmp = self.dir.join(format!(".{}.json.tmp", backend_name));
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            crate::TerminalError::StateStore(format!("Failed to write {}: {}", path.display(), e))
        })?;
        tracing::debug!("Saved pending state for {} to {}", backend_name, path.display());
        Ok(())
    }

    async fn clear(&self, backend_name: &str) -> crate::Result<()> {
        match tokio::fs::remove_file(self.path_for(backend_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
