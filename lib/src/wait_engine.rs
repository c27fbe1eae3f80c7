//! Resuming a session: pending sentinel or shell idleness

use crate::cleaner::{delta_since, NO_NEW_OUTPUT};
use crate::exec_engine::{pause, poll_budget};
use crate::framing::{FrameScanner, FrameState, Sentinel};
use crate::terminal_manager::{CommandOutcome, TerminalManager};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Foreground process names that mean the shell itself has the pane
const SHELL_NAMES: &[&str] = &["bash", "sh", "zsh", "dash", "fish", "ksh", "ash", "tcsh", "csh"];

fn is_shell(process: &str) -> bool {
    let name = process.trim().trim_start_matches('-');
    let name = name.rsplit('/').next().unwrap_or(name);
    SHELL_NAMES.contains(&name)
}

impl TerminalManager {
    /// Wait for session `id` to finish what it is running, up to `timeout`
    ///
    /// With a pending sentinel this completes when its done marker appears
    /// and reports the exit code. Without one it waits for the shell to have
    /// no foreground children. Output is always the cleaned delta since the
    /// session's baseline.
    pub async fn wait(
        &self,
        id: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<CommandOutcome> {
        let backend = self.require_session(id).await?;
        let pending = self
            .registry
            .read()
            .await
            .get(id)
            .and_then(|entry| entry.pending_sentinel.clone());

        if let Some(marker) = pending {
            match Sentinel::from_done_marker(&marker) {
                Some(sentinel) => {
                    return self
                        .wait_for_sentinel(id, &backend, &sentinel, timeout, cancel)
                        .await;
                }
                None => {
                    tracing::warn!("Dropping unusable pending marker {:?} on {}", marker, backend);
                    self.clear_pending(id, &backend).await?;
                }
            }
        }
        self.wait_for_idle(id, &backend, timeout, cancel).await
    }

    /// Whether the pane's shell has no running child processes
    pub(crate) async fn shell_idle(&self, backend: &str) -> crate::Result<bool> {
        let foreground = self.multiplexer.pane_current_command(backend).await?;
        if !is_shell(&foreground) {
            tracing::trace!("{} is running {}", backend, foreground);
            return Ok(false);
        }
        match self.multiplexer.pane_pid(backend).await? {
            Some(pid) => Ok(!self.multiplexer.has_child_processes(pid).await?),
            None => Ok(true),
        }
    }

    async fn baseline_of(&self, id: &str) -> crate::Result<String> {
        self.registry
            .read()
            .await
            .get(id)
            .map(|entry| entry.last_captured.clone())
            .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))
    }

    async fn wait_for_sentinel(
        &self,
        id: &str,
        backend: &str,
        sentinel: &Sentinel,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<CommandOutcome> {
        let (interval, mut stream) = self.poll_mode(id).await;
        let iterations = poll_budget(timeout, interval);
        let baseline = self.baseline_of(id).await?;
        let mut scanner = FrameScanner::new(sentinel);
        let mut last_capture = baseline.clone();
        let mut interrupted = false;

        tracing::info!("Waiting on {} for {}", backend, sentinel.done_marker());
        for iteration in 0..iterations {
            if iteration > 0 && !pause(interval, cancel).await {
                tracing::info!("Wait on {} cancelled; command keeps running", backend);
                break;
            }
            let captured = self.capture_session(id, backend).await?;
            scanner.feed(&captured);
            if let Some(cursor) = stream.as_mut() {
                cursor.forward(&self.cleaner, delta_since(&baseline, &captured));
            }
            last_capture = captured;
            if scanner.is_done() {
                break;
            }

            // An interrupt kills the whole command line, done marker included
            let was_interrupted = self
                .registry
                .read()
                .await
                .get(id)
                .is_some_and(|entry| entry.interrupted);
            if was_interrupted && self.shell_idle(backend).await? {
                interrupted = true;
                break;
            }
        }

        if let FrameState::Done {
            body_start,
            body_end,
            exit_code,
        } = scanner.state()
        {
            let start = baseline.len().max(body_start).min(body_end);
            let cleaned = last_capture
                .get(start..body_end)
                .map(|body| self.cleaner.clean(body))
                .unwrap_or_default();
            let output = if cleaned.is_empty() {
                NO_NEW_OUTPUT.to_string()
            } else {
                cleaned
            };
            self.finish_pending(id, backend, &last_capture).await?;
            tracing::info!("Pending command in {} finished with exit code {}", backend, exit_code);
            return Ok(CommandOutcome {
                session: id.to_string(),
                output,
                exit_code: Some(exit_code),
                timed_out: false,
            });
        }

        let output = self.cleaner.render_delta(&baseline, &last_capture);
        if interrupted {
            self.finish_pending(id, backend, &last_capture).await?;
            tracing::info!("Pending command in {} was interrupted", backend);
            return Ok(CommandOutcome {
                session: id.to_string(),
                output,
                exit_code: None,
                timed_out: false,
            });
        }

        if let Some(entry) = self.registry.write().await.get_mut(id) {
            entry.advance_baseline(&last_capture);
        }
        self.persist_pending(id).await?;
        tracing::warn!("Still waiting on {} after {:?}", backend, timeout);
        Ok(CommandOutcome {
            session: id.to_string(),
            output,
            exit_code: None,
            timed_out: true,
        })
    }

    /// Drop the pending sentinel and hand the session back to the pool
    async fn finish_pending(&self, id: &str, backend: &str, captured: &str) -> crate::Result<()> {
        self.clear_pending(id, backend).await?;
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.get_mut(id) {
            entry.advance_baseline(captured);
        }
        registry.release(id)
    }

    async fn wait_for_idle(
        &self,
        id: &str,
        backend: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<CommandOutcome> {
        let (interval, mut stream) = self.poll_mode(id).await;
        let iterations = poll_budget(timeout, interval);
        let baseline = self.baseline_of(id).await?;
        let mut idle = false;

        for iteration in 0..iterations {
            if iteration > 0 && !pause(interval, cancel).await {
                break;
            }
            if let Some(cursor) = stream.as_mut() {
                let captured = self.capture_session(id, backend).await?;
                cursor.forward(&self.cleaner, delta_since(&baseline, &captured));
            }
            if self.shell_idle(backend).await? {
                idle = true;
                break;
            }
        }

        let captured = self.capture_session(id, backend).await?;
        let output = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))?;
            let output = self.cleaner.render_delta(&entry.last_captured, &captured);
            entry.advance_baseline(&captured);
            output
        };

        if !idle {
            tracing::warn!("Shell in {} still busy after {:?}", backend, timeout);
        }
        Ok(CommandOutcome {
            session: id.to_string(),
            output,
            exit_code: None,
            timed_out: !idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminalConfig;
    use crate::state_store::PENDING_SENTINEL_KEY;
    use crate::testing::{FakeCommand, FakeSandbox};
    use std::sync::Arc;

    fn test_config() -> TerminalConfig {
        let mut config = TerminalConfig::default();
        config.polling.batch_interval_ms = 5;
        config.polling.stream_interval_ms = 5;
        config
    }

    #[test]
    fn test_is_shell() {
        assert!(is_shell("bash"));
        assert!(is_shell("-zsh"));
        assert!(is_shell("/bin/sh\n"));
        assert!(!is_shell("python3"));
        assert!(!is_shell("sleep"));
    }

    #[tokio::test]
    async fn test_wait_resumes_timed_out_command() {
        let sandbox = Arc::new(FakeSandbox::new().with_command(
            "deploy",
            FakeCommand::new(["uploading", "verifying", "deployed"]).ticks(30),
        ));
        let manager = TerminalManager::new("chat-1", sandbox.clone(), test_config()).unwrap();

        let id = manager.acquire_session(None).await.unwrap();
        let first = manager.exec(&id, "deploy", Duration::from_millis(10), None).await.unwrap();
        assert!(first.timed_out);

        let done = manager.wait(&id, Duration::from_secs(5), None).await.unwrap();
        assert!(!done.timed_out);
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(first.output, "uploading\nverifying");
        assert_eq!(done.output, "deployed");
        assert_eq!(sandbox.submissions("deploy"), 1);

        let info = &manager.sessions().await[0];
        assert!(!info.busy);
        assert!(!info.pending);
        assert_eq!(sandbox.env_value("ta-chat-1-s0", PENDING_SENTINEL_KEY), None);
    }

    #[tokio::test]
    async fn test_wait_times_out_again_and_keeps_pending() {
        let sandbox = Arc::new(
            FakeSandbox::new().with_command("slow", FakeCommand::new(Vec::<String>::new()).ticks(10_000)),
        );
        let manager = TerminalManager::new("chat-1", sandbox, test_config()).unwrap();

        let id = manager.acquire_session(None).await.unwrap();
        manager.exec(&id, "slow", Duration::from_millis(10), None).await.unwrap();
        let outcome = manager.wait(&id, Duration::from_millis(20), None).await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.output, NO_NEW_OUTPUT);
        assert!(manager.sessions().await[0].pending);
    }

    #[tokio::test]
    async fn test_wait_after_interrupt_does_not_hang() {
        let sandbox = Arc::new(FakeSandbox::new());
        let manager = TerminalManager::new("chat-1", sandbox, test_config()).unwrap();

        let id = manager.acquire_session(None).await.unwrap();
        let first = manager.exec(&id, "sleep 100", Duration::from_millis(10), None).await.unwrap();
        assert!(first.timed_out);

        manager.send(&id, "C-c").await.unwrap();
        assert!(manager.view(&id).await.unwrap().contains("^C"));

        let outcome = manager.wait(&id, Duration::from_secs(5), None).await.unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(!manager.sessions().await[0].pending);
    }

    #[tokio::test]
    async fn test_wait_without_pending_checks_idleness() {
        let sandbox = Arc::new(FakeSandbox::new());
        let manager = TerminalManager::new("chat-1", sandbox, test_config()).unwrap();

        let id = manager.acquire_session(None).await.unwrap();
        manager.send(&id, "echo ready").await.unwrap();
        let outcome = manager.wait(&id, Duration::from_secs(1), None).await.unwrap();

        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.output.contains("ready"));
    }

    #[tokio::test]
    async fn test_wait_idleness_times_out_while_program_runs() {
        let sandbox = Arc::new(FakeSandbox::new().with_command(
            "python3",
            FakeCommand::new([">>>"]).ticks(10_000).program("python3"),
        ));
        let manager = TerminalManager::new("chat-1", sandbox, test_config()).unwrap();

        let id = manager.acquire_session(None).await.unwrap();
        manager.send(&id, "python3").await.unwrap();
        let outcome = manager.wait(&id, Duration::from_millis(20), None).await.unwrap();
        assert!(outcome.timed_out);
    }

    #[tokio::test]
    async fn test_wait_unknown_session() {
        let sandbox = Arc::new(FakeSandbox::new());
        let manager = TerminalManager::new("chat-1", sandbox, test_config()).unwrap();
        let result = manager.wait("ghost", Duration::from_secs(1), None).await;
        assert!(matches!(result, Err(crate::TerminalError::SessionNotFound(_))));
    }
}
