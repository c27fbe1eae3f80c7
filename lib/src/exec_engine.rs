//! Command execution with sentinel-based completion detection

use crate::cleaner::OutputCleaner;
use crate::framing::{FrameScanner, Sentinel};
use crate::sandbox::OutputSink;
use crate::terminal_manager::{CommandOutcome, TerminalManager};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Number of poll iterations that fit in `timeout`
pub(crate) fn poll_budget(timeout: Duration, interval: Duration) -> u64 {
    let interval_ms = interval.as_millis().max(1);
    let iterations = timeout.as_millis().div_ceil(interval_ms);
    u64::try_from(iterations).unwrap_or(u64::MAX).max(1)
}

/// Sleep for one poll interval; false when cancelled first
pub(crate) async fn pause(interval: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(interval) => true,
            _ = token.cancelled() => false,
        },
        None => {
            tokio::time::sleep(interval).await;
            true
        }
    }
}

/// Forwards the complete lines of a growing text to a stream subscriber
pub(crate) struct StreamCursor {
    sink: OutputSink,
    sent: usize,
}

impl StreamCursor {
    pub(crate) fn new(sink: OutputSink) -> Self {
        Self { sink, sent: 0 }
    }

    pub(crate) fn forward(&mut self, cleaner: &OutputCleaner, text: &str) {
        let Some(complete) = text.rfind('\n').map(|i| i + 1) else {
            return;
        };
        if complete <= self.sent {
            return;
        }
        let Some(fresh) = text.get(self.sent..complete) else {
            self.sent = complete;
            return;
        };
        self.sent = complete;

        let cleaned = cleaner.clean(fresh);
        if !cleaned.is_empty() {
            (self.sink)(&format!("{}\n", cleaned));
        }
    }
}

impl TerminalManager {
    /// Poll interval and live sink for one exec/wait call on `id`
    pub(crate) async fn poll_mode(&self, id: &str) -> (Duration, Option<StreamCursor>) {
        let cursor = if self.sandbox.supports_streaming() {
            self.subscription(id).await.map(StreamCursor::new)
        } else {
            None
        };
        (self.config.polling.interval(cursor.is_some()), cursor)
    }

    /// Run `command` in session `id` and wait for it up to `timeout`
    ///
    /// The session must have been acquired by the caller. On completion the
    /// session is released back to the idle pool. On timeout or cancellation
    /// the command keeps running: its sentinel is recorded as pending and the
    /// session stays busy until `wait` or `kill`.
    pub async fn exec(
        &self,
        id: &str,
        command: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> crate::Result<CommandOutcome> {
        // 1. Validate the session can take a command
        let backend = self.require_session(id).await?;
        {
            let registry = self.registry.read().await;
            if let Some(pending) = registry.get(id).and_then(|e| e.pending_sentinel.as_ref()) {
                return Err(crate::TerminalError::InvalidInput(format!(
                    "Session {} is still running a command ({}); wait for it or kill it",
                    id, pending
                )));
            }
        }
        self.registry.write().await.mark_busy(id)?;

        // 2. Submit the wrapped command
        let sentinel = Sentinel::new();
        tracing::info!("Executing in {}: {}", backend, command);
        self.multiplexer.paste_text(&backend, &sentinel.wrap(command)).await?;
        self.multiplexer.send_keys(&backend, &["Enter"]).await?;

        // 3. Poll for the done marker
        let (interval, mut stream) = self.poll_mode(id).await;
        let iterations = poll_budget(timeout, interval);
        let mut scanner = FrameScanner::new(&sentinel);
        let mut last_capture = String::new();

        for iteration in 0..iterations {
            if !pause(interval, cancel).await {
                tracing::info!("Polling of {} cancelled; command keeps running", backend);
                break;
            }
            let captured = self.capture_session(id, &backend).await?;
            scanner.feed(&captured);
            tracing::trace!("Poll {} of {} on {}: {:?}", iteration + 1, iterations, backend, scanner.state());

            if let (Some(cursor), Some(body)) = (stream.as_mut(), scanner.body(&captured)) {
                cursor.forward(&self.cleaner, body);
            }
            last_capture = captured;
            if scanner.is_done() {
                break;
            }
        }

        let partial = scanner
            .body(&last_capture)
            .map(|body| self.cleaner.clean(body))
            .unwrap_or_default();

        // 4. Completed: hand the session back
        if let Some(exit_code) = scanner.exit_code() {
            {
                let mut registry = self.registry.write().await;
                if let Some(entry) = registry.get_mut(id) {
                    entry.advance_baseline(&last_capture);
                }
                registry.release(id)?;
            }
            tracing::info!("Command in {} finished with exit code {}", backend, exit_code);
            return Ok(CommandOutcome {
                session: id.to_string(),
                output: partial,
                exit_code: Some(exit_code),
                timed_out: false,
            });
        }

        // 5. Timed out: remember the sentinel so wait can pick up from here
        {
            let mut registry = self.registry.write().await;
            if let Some(entry) = registry.get_mut(id) {
                entry.advance_baseline(&last_capture);
                entry.pending_sentinel = Some(sentinel.done_marker());
                entry.interrupted = false;
            }
        }
        self.persist_pending(id).await?;
        tracing::warn!("Command in {} timed out after {:?}, left pending", backend, timeout);

        Ok(CommandOutcome {
            session: id.to_string(),
            output: partial,
            exit_code: None,
            timed_out: true,
        })
    }
}
