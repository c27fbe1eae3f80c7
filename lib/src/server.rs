//! Line-oriented JSON server for the terminal tool
//!
//! Each input line is one action object; each answer is one result line.
//! Live output, when enabled, is written as `output` lines ahead of the
//! result it belongs to.

use crate::tools::{SessionOutputSink, TerminalAction, TerminalToolHandler, TerminalToolResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

/// One line written by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Result(ResultLine),
    Output { session: String, chunk: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultLine {
    /// Request id echoed back when the action carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub result: TerminalToolResult,
}

impl ServerMessage {
    fn result(id: Option<serde_json::Value>, result: TerminalToolResult) -> Self {
        ServerMessage::Result(ResultLine { id, result })
    }
}

/// Serves terminal actions over a pair of byte streams
pub struct TerminalAgentServer {
    handler: TerminalToolHandler,
    stream_output: bool,
    shutdown: CancellationToken,
}

impl TerminalAgentServer {
    pub fn new(handler: TerminalToolHandler) -> Self {
        Self {
            handler,
            stream_output: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// Emit `output` lines while exec and wait poll
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.stream_output = enabled;
        self
    }

    /// Token cancelled when the server stops; in-flight poll loops observe it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the server on stdin/stdout
    pub async fn start_stdio(&self) -> crate::Result<()> {
        info!("Starting terminal server on stdio");
        self.start_with_streams(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Start on stdio and stop on SIGINT/SIGTERM
    ///
    /// Stopping only ends local polling; commands already running in the
    /// sandbox keep running and can be resumed by a later `wait`.
    pub async fn start_with_shutdown(&self) -> crate::Result<()> {
        info!("Starting terminal server with shutdown handling");

        let token = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            match Self::wait_for_signal().await {
                Ok(()) => {
                    info!("Received shutdown signal, stopping server");
                    token.cancel();
                }
                Err(e) => warn!("Signal handling unavailable: {}", e),
            }
        });

        let result = self.start_stdio().await;
        signal_task.abort();
        info!("Server stopped: {:?}", result);
        result
    }

    async fn wait_for_signal() -> crate::Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C");
        }

        Ok(())
    }

    /// Serve until the reader is exhausted or the server is shut down
    pub async fn start_with_streams<R, W>(&self, reader: R, writer: W) -> crate::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel::<ServerMessage>();
        let writer_task = tokio::spawn(Self::write_messages(receiver, writer));

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, no longer reading requests");
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = self.handle_line(&line, &sender).await;
            if sender.send(message).is_err() {
                error!("Response writer stopped; dropping remaining requests");
                break;
            }
        }

        drop(sender);
        writer_task
            .await
            .map_err(|e| crate::TerminalError::Internal(format!("Writer task failed: {}", e)))?
    }

    /// Handle a single request line
    async fn handle_line(
        &self,
        line: &str,
        sender: &mpsc::UnboundedSender<ServerMessage>,
    ) -> ServerMessage {
        let request: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Malformed request line: {}", e);
                return ServerMessage::result(
                    None,
                    TerminalToolResult::failure(format!("Malformed request: {}", e)),
                );
            }
        };
        let id = request.get("id").cloned();
        let request_id = Ulid::new();

        let action: TerminalAction = match serde_json::from_value(request) {
            Ok(action) => action,
            Err(e) => {
                warn!("Request {} is not a terminal action: {}", request_id, e);
                return ServerMessage::result(
                    id,
                    TerminalToolResult::failure(format!("Malformed terminal action: {}", e)),
                );
            }
        };
        info!("Request {}: {}", request_id, action.name());

        let sink = self.stream_output.then(|| {
            let sender = sender.clone();
            let sink: SessionOutputSink = Arc::new(move |session: &str, chunk: &str| {
                // Never blocks: the writer task drains the channel
                let _ = sender.send(ServerMessage::Output {
                    session: session.to_string(),
                    chunk: chunk.to_string(),
                });
            });
            sink
        });

        let result = self.handler.handle(action, sink, Some(&self.shutdown)).await;
        ServerMessage::result(id, result)
    }

    async fn write_messages<W>(
        mut receiver: mpsc::UnboundedReceiver<ServerMessage>,
        mut writer: W,
    ) -> crate::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(message) = receiver.recv().await {
            let line = format!("{}\n", serde_json::to_string(&message)?);
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
