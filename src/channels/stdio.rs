//! Stdio channel: newline-delimited JSON-RPC over stdin/stdout.
//!
//! Every request runs in its own task so a slow provider never holds up a
//! fast one; a single writer task owns stdout. When stdin closes the agent
//! is gone, and every in-flight task is aborted. Aborting drops the
//! provider sessions those tasks hold, which kills their children.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::channels::RpcDispatcher;
use crate::error::ChannelError;

/// Responses buffered between handlers and the writer.
const OUTBOUND_CAPACITY: usize = 64;

pub struct StdioChannel {
    dispatcher: Arc<RpcDispatcher>,
}

impl StdioChannel {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Serve the process's own stdin and stdout until stdin closes.
    pub async fn run(&self) -> Result<(), ChannelError> {
        tracing::info!("Serving MCP on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve an arbitrary reader/writer pair until the reader ends.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), ChannelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut lines = BufReader::new(reader).lines();
        let mut in_flight = JoinSet::new();

        let read_error = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let dispatcher = self.dispatcher.clone();
                        let tx = tx.clone();
                        in_flight.spawn(async move {
                            if let Some(response) = dispatcher.handle_line(&line).await {
                                let _ = tx.send(response).await;
                            }
                        });
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e),
                },
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = done
                        && e.is_panic()
                    {
                        tracing::error!("Request handler panicked: {}", e);
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            tracing::info!(
                "Agent disconnected; cancelling {} in-flight request(s)",
                in_flight.len()
            );
        }
        in_flight.shutdown().await;

        drop(tx);
        if let Err(e) = writer_task.await {
            tracing::warn!("Stdout writer ended abnormally: {}", e);
        }

        match read_error {
            Some(e) => Err(ChannelError::Io(e)),
            None => {
                tracing::info!("Stdin closed; stdio channel stopped");
                Ok(())
            }
        }
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!("Failed to write response: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("Failed to flush response: {}", e);
            break;
        }
    }
}
