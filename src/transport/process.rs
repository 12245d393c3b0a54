//! Process variant: a child speaking line-delimited JSON-RPC on stdin/stdout.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::registry::{Environment, TransportKind};
use crate::safety::truncate_tail;
use crate::transport::Session;
use crate::transport::protocol::{
    Incoming, METHOD_NOT_FOUND, RpcRequest, RpcResponse, id_matches, parse_message,
};

/// Stderr kept for diagnostics (tail).
const MAX_STDERR: usize = 4 * 1024;

/// How long to wait for a child that closed stdout to report its status.
const EXIT_STATUS_WAIT: Duration = Duration::from_secs(1);

/// Bound on writing a notification unless configured otherwise.
const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProcessSession {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    grace: Duration,
    notify_timeout: Duration,
    /// Set once an exchange overran its deadline; close then kills at once.
    timed_out: bool,
}

impl ProcessSession {
    /// Launch the child. It is killed if the session is dropped.
    pub fn spawn(
        command: &str,
        args: &[String],
        environment: &Environment,
        working_dir: Option<&Path>,
        grace: Duration,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in environment.iter_exposed() {
            cmd.env(key, value);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::LaunchFailed {
            reason: format!("{}: {}", command, e),
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TransportError::LaunchFailed {
                reason: format!("{}: stdio was not captured", command),
            });
        };

        let buffer = Arc::new(Mutex::new(String::new()));
        let stderr_task = tokio::spawn(collect_stderr(stderr, buffer.clone()));

        tracing::debug!("Spawned provider process '{}' (pid {:?})", command, child.id());

        Ok(Self {
            command: command.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr: buffer,
            stderr_task: Some(stderr_task),
            grace,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            timed_out: false,
        })
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    async fn send(&mut self, message: &impl serde::Serialize) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| TransportError::protocol(format!("failed to encode message: {}", e)))?;
        line.push('\n');

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(TransportError::protocol("stdin already closed"));
        };
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            // A broken pipe means the child is gone.
            Err(_) => Err(self.exit_error().await),
        }
    }

    async fn read_response(&mut self, id: u64) -> Result<Value, TransportError> {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(self.exit_error().await),
                Err(e) => {
                    return Err(TransportError::protocol(format!(
                        "failed to read provider output: {}",
                        e
                    )));
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_message(&line)? {
                Incoming::Response(response) => {
                    if !id_matches(&response.id, id) {
                        return Err(TransportError::protocol(format!(
                            "response id {} does not match request {}",
                            response.id, id
                        )));
                    }
                    return response.into_result();
                }
                Incoming::Request(request) => {
                    tracing::trace!("Provider '{}' sent '{}'", self.command, request.method);
                    if let Some(peer_id) = request.id {
                        self.answer_peer(peer_id, &request.method).await?;
                    }
                }
            }
        }
    }

    /// Reply to a provider-initiated request; only `ping` is supported.
    async fn answer_peer(&mut self, id: Value, method: &str) -> Result<(), TransportError> {
        let reply = if method == "ping" {
            RpcResponse::success(id, serde_json::json!({}))
        } else {
            RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
        };
        self.send(&reply).await
    }

    /// Build the error for a child that stopped talking.
    async fn exit_error(&mut self) -> TransportError {
        let status = match tokio::time::timeout(EXIT_STATUS_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("status unavailable: {}", e),
            Err(_) => "closed its output".to_string(),
        };
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(EXIT_STATUS_WAIT, task).await;
        }
        let stderr = self
            .stderr
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        TransportError::PrematureExit { status, stderr }
    }
}

#[async_trait]
impl Session for ProcessSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn request(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        // The write is inside the deadline: a child that stops reading stdin
        // blocks any request larger than the pipe buffer.
        let exchange = async {
            self.send(&RpcRequest::new(id, method, params)).await?;
            self.read_response(id).await
        };
        let result = tokio::time::timeout(timeout, exchange).await;
        result.unwrap_or_else(|_| {
            self.timed_out = true;
            Err(TransportError::Timeout(timeout))
        })
    }

    async fn notify(&mut self, method: &str) -> Result<(), TransportError> {
        let timeout = self.notify_timeout;
        let result =
            tokio::time::timeout(timeout, self.send(&RpcRequest::notification(method))).await;
        result.unwrap_or_else(|_| {
            self.timed_out = true;
            Err(TransportError::Timeout(timeout))
        })
    }

    async fn close(mut self: Box<Self>) {
        // Closing stdin asks a well-behaved provider to exit.
        drop(self.stdin.take());

        if self.timed_out {
            tracing::debug!("Provider '{}' overran its deadline, killing it", self.command);
            if let Err(e) = self.child.kill().await {
                tracing::warn!("Failed to kill provider '{}': {}", self.command, e);
            }
        } else if tokio::time::timeout(self.grace, self.child.wait()).await.is_err() {
            tracing::debug!(
                "Provider '{}' ignored stdin close, killing it",
                self.command
            );
            if let Err(e) = self.child.kill().await {
                tracing::warn!("Failed to kill provider '{}': {}", self.command, e);
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

async fn collect_stderr(mut stderr: tokio::process::ChildStderr, buffer: Arc<Mutex<String>>) {
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                if let Ok(mut buf) = buffer.lock() {
                    buf.push_str(&text);
                    if buf.len() > MAX_STDERR {
                        let tail = truncate_tail(&buf, MAX_STDERR).to_string();
                        *buf = tail;
                    }
                }
            }
        }
    }
}
