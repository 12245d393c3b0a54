//! Transport client: one session per provider operation.
//!
//! ```text
//!   discover / invoke
//!         │
//!         ▼
//!   TransportClient::open ──▶ ProcessSession  (child over stdin/stdout)
//!         │              └─▶ NetworkSession  (HTTP POST, JSON or event stream)
//!         ▼
//!   initialize ─▶ notifications/initialized ─▶ tools/list | tools/call
//!         │
//!         ▼
//!   close (always, on success and on error)
//! ```
//!
//! Sessions are never pooled. A process session that is dropped mid-flight
//! (timeout, agent disconnect) kills its child.

mod network;
mod process;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::registry::{LaunchSpec, ProviderDescriptor, TransportKind};

pub use network::NetworkSession;
pub use process::ProcessSession;
pub use protocol::{CallOutcome, ToolInfo};

use protocol::{ToolPage, call_tool_params, initialize_params, list_tools_params};

/// Upper bound on `tools/list` pages followed for one discovery.
const MAX_TOOL_PAGES: u64 = 64;

/// One open conversation with a provider.
#[async_trait]
pub trait Session: Send {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for its correlated response.
    async fn request(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    async fn notify(&mut self, method: &str) -> Result<(), TransportError>;

    /// End the session and release its resources.
    async fn close(self: Box<Self>);
}

/// The two operations the broker performs against any provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn discover(&self, descriptor: &ProviderDescriptor)
    -> Result<Vec<ToolInfo>, TransportError>;

    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        tool: &str,
        arguments: Value,
    ) -> Result<CallOutcome, TransportError>;
}

/// Transport client dispatching on the descriptor's launch spec.
pub struct TransportClient {
    config: TransportConfig,
    http: reqwest::Client,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.handshake_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { config, http }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open a session and complete the handshake.
    async fn open(&self, descriptor: &ProviderDescriptor) -> Result<Box<dyn Session>, TransportError> {
        let mut session: Box<dyn Session> = match &descriptor.launch {
            LaunchSpec::Process { command, args } => {
                let working_dir = descriptor
                    .source
                    .as_ref()
                    .map(|s| s.path.as_path())
                    .filter(|p| p.is_dir());
                Box::new(ProcessSession::spawn(
                    command,
                    args,
                    &descriptor.environment,
                    working_dir,
                    self.config.shutdown_grace,
                )?
                .with_notify_timeout(self.config.handshake_timeout))
            }
            LaunchSpec::Network { url } => Box::new(NetworkSession::new(
                self.http.clone(),
                url,
                &descriptor.environment,
                self.config.request_timeout,
            )),
        };

        tracing::debug!(
            "Opened {} session to '{}'",
            session.kind().as_str(),
            descriptor.alias
        );

        match self.handshake(session.as_mut()).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, session: &mut dyn Session) -> Result<(), TransportError> {
        let timeout = self.config.handshake_timeout;
        let kind = session.kind();

        session
            .request(1, "initialize", initialize_params(), timeout)
            .await
            .map_err(|e| match e {
                TransportError::Timeout(d) if kind == TransportKind::Process => {
                    TransportError::HandshakeTimeout(d)
                }
                TransportError::Remote { message, .. } => {
                    TransportError::protocol(format!("initialize rejected: {}", message))
                }
                other => other,
            })?;

        session.notify("notifications/initialized").await
    }

    async fn list_all(&self, session: &mut dyn Session) -> Result<Vec<ToolInfo>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..MAX_TOOL_PAGES {
            let result = session
                .request(
                    2 + page,
                    "tools/list",
                    list_tools_params(cursor.as_deref()),
                    self.config.request_timeout,
                )
                .await?;
            let page = ToolPage::from_result(result)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!("Stopped following tools/list cursors after {} pages", MAX_TOOL_PAGES);
        Ok(tools)
    }
}

#[async_trait]
impl ProviderTransport for TransportClient {
    async fn discover(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Vec<ToolInfo>, TransportError> {
        let mut session = self.open(descriptor).await?;
        let result = self.list_all(session.as_mut()).await;
        session.close().await;

        if let Ok(tools) = &result {
            tracing::info!("Discovered {} tools on '{}'", tools.len(), descriptor.alias);
        }
        result
    }

    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        tool: &str,
        arguments: Value,
    ) -> Result<CallOutcome, TransportError> {
        let mut session = self.open(descriptor).await?;
        let result = session
            .request(
                2,
                "tools/call",
                call_tool_params(tool, arguments),
                self.config.request_timeout,
            )
            .await
            .and_then(CallOutcome::from_result);
        session.close().await;
        result
    }
}
