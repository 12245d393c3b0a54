//! Network variant: JSON-RPC over HTTP POST.
//!
//! A reply is either a plain JSON body or an event stream whose `data:`
//! lines carry JSON-RPC messages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::error::TransportError;
use crate::registry::{Environment, TransportKind};
use crate::safety::truncate_head;
use crate::transport::Session;
use crate::transport::protocol::{Incoming, RpcRequest, id_matches, parse_message};

/// Environment entry sent as a bearer token.
pub const AUTH_TOKEN_VAR: &str = "AUTH_TOKEN";

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Error bodies are cut to this many characters.
const MAX_ERROR_BODY: usize = 512;

pub struct NetworkSession {
    http: reqwest::Client,
    url: String,
    auth_token: Option<SecretString>,
    session_id: Option<String>,
    /// Timeout for notifications and session teardown.
    timeout: Duration,
}

impl NetworkSession {
    pub fn new(
        http: reqwest::Client,
        url: &str,
        environment: &Environment,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: url.to_string(),
            auth_token: environment
                .expose(AUTH_TOKEN_VAR)
                .filter(|t| !t.is_empty())
                .map(|t| SecretString::from(t.to_string())),
            session_id: None,
            timeout,
        }
    }

    async fn post(
        &mut self,
        message: &RpcRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self
            .http
            .post(&self.url)
            .timeout(timeout)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::BadStatus {
                status: status.as_u16(),
                body: truncate_head(body.trim(), MAX_ERROR_BODY),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Session for NetworkSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn request(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let response = self
            .post(&RpcRequest::new(id, method, params), timeout)
            .await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response.text().await.map_err(|e| classify(e, timeout))?;

        if is_stream {
            find_in_event_stream(&body, id)
        } else {
            match parse_message(&body)? {
                Incoming::Response(response) if id_matches(&response.id, id) => {
                    response.into_result()
                }
                Incoming::Response(response) => Err(TransportError::protocol(format!(
                    "response id {} does not match request {}",
                    response.id, id
                ))),
                Incoming::Request(_) => Err(TransportError::protocol(
                    "expected a response, got a request",
                )),
            }
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), TransportError> {
        let timeout = self.timeout;
        self.post(&RpcRequest::notification(method), timeout)
            .await
            .map(|_| ())
    }

    async fn close(self: Box<Self>) {
        // Streamable HTTP servers accept DELETE to end a session.
        let Some(session_id) = &self.session_id else {
            return;
        };
        let result = self
            .http
            .delete(&self.url)
            .timeout(self.timeout)
            .header(SESSION_HEADER, session_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!("Session teardown for {} failed: {}", self.url, e);
        }
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() || err.is_request() || err.is_builder() {
        TransportError::ConnectFailed {
            reason: err.to_string(),
        }
    } else {
        TransportError::protocol(format!("HTTP exchange failed: {}", err))
    }
}

/// Scan an event stream for the response correlated with `id`.
fn find_in_event_stream(body: &str, id: u64) -> Result<Value, TransportError> {
    for data in event_data(body) {
        match parse_message(&data)? {
            Incoming::Response(response) if id_matches(&response.id, id) => {
                return response.into_result();
            }
            Incoming::Response(response) => {
                return Err(TransportError::protocol(format!(
                    "response id {} does not match request {}",
                    response.id, id
                )));
            }
            Incoming::Request(request) => {
                tracing::trace!("Skipping streamed '{}'", request.method);
            }
        }
    }
    Err(TransportError::protocol(
        "event stream ended without a response",
    ))
}

/// Payloads of each event; multi-line `data:` fields are joined by newlines.
fn event_data(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                events.push(current.join("\n"));
                current.clear();
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            current.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }
    if !current.is_empty() {
        events.push(current.join("\n"));
    }
    events
}
