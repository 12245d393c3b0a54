//! HTTP channel: one JSON-RPC message per `POST /mcp`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::channels::RpcDispatcher;
use crate::error::ChannelError;

/// Maximum JSON body size for one request (1 MiB).
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct HttpChannel {
    dispatcher: Arc<RpcDispatcher>,
}

impl HttpChannel {
    pub fn new(dispatcher: Arc<RpcDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// The channel's routes with state applied.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/mcp", post(mcp_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(self.dispatcher.clone())
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn serve<F>(&self, addr: SocketAddr, shutdown: F) -> Result<(), ChannelError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "http".to_string(),
                reason: format!("Failed to bind to {}: {}", addr, e),
            })?;

        tracing::info!("Serving MCP on http://{}/mcp", addr);

        axum::serve(listener, self.routes())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("HTTP channel shutting down");
            })
            .await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    channel: String,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        channel: "http".to_string(),
    })
}

async fn mcp_handler(State(dispatcher): State<Arc<RpcDispatcher>>, body: String) -> Response {
    match dispatcher.handle_line(&body).await {
        Some(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply,
        )
            .into_response(),
        // Notifications get no body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}
