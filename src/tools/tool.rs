//! Tool trait and types.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::ErrorPayload;
use crate::error::ErrorKind;

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A broker operation failed; the payload is already scrubbed.
    #[error("{}", .0.message)]
    Broker(ErrorPayload),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    /// Structured form handed back to the agent.
    pub fn payload(&self) -> ErrorPayload {
        match self {
            ToolError::Broker(payload) => payload.clone(),
            ToolError::InvalidParameters(_) | ToolError::UnknownTool(_) => ErrorPayload {
                kind: ErrorKind::InvalidArguments,
                message: self.to_string(),
                transport_kind: None,
            },
            ToolError::ExecutionFailed(_) => ErrorPayload {
                kind: ErrorKind::Internal,
                message: self.to_string(),
                transport_kind: None,
            },
        }
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// The result data.
    pub result: serde_json::Value,
    /// Time taken.
    pub duration: Duration,
}

impl ToolOutput {
    /// Create a successful output with a JSON result.
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    /// Text rendering for clients that only read `content`.
    pub fn text(&self) -> String {
        match &self.result {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// Definition of a tool's parameters using JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub parameters: serde_json::Value,
}

/// Trait for tools the agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name.
    fn name(&self) -> &str;

    /// Get a description of what the tool does.
    fn description(&self) -> &str;

    /// Get the JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Get the tool schema as advertised by `tools/list`.
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
