//! JSON-RPC 2.0 message types for the tool-invocation protocol.
//!
//! The broker is a client of this protocol toward providers and a server of
//! it toward the agent, so both directions share these types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name the broker announces itself with.
pub const CLIENT_NAME: &str = "mcp-forge";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// A request (with `id`) or a notification (without).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The result payload, or the remote error.
    pub fn into_result(self) -> Result<Value, TransportError> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(TransportError::Remote {
                code: Some(error.code),
                message: error.message,
                data: error.data,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(TransportError::protocol(
                "response carries neither result nor error",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message a peer may send us.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(RpcResponse),
    /// A notification or a peer-initiated request.
    Request(RpcRequest),
}

/// Classify one raw JSON message.
pub fn parse_message(raw: &str) -> Result<Incoming, TransportError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
        TransportError::protocol(format!("malformed message: {}", e))
    })?;

    if value.get("method").is_some() {
        serde_json::from_value(value)
            .map(Incoming::Request)
            .map_err(|e| TransportError::protocol(format!("malformed request: {}", e)))
    } else if value.get("id").is_some() {
        serde_json::from_value(value)
            .map(Incoming::Response)
            .map_err(|e| TransportError::protocol(format!("malformed response: {}", e)))
    } else {
        Err(TransportError::protocol(
            "message is neither a request nor a response",
        ))
    }
}

/// Whether a response id correlates with the numeric id we sent.
pub fn id_matches(id: &Value, expected: u64) -> bool {
    match id {
        Value::Number(n) => n.as_u64() == Some(expected),
        Value::String(s) => s.parse::<u64>().ok() == Some(expected),
        _ => false,
    }
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub fn list_tools_params(cursor: Option<&str>) -> Value {
    match cursor {
        Some(cursor) => serde_json::json!({ "cursor": cursor }),
        None => serde_json::json!({}),
    }
}

pub fn call_tool_params(name: &str, arguments: Value) -> Value {
    serde_json::json!({ "name": name, "arguments": arguments })
}

/// One tool advertised by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One page of a `tools/list` result.
#[derive(Debug, Deserialize)]
pub struct ToolPage {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

impl ToolPage {
    pub fn from_result(result: Value) -> Result<Self, TransportError> {
        serde_json::from_value(result)
            .map_err(|e| TransportError::protocol(format!("malformed tools/list result: {}", e)))
    }
}

/// Result of a `tools/call`, normalized across transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOutcome {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallOutcome {
    pub fn from_result(result: Value) -> Result<Self, TransportError> {
        serde_json::from_value(result)
            .map_err(|e| TransportError::protocol(format!("malformed tools/call result: {}", e)))
    }

    /// Concatenated text of all `text` content blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
