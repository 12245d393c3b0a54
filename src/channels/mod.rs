//! Agent-facing MCP server.
//!
//! The broker speaks the same JSON-RPC protocol toward the agent that it
//! speaks toward providers. [`RpcDispatcher`] handles one message; the
//! channels move messages in and out:
//!
//! ```text
//!   stdin lines ──▶ StdioChannel ──┐
//!                                  ├──▶ RpcDispatcher ──▶ ToolRegistry ──▶ Broker
//!   POST /mcp   ──▶ HttpChannel  ──┘
//! ```

pub mod http;
pub mod stdio;

use std::sync::Arc;

use serde_json::{Value, json};

use crate::tools::{ToolError, ToolOutput, ToolRegistry};
use crate::transport::protocol::{
    INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION, RpcRequest,
    RpcResponse,
};

pub use http::HttpChannel;
pub use stdio::StdioChannel;

/// Name announced in `initialize`.
pub const SERVER_NAME: &str = "mcp-forge";

/// Routes JSON-RPC messages to tools.
pub struct RpcDispatcher {
    tools: Arc<ToolRegistry>,
}

impl RpcDispatcher {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }

    /// Handle one raw message. `None` when no reply is due (notifications).
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let response = match serde_json::from_str::<Value>(line.trim()) {
            Ok(value) => self.handle_value(value).await?,
            Err(e) => RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {}", e)),
        };
        match serde_json::to_string(&response) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                None
            }
        }
    }

    pub async fn handle_value(&self, value: Value) -> Option<RpcResponse> {
        if value.is_array() {
            return Some(RpcResponse::failure(
                Value::Null,
                INVALID_REQUEST,
                "batch requests are not supported",
            ));
        }
        // A response to something we never asked; nothing to do.
        if value.get("method").is_none() && value.get("id").is_some() {
            tracing::debug!("Ignoring unsolicited response from client");
            return None;
        }

        let request: RpcRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return Some(RpcResponse::failure(
                    Value::Null,
                    INVALID_REQUEST,
                    format!("Invalid request: {}", e),
                ));
            }
        };

        let Some(id) = request.id.clone() else {
            self.handle_notification(&request.method);
            return None;
        };

        Some(match self.handle_request(request).await {
            Ok(result) => RpcResponse::success(id, result),
            Err((code, message)) => RpcResponse::failure(id, code, message),
        })
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => tracing::info!("Agent session initialized"),
            "notifications/cancelled" => tracing::debug!("Agent cancelled a request"),
            other => tracing::debug!("Ignoring notification {}", other),
        }
    }

    async fn handle_request(&self, request: RpcRequest) -> Result<Value, (i64, String)> {
        match request.method.as_str() {
            "initialize" => Ok(initialize_result(request.params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.tools.schemas().await })),
            "tools/call" => self.call_tool(request.params).await,
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
        }
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, (i64, String)> {
        let params = params.unwrap_or_else(|| json!({}));
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "tools/call requires 'name'".to_string()))?;
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => json!({}),
            Some(args) => args.clone(),
        };

        tracing::debug!("tools/call {}", name);
        match self.tools.execute(name, arguments).await {
            Ok(output) => Ok(success_result(&output)),
            Err(ToolError::UnknownTool(tool)) => {
                Err((INVALID_PARAMS, format!("Unknown tool: {}", tool)))
            }
            Err(e) => Ok(error_result(&e)),
        }
    }
}

fn initialize_result(params: Option<&Value>) -> Value {
    let requested = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str)
        .unwrap_or(PROTOCOL_VERSION);
    json!({
        "protocolVersion": requested,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": "Register MCP servers with registry_add or scaffold_server, \
            inspect them with remote_discover and call their tools with remote_call.",
    })
}

fn success_result(output: &ToolOutput) -> Value {
    let structured = match &output.result {
        Value::Object(_) => output.result.clone(),
        other => json!({ "result": other }),
    };
    json!({
        "content": [{ "type": "text", "text": output.text() }],
        "structuredContent": structured,
        "isError": false,
    })
}

fn error_result(err: &ToolError) -> Value {
    let payload = err.payload();
    json!({
        "content": [{ "type": "text", "text": format!("{}: {}", payload.kind, payload.message) }],
        "structuredContent": { "error": payload },
        "isError": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Fails;

    #[async_trait]
    impl Tool for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn description(&self) -> &str {
            "Always rejects its input"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _params: Value) -> Result<ToolOutput, ToolError> {
            Err(ToolError::InvalidParameters("missing 'alias' parameter".to_string()))
        }
    }

    struct Lists;

    #[async_trait]
    impl Tool for Lists {
        fn name(&self) -> &str {
            "lists"
        }

        fn description(&self) -> &str {
            "Returns an array"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _params: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::success(json!([1, 2]), Duration::ZERO))
        }
    }

    async fn dispatcher() -> RpcDispatcher {
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(Fails)).await;
        tools.register(Arc::new(Lists)).await;
        RpcDispatcher::new(tools)
    }

    async fn call(d: &RpcDispatcher, message: Value) -> Value {
        let line = d.handle_line(&message.to_string()).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let d = dispatcher().await;

        let init = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize",
                   "params": {"protocolVersion": "2025-03-26", "capabilities": {}}}),
        )
        .await;
        assert_eq!(init["result"]["serverInfo"]["name"], "mcp-forge");
        assert_eq!(init["result"]["protocolVersion"], "2025-03-26");

        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        assert!(d.handle_line(&note.to_string()).await.is_none());

        let list = call(&d, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})).await;
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["fails", "lists"]);
        assert!(list["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_tool_results() {
        let d = dispatcher().await;

        let ok = call(
            &d,
            json!({"jsonrpc": "2.0", "id": "a", "method": "tools/call", "params": {"name": "lists"}}),
        )
        .await;
        assert_eq!(ok["id"], "a");
        assert_eq!(ok["result"]["isError"], false);
        assert_eq!(ok["result"]["structuredContent"]["result"], json!([1, 2]));

        let failed = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                   "params": {"name": "fails", "arguments": {}}}),
        )
        .await;
        assert_eq!(failed["result"]["isError"], true);
        assert_eq!(
            failed["result"]["structuredContent"]["error"]["kind"],
            "invalid_arguments"
        );

        let unknown = call(
            &d,
            json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "nope"}}),
        )
        .await;
        assert_eq!(unknown["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let d = dispatcher().await;

        let parse: Value = serde_json::from_str(&d.handle_line("{not json").await.unwrap()).unwrap();
        assert_eq!(parse["error"]["code"], PARSE_ERROR);
        assert!(parse["id"].is_null());

        let missing = call(&d, json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"})).await;
        assert_eq!(missing["error"]["code"], METHOD_NOT_FOUND);

        let ping = call(&d, json!({"jsonrpc": "2.0", "id": 6, "method": "ping"})).await;
        assert_eq!(ping["result"], json!({}));

        let batch = call(&d, json!([{"jsonrpc": "2.0", "id": 7, "method": "ping"}])).await;
        assert_eq!(batch["error"]["code"], INVALID_REQUEST);
    }
}
