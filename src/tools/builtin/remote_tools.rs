//! Remote tools: discover and call tools on registered providers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::broker::Broker;
use crate::tools::builtin::{
    DISCOVERY_FIELDS, inline_or_encoded, invalid_arguments, require_str, respond,
};
use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// `remote_discover`: list a provider's tools.
pub struct RemoteDiscoverTool {
    broker: Arc<Broker>,
}

impl RemoteDiscoverTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for RemoteDiscoverTool {
    fn name(&self) -> &str {
        "remote_discover"
    }

    fn description(&self) -> &str {
        "Connect to a registered server and list the tools it offers, with their \
         descriptions and input schemas."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "alias": { "type": "string", "description": "Registered server alias" }
            },
            "required": ["alias"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let alias = require_str(&params, "alias")?;
        let result = self.broker.discover(alias).await.map(|tools| {
            json!({
                "alias": alias,
                "count": tools.len(),
                "tools": tools,
            })
        });
        respond(&self.broker, result, start, DISCOVERY_FIELDS).await
    }
}

/// `remote_call`: call one tool on a provider.
pub struct RemoteCallTool {
    broker: Arc<Broker>,
}

impl RemoteCallTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for RemoteCallTool {
    fn name(&self) -> &str {
        "remote_call"
    }

    fn description(&self) -> &str {
        "Call a tool on a registered server. Use remote_discover first to see the tool \
         names and their input schemas."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "alias": { "type": "string", "description": "Registered server alias" },
                "tool_name": { "type": "string", "description": "Tool to call" },
                "arguments": {
                    "description": "Tool arguments, as an object or a JSON-encoded object"
                }
            },
            "required": ["alias", "tool_name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let parsed = require_str(&params, "alias").and_then(|alias| {
            let tool = require_str(&params, "tool_name")?;
            let arguments = inline_or_encoded(&params, "arguments")?.unwrap_or_else(|| json!({}));
            Ok((alias, tool, arguments))
        });

        let result = match parsed {
            Ok((alias, tool, arguments)) => self.broker.invoke(alias, tool, arguments).await,
            Err(e) => {
                let alias = params.get("alias").and_then(Value::as_str);
                self.broker
                    .reject("invoke", alias, invalid_arguments(e), start)
                    .await
            }
        };
        respond(&self.broker, result, start, &[]).await
    }
}
