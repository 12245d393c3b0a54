//! Registry tools: add, list, remove and inspect providers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::registry::{Registration, TransportKind};
use crate::tools::builtin::{
    DESCRIPTOR_FIELDS, invalid_arguments, optional_str, require_str, respond, string_list,
    string_map,
};
use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// `registry_add`: register an external provider.
pub struct RegistryAddTool {
    broker: Arc<Broker>,
}

impl RegistryAddTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for RegistryAddTool {
    fn name(&self) -> &str {
        "registry_add"
    }

    fn description(&self) -> &str {
        "Register an MCP server under an alias. Use transport 'stdio' with a command \
         and args, or 'sse'/'http' with a url. Environment values are stored as secrets \
         and never shown again."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "alias": {
                    "type": "string",
                    "description": "Short unique name (lowercase letters, digits, '-', '_')"
                },
                "transport": {
                    "type": "string",
                    "enum": ["stdio", "process", "sse", "http", "network"],
                    "description": "How to reach the server"
                },
                "command": {
                    "type": "string",
                    "description": "For stdio: the executable to run (e.g. 'python3', 'npx')"
                },
                "args": {
                    "description": "For stdio: argument list, as an array or a JSON-encoded array"
                },
                "url": {
                    "type": "string",
                    "description": "For sse/http: the endpoint URL"
                },
                "env": {
                    "description": "Environment variables for the server, as an object or JSON string"
                },
                "description": {
                    "type": "string",
                    "description": "What this server does"
                }
            },
            "required": ["alias", "transport"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();

        let result = match registration(&params) {
            Ok(registration) => self.broker.register(registration).await,
            Err(e) => {
                let alias = params.get("alias").and_then(Value::as_str);
                self.broker.reject("register", alias, e, start).await
            }
        };
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}

fn registration(params: &Value) -> Result<Registration, BrokerError> {
    let transport: TransportKind = require_str(params, "transport")
        .map_err(invalid_arguments)?
        .parse()?;

    Ok(Registration {
        alias: require_str(params, "alias").map_err(invalid_arguments)?.to_string(),
        transport,
        command: optional_str(params, "command")
            .map_err(invalid_arguments)?
            .map(String::from),
        args: string_list(params, "args").map_err(invalid_arguments)?,
        url: optional_str(params, "url")
            .map_err(invalid_arguments)?
            .map(String::from),
        environment: string_map(params, "env").map_err(invalid_arguments)?,
        description: optional_str(params, "description")
            .map_err(invalid_arguments)?
            .unwrap_or_default()
            .to_string(),
    })
}

/// `registry_list`: every provider, secrets masked.
pub struct RegistryListTool {
    broker: Arc<Broker>,
}

impl RegistryListTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for RegistryListTool {
    fn name(&self) -> &str {
        "registry_list"
    }

    fn description(&self) -> &str {
        "List all registered MCP servers with their transport, build state and \
         (masked) environment."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let providers = self.broker.list().await;
        let result = json!({
            "count": providers.len(),
            "providers": providers,
        });
        respond(&self.broker, Ok(result), start, DESCRIPTOR_FIELDS).await
    }
}

/// `registry_remove`: forget a provider. Managed source stays on disk.
pub struct RegistryRemoveTool {
    broker: Arc<Broker>,
}

impl RegistryRemoveTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for RegistryRemoveTool {
    fn name(&self) -> &str {
        "registry_remove"
    }

    fn description(&self) -> &str {
        "Remove a server from the registry. Files of managed servers are kept; \
         delete them by hand if they are no longer wanted."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "alias": { "type": "string", "description": "Alias to remove" }
            },
            "required": ["alias"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let alias = require_str(&params, "alias")?;
        let result = self.broker.remove(alias).await.map(|view| {
            json!({
                "removed": view.alias,
                "files_kept_at": view.source.map(|s| s.path),
            })
        });
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}

/// `server_status`: one provider's registry entry and build activity.
pub struct ServerStatusTool {
    broker: Arc<Broker>,
}

impl ServerStatusTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for ServerStatusTool {
    fn name(&self) -> &str {
        "server_status"
    }

    fn description(&self) -> &str {
        "Show a server's registry entry (secrets masked), build state, and whether a \
         build is running."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Server alias" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let name = require_str(&params, "name")?;
        let result = self.broker.status(name).await;
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}
