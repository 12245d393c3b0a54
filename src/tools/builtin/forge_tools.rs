//! Forge tools: scaffold, import, build and edit managed providers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::broker::Broker;
use crate::scaffold::{RepositoryRequest, ScaffoldRequest, Template};
use crate::tools::builtin::{
    DESCRIPTOR_FIELDS, optional_bool, optional_str, require_str, respond, string_list,
};
use crate::tools::tool::{Tool, ToolError, ToolOutput};

/// `scaffold_server`: new managed provider from a built-in template.
pub struct ScaffoldServerTool {
    broker: Arc<Broker>,
}

impl ScaffoldServerTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for ScaffoldServerTool {
    fn name(&self) -> &str {
        "scaffold_server"
    }

    fn description(&self) -> &str {
        "Create a new MCP server from a built-in template with one placeholder per \
         requested tool, and register it. Edit it with edit_server, then build_server."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Alias and directory name (e.g. 'weather-api')"
                },
                "language": {
                    "type": "string",
                    "enum": Template::AVAILABLE,
                    "description": "Template to use (default 'python')"
                },
                "tools": {
                    "description": "Tool names to stub, as an array or comma-separated string (default 'hello')"
                },
                "description": { "type": "string", "description": "What this server does" },
                "network_access": {
                    "type": "boolean",
                    "description": "Allow outbound network when run in a container (default false)"
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let request = ScaffoldRequest {
            alias: require_str(&params, "name")?.to_string(),
            template: optional_str(&params, "language")?
                .unwrap_or("python")
                .to_string(),
            tools: string_list(&params, "tools")?,
            description: optional_str(&params, "description")?
                .unwrap_or_default()
                .to_string(),
            network_access: optional_bool(&params, "network_access")?,
        };

        let result = self.broker.scaffold(request).await;
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}

/// `scaffold_from_repo`: clone a repository and register it as managed.
pub struct ScaffoldFromRepoTool {
    broker: Arc<Broker>,
}

impl ScaffoldFromRepoTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for ScaffoldFromRepoTool {
    fn name(&self) -> &str {
        "scaffold_from_repo"
    }

    fn description(&self) -> &str {
        "Clone a git repository containing an MCP server, detect its language and entry \
         point, and register it as a managed server."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Alias and directory name" },
                "repo_url": { "type": "string", "description": "Git URL to clone" },
                "description": { "type": "string", "description": "What this server does" },
                "network_access": {
                    "type": "boolean",
                    "description": "Allow outbound network when run in a container (default false)"
                }
            },
            "required": ["name", "repo_url"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let request = RepositoryRequest {
            alias: require_str(&params, "name")?.to_string(),
            repository: require_str(&params, "repo_url")?.to_string(),
            description: optional_str(&params, "description")?
                .unwrap_or_default()
                .to_string(),
            network_access: optional_bool(&params, "network_access")?,
        };

        let result = self.broker.scaffold_from_repo(request).await;
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}

/// `build_server`: install dependencies or build a container image.
pub struct BuildServerTool {
    broker: Arc<Broker>,
}

impl BuildServerTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for BuildServerTool {
    fn name(&self) -> &str {
        "build_server"
    }

    fn description(&self) -> &str {
        "Build a managed server: install its dependencies locally, or with use_docker \
         build an isolated image and run the server from it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Managed server alias" },
                "use_docker": {
                    "type": "boolean",
                    "description": "Build a container image instead of a local install (default false)"
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let name = require_str(&params, "name")?;
        let use_docker = optional_bool(&params, "use_docker")?;

        let result = self.broker.build(name, use_docker).await.map(|report| {
            json!({
                "alias": report.view.alias,
                "mode": report.mode.as_str(),
                "build_state": report.view.build_state,
                "launch": report.view.launch,
                "image": report.image,
                "output": report.output,
            })
        });
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}

/// `edit_server`: replace a managed server's entry file.
pub struct EditServerTool {
    broker: Arc<Broker>,
}

impl EditServerTool {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Tool for EditServerTool {
    fn name(&self) -> &str {
        "edit_server"
    }

    fn description(&self) -> &str {
        "Replace the main source file (server.py or index.js) of a managed server \
         with new code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Managed server alias" },
                "code": { "type": "string", "description": "Complete new file contents" }
            },
            "required": ["name", "code"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let name = require_str(&params, "name")?;
        let code = params
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidParameters("missing 'code' parameter".to_string()))?;

        let result = self.broker.edit(name, code).await.map(|view| {
            json!({
                "alias": view.alias,
                "entry_file": view.source.map(|s| s.entry_path()),
                "bytes_written": code.len(),
            })
        });
        respond(&self.broker, result, start, DESCRIPTOR_FIELDS).await
    }
}
