//! Tool registry for discovery and dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use crate::tools::tool::{Tool, ToolError, ToolOutput, ToolSchema};

/// Tools the server exposes, by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registering tool {}", name);
        if self.tools.write().await.insert(name.clone(), tool).is_some() {
            tracing::warn!("Tool {} was registered twice; keeping the latest", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Schemas of every tool, sorted by name.
    pub async fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().await;
        let mut schemas: Vec<ToolSchema> = tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .await
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let start = Instant::now();
        let result = tool.execute(params).await;
        match &result {
            Ok(_) => tracing::debug!("Tool {} completed in {:?}", name, start.elapsed()),
            Err(e) => tracing::info!("Tool {} failed after {:?}: {}", name, start.elapsed(), e),
        }
        result
    }
}
