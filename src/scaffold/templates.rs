//! Built-in provider templates.
//!
//! Each template is a small file set with `{{variable}}` placeholders. The
//! `{{tools}}` placeholder expands to one stub per requested tool name.

use std::collections::HashMap;

use crate::error::ScaffoldError;
use crate::registry::Language;
use crate::sandbox::{NODE_DOCKERFILE, PYTHON_DOCKERFILE};

/// A provider template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    pub language: Language,
    /// Entry file, relative to the provider directory.
    pub entry_point: &'static str,
    /// Stub emitted once per tool, with `{{tool}}` substituted.
    pub tool_stub: &'static str,
    pub files: Vec<TemplateFile>,
}

/// A file within a template.
#[derive(Debug, Clone)]
pub struct TemplateFile {
    pub path: &'static str,
    pub content: &'static str,
}

/// Engine for rendering templates with variable substitution.
#[derive(Debug, Default)]
pub struct TemplateEngine {
    variables: HashMap<String, String>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a template variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Render a template string, replacing {{variable}} placeholders.
    pub fn render(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.variables {
            let placeholder = format!("{{{{{}}}}}", key);
            result = result.replace(&placeholder, value);
        }
        result
    }

    /// Render all files in a template.
    pub fn render_template(&self, template: &Template) -> Vec<(String, String)> {
        template
            .files
            .iter()
            .map(|f| (self.render(f.path), self.render(f.content)))
            .collect()
    }
}

impl Template {
    /// Names accepted by [`Template::get`].
    pub const AVAILABLE: &'static [&'static str] = &["python", "node"];

    /// Look up a template by name.
    pub fn get(name: &str) -> Result<Self, ScaffoldError> {
        match name.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Self::python()),
            "node" | "nodejs" | "javascript" | "js" => Ok(Self::node()),
            _ => Err(ScaffoldError::UnknownTemplate {
                name: name.to_string(),
                available: Self::AVAILABLE.join(", "),
            }),
        }
    }

    /// Render the complete file set for a provider.
    pub fn render(&self, alias: &str, description: &str, tools: &[String]) -> Vec<(String, String)> {
        let stubs = tools
            .iter()
            .map(|tool| {
                let mut engine = TemplateEngine::new();
                engine.set("tool", tool.as_str());
                engine.render(self.tool_stub)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let one_line = description
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let mut engine = TemplateEngine::new();
        engine
            .set("name", alias)
            .set("description", description)
            .set("summary", one_line.replace('"', "'"))
            .set(
                "description_json",
                serde_json::to_string(description).unwrap_or_else(|_| "\"\"".to_string()),
            )
            .set("tool_list", tools.join(", "))
            .set("entry_point", self.entry_point)
            .set("tools", stubs);
        engine.render_template(self)
    }

    fn python() -> Self {
        Self {
            name: "python",
            description: "FastMCP server in Python",
            language: Language::Python,
            entry_point: "server.py",
            tool_stub: PYTHON_TOOL_STUB,
            files: vec![
                TemplateFile {
                    path: "server.py",
                    content: PYTHON_SERVER,
                },
                TemplateFile {
                    path: "requirements.txt",
                    content: PYTHON_REQUIREMENTS,
                },
                TemplateFile {
                    path: "Dockerfile",
                    content: PYTHON_DOCKERFILE,
                },
                TemplateFile {
                    path: "README.md",
                    content: README,
                },
            ],
        }
    }

    fn node() -> Self {
        Self {
            name: "node",
            description: "MCP SDK server in Node.js",
            language: Language::Node,
            entry_point: "index.js",
            tool_stub: NODE_TOOL_STUB,
            files: vec![
                TemplateFile {
                    path: "index.js",
                    content: NODE_SERVER,
                },
                TemplateFile {
                    path: "package.json",
                    content: NODE_PACKAGE_JSON,
                },
                TemplateFile {
                    path: "Dockerfile",
                    content: NODE_DOCKERFILE,
                },
                TemplateFile {
                    path: "README.md",
                    content: README,
                },
            ],
        }
    }
}

// =============================================================================
// Python
// =============================================================================

const PYTHON_SERVER: &str = r##"#!/usr/bin/env python3
"""{{name}}: {{summary}}"""

from fastmcp import FastMCP

mcp = FastMCP("{{name}}")


{{tools}}


if __name__ == "__main__":
    mcp.run(transport="stdio")
"##;

const PYTHON_TOOL_STUB: &str = r##"@mcp.tool()
def {{tool}}(input: str = "") -> str:
    """Placeholder for {{tool}}. Replace with the real implementation."""
    return f"{{tool}} is not implemented yet (input: {input!r})""##;

const PYTHON_REQUIREMENTS: &str = "fastmcp>=2.0\n";

// =============================================================================
// Node
// =============================================================================

const NODE_SERVER: &str = r##"#!/usr/bin/env node
// {{name}}: {{summary}}

import { McpServer } from "@modelcontextprotocol/sdk/server/mcp.js";
import { StdioServerTransport } from "@modelcontextprotocol/sdk/server/stdio.js";
import { z } from "zod";

const server = new McpServer({ name: "{{name}}", version: "0.1.0" });

{{tools}}

const transport = new StdioServerTransport();
await server.connect(transport);
"##;

const NODE_TOOL_STUB: &str = r##"server.tool(
  "{{tool}}",
  "Placeholder for {{tool}}. Replace with the real implementation.",
  { input: z.string().optional() },
  async ({ input }) => ({
    content: [{ type: "text", text: `{{tool}} is not implemented yet (input: ${input ?? ""})` }],
  })
);"##;

const NODE_PACKAGE_JSON: &str = r##"{
  "name": "{{name}}",
  "version": "0.1.0",
  "description": {{description_json}},
  "type": "module",
  "main": "index.js",
  "dependencies": {
    "@modelcontextprotocol/sdk": "^1.0.0",
    "zod": "^3.23.0"
  }
}
"##;

// =============================================================================
// Shared
// =============================================================================

const README: &str = r##"# {{name}}

{{description}}

Tools: {{tool_list}}

This provider is managed by mcp-forge. Edit `{{entry_point}}`, then run
`build_server` to install dependencies and `remote_discover` to check the
tool list.
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_engine() {
        let mut engine = TemplateEngine::new();
        engine.set("name", "stock-data");
        engine.set("description", "Market prices");

        let result = engine.render("Name: {{name}}, Desc: {{description}}");
        assert_eq!(result, "Name: stock-data, Desc: Market prices");
    }

    #[test]
    fn test_unknown_template() {
        let err = Template::get("cobol").unwrap_err();
        match err {
            ScaffoldError::UnknownTemplate { name, available } => {
                assert_eq!(name, "cobol");
                assert_eq!(available, "python, node");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_python_render_has_one_stub_per_tool() {
        let template = Template::get("python").unwrap();
        let files = template.render(
            "stock-data",
            "Stock \"quotes\"\nand history",
            &["get_price".to_string(), "get_history".to_string()],
        );

        let server = &files.iter().find(|(p, _)| p == "server.py").unwrap().1;
        assert!(server.contains("def get_price("));
        assert!(server.contains("def get_history("));
        assert!(server.contains(r#"FastMCP("stock-data")"#));
        assert!(server.contains("Stock 'quotes' and history"));
        assert!(!server.contains("{{"));

        let dockerfile = &files.iter().find(|(p, _)| p == "Dockerfile").unwrap().1;
        assert!(dockerfile.contains(r#"ENTRYPOINT ["python", "server.py"]"#));
    }

    #[test]
    fn test_node_package_json_is_valid() {
        let template = Template::get("node").unwrap();
        let files = template.render("db-query", "Queries \"prod\"", &["query".to_string()]);

        let package = &files.iter().find(|(p, _)| p == "package.json").unwrap().1;
        let parsed: serde_json::Value = serde_json::from_str(package).unwrap();
        assert_eq!(parsed["name"], "db-query");
        assert_eq!(parsed["description"], "Queries \"prod\"");

        let index = &files.iter().find(|(p, _)| p == "index.js").unwrap().1;
        assert!(index.contains(r#""query","#));
    }
}
