//! The broker's ten tools.

mod forge_tools;
mod registry_tools;
mod remote_tools;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::tools::registry::ToolRegistry;
use crate::tools::tool::{Tool, ToolError, ToolOutput};

pub use forge_tools::{BuildServerTool, EditServerTool, ScaffoldFromRepoTool, ScaffoldServerTool};
pub use registry_tools::{RegistryAddTool, RegistryListTool, RegistryRemoveTool, ServerStatusTool};
pub use remote_tools::{RemoteCallTool, RemoteDiscoverTool};

/// One instance of every broker tool.
pub fn broker_tools(broker: Arc<Broker>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(RegistryAddTool::new(broker.clone())),
        Arc::new(RegistryListTool::new(broker.clone())),
        Arc::new(RegistryRemoveTool::new(broker.clone())),
        Arc::new(RemoteDiscoverTool::new(broker.clone())),
        Arc::new(RemoteCallTool::new(broker.clone())),
        Arc::new(ScaffoldServerTool::new(broker.clone())),
        Arc::new(ScaffoldFromRepoTool::new(broker.clone())),
        Arc::new(BuildServerTool::new(broker.clone())),
        Arc::new(EditServerTool::new(broker.clone())),
        Arc::new(ServerStatusTool::new(broker)),
    ]
}

/// Register every broker tool.
pub async fn register_broker_tools(registry: &ToolRegistry, broker: Arc<Broker>) {
    for tool in broker_tools(broker) {
        registry.register(tool).await;
    }
}

/// Descriptor fields the broker itself assigns; the scrubber leaves them alone.
const DESCRIPTOR_FIELDS: &[&str] = &[
    "alias",
    "transport",
    "kind",
    "build_state",
    "mode",
    "language",
    "image",
    "removed",
];

/// Discovery output keeps the alias and the provider's tool names callable.
const DISCOVERY_FIELDS: &[&str] = &["alias", "name"];

/// Turn a broker result into tool output, scrubbing both arms.
///
/// String values under `keep` are identifiers, not provider data.
async fn respond<T: Serialize>(
    broker: &Broker,
    result: Result<T, BrokerError>,
    start: Instant,
    keep: &[&str],
) -> Result<ToolOutput, ToolError> {
    match result {
        Ok(value) => {
            let mut value = serde_json::to_value(value)
                .map_err(|e| ToolError::ExecutionFailed(format!("unserializable result: {}", e)))?;
            broker.scrubber().await.scrub_value_keeping(&mut value, keep);
            Ok(ToolOutput::success(value, start.elapsed()))
        }
        Err(e) => Err(ToolError::Broker(broker.error_payload(&e).await)),
    }
}

/// Parameter problems, in the broker's error taxonomy.
fn invalid_arguments(err: ToolError) -> BrokerError {
    match err {
        ToolError::InvalidParameters(message) => BrokerError::InvalidArguments(message),
        other => BrokerError::InvalidArguments(other.to_string()),
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    match params.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(Value::String(_)) => Err(ToolError::InvalidParameters(format!(
            "'{}' must not be empty",
            key
        ))),
        Some(_) => Err(ToolError::InvalidParameters(format!("'{}' must be a string", key))),
        None => Err(ToolError::InvalidParameters(format!("missing '{}' parameter", key))),
    }
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(_) => Err(ToolError::InvalidParameters(format!("'{}' must be a string", key))),
    }
}

fn optional_bool(params: &Value, key: &str) -> Result<bool, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(false),
        Some(_) => Err(ToolError::InvalidParameters(format!("'{}' must be a boolean", key))),
    }
}

/// A JSON value given inline or as a string holding JSON.
fn inline_or_encoded(params: &Value, key: &str) -> Result<Option<Value>, ToolError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => serde_json::from_str(s).map(Some).map_err(|e| {
            ToolError::InvalidParameters(format!("'{}' is not valid JSON: {}", key, e))
        }),
        Some(other) => Ok(Some(other.clone())),
    }
}

/// A list of strings: JSON array, JSON-encoded array, or comma-separated.
fn string_list(params: &Value, key: &str) -> Result<Vec<String>, ToolError> {
    let invalid = || ToolError::InvalidParameters(format!("'{}' must be a list of strings", key));
    let value = match params.get(key) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::String(s)) if !s.trim_start().starts_with('[') => {
            return Ok(s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect());
        }
        Some(_) => inline_or_encoded(params, key)?.unwrap_or(Value::Null),
    };
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(invalid()),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        _ => Err(invalid()),
    }
}

/// A string → string map, inline or JSON-encoded.
fn string_map(params: &Value, key: &str) -> Result<BTreeMap<String, String>, ToolError> {
    let invalid = || {
        ToolError::InvalidParameters(format!("'{}' must be an object of string values", key))
    };
    match inline_or_encoded(params, key)? {
        None => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                Value::Number(n) => Ok((k, n.to_string())),
                Value::Bool(b) => Ok((k, b.to_string())),
                _ => Err(invalid()),
            })
            .collect(),
        Some(_) => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_list_forms() {
        let params = json!({
            "a": ["x", "y"],
            "b": "[\"x\"]",
            "c": "search, fetch ,summarize",
            "d": [1],
        });
        assert_eq!(string_list(&params, "a").unwrap(), vec!["x", "y"]);
        assert_eq!(string_list(&params, "b").unwrap(), vec!["x"]);
        assert_eq!(
            string_list(&params, "c").unwrap(),
            vec!["search", "fetch", "summarize"]
        );
        assert!(string_list(&params, "d").is_err());
        assert!(string_list(&params, "missing").unwrap().is_empty());
    }

    #[test]
    fn test_string_map_forms() {
        let params = json!({
            "inline": {"API_KEY": "k", "PORT": 8080},
            "encoded": "{\"API_KEY\": \"k\"}",
            "bad": "{not json",
            "nested": {"A": {"B": 1}},
        });
        let inline = string_map(&params, "inline").unwrap();
        assert_eq!(inline["PORT"], "8080");
        assert_eq!(string_map(&params, "encoded").unwrap()["API_KEY"], "k");
        assert!(string_map(&params, "bad").is_err());
        assert!(string_map(&params, "nested").is_err());
    }

    #[test]
    fn test_scalar_params() {
        let params = json!({"alias": " weather ", "empty": "", "n": 3, "flag": "true"});
        assert_eq!(require_str(&params, "alias").unwrap(), "weather");
        assert!(require_str(&params, "empty").is_err());
        assert!(require_str(&params, "n").is_err());
        assert_eq!(optional_str(&params, "empty").unwrap(), None);
        assert!(optional_bool(&params, "flag").unwrap());
        assert!(!optional_bool(&params, "missing").unwrap());
    }
}
