//! End-to-end broker scenarios through the agent-facing tools, against the
//! bundled `forge-echo-provider` child.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tempfile::TempDir;

use mcp_forge::broker::{Broker, Collaborators};
use mcp_forge::build::{ProcessRunner, Step, StepOutput, StepRunner};
use mcp_forge::config::BrokerConfig;
use mcp_forge::error::ScaffoldError;
use mcp_forge::sandbox::{ContainerEngine, Result as SandboxResult};
use mcp_forge::scaffold::SourceFetcher;
use mcp_forge::tools::{ToolRegistry, register_broker_tools};
use mcp_forge::transport::TransportClient;

const SECRET: &str = "sk-live-9f8e7d6c5b4a";

fn echo_provider() -> &'static str {
    env!("CARGO_BIN_EXE_forge-echo-provider")
}

struct NoFetch;

#[async_trait]
impl SourceFetcher for NoFetch {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<(), ScaffoldError> {
        Err(ScaffoldError::Fetch {
            url: url.to_string(),
            reason: "network disabled in tests".to_string(),
        })
    }
}

/// Succeeds at every step and remembers what it ran.
#[derive(Default)]
struct RecordingRunner {
    steps: Mutex<Vec<String>>,
}

#[async_trait]
impl StepRunner for RecordingRunner {
    async fn run(&self, step: &Step, _timeout: Duration) -> StepOutput {
        self.steps.lock().unwrap().push(step.display());
        StepOutput {
            success: true,
            status: "exit status: 0".to_string(),
            output: format!("ran {}", step.program),
        }
    }
}

#[derive(Default)]
struct FakeContainers {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerEngine for FakeContainers {
    async fn build_image(&self, tag: &str, context: Bytes) -> SandboxResult<String> {
        assert!(!context.is_empty());
        self.calls.lock().unwrap().push(format!("build {}", tag));
        Ok("Successfully built".to_string())
    }

    async fn tag_image(&self, source: &str, target: &str) -> SandboxResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("tag {} {}", source, target));
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> SandboxResult<()> {
        self.calls.lock().unwrap().push(format!("remove {}", image));
        Ok(())
    }
}

struct Harness {
    _home: TempDir,
    broker: Arc<Broker>,
    tools: ToolRegistry,
}

async fn harness_with(runner: Arc<dyn StepRunner>, containers: Arc<FakeContainers>) -> Harness {
    let home = TempDir::new().unwrap();
    let config = BrokerConfig::with_home(home.path());
    let collaborators = Collaborators {
        transport: Arc::new(TransportClient::new(config.transport.clone())),
        fetcher: Arc::new(NoFetch),
        runner,
        containers: Some(containers),
    };
    let broker = Arc::new(Broker::open_with(config, collaborators).await.unwrap());
    let tools = ToolRegistry::new();
    register_broker_tools(&tools, broker.clone()).await;
    Harness {
        _home: home,
        broker,
        tools,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(ProcessRunner), Arc::new(FakeContainers::default())).await
}

impl Harness {
    async fn ok(&self, tool: &str, params: Value) -> Value {
        match self.tools.execute(tool, params).await {
            Ok(output) => output.result,
            Err(e) => panic!("{} failed: {:?}", tool, e.payload()),
        }
    }

    async fn err(&self, tool: &str, params: Value) -> Value {
        match self.tools.execute(tool, params).await {
            Ok(output) => panic!("{} unexpectedly succeeded: {}", tool, output.result),
            Err(e) => serde_json::to_value(e.payload()).unwrap(),
        }
    }

    async fn add_echo(&self, alias: &str) {
        self.ok(
            "registry_add",
            json!({
                "alias": alias,
                "transport": "stdio",
                "command": echo_provider(),
                "env": { "API_KEY": SECRET },
                "description": "Echo provider"
            }),
        )
        .await;
    }

    fn audit_log(&self) -> String {
        std::fs::read_to_string(self.broker.config().audit_path()).unwrap_or_default()
    }
}

#[tokio::test]
async fn weather_provider_lifecycle() {
    let h = harness().await;
    h.add_echo("weather").await;

    let discovered = h.ok("remote_discover", json!({ "alias": "weather" })).await;
    let names: Vec<&str> = discovered["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    // The child pages its list; every page must be collected.
    assert_eq!(discovered["count"], 5);
    assert!(names.contains(&"get_forecast"));
    assert!(names.contains(&"fail"));

    let forecast = h
        .ok(
            "remote_call",
            json!({
                "alias": "weather",
                "tool_name": "get_forecast",
                "arguments": { "city": "London", "days": 3 }
            }),
        )
        .await;
    assert_eq!(forecast["isError"], false);
    assert_eq!(forecast["structuredContent"]["city"], "London");
    assert_eq!(forecast["structuredContent"]["days"].as_array().unwrap().len(), 3);

    // String-encoded arguments are accepted too.
    let encoded = h
        .ok(
            "remote_call",
            json!({
                "alias": "weather",
                "tool_name": "get_forecast",
                "arguments": "{\"city\": \"Paris\"}"
            }),
        )
        .await;
    assert_eq!(encoded["structuredContent"]["city"], "Paris");

    let removed = h.ok("registry_remove", json!({ "alias": "weather" })).await;
    assert_eq!(removed["removed"], "weather");

    let missing = h.err("server_status", json!({ "name": "weather" })).await;
    assert_eq!(missing["kind"], "not_found");

    let ops: Vec<String> = h
        .audit_log()
        .lines()
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["operation"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        ops,
        ["register", "discover", "invoke", "invoke", "remove", "status"]
    );
}

#[tokio::test]
async fn provider_failures_are_structured() {
    let h = harness().await;
    h.add_echo("echo").await;

    let tool_error = h
        .err(
            "remote_call",
            json!({ "alias": "echo", "tool_name": "fail", "arguments": { "message": "upstream 503" } }),
        )
        .await;
    assert_eq!(tool_error["kind"], "tool_error");
    assert!(tool_error["message"].as_str().unwrap().contains("upstream 503"));

    let unknown = h
        .err("remote_call", json!({ "alias": "echo", "tool_name": "no_such_tool" }))
        .await;
    assert_eq!(unknown["kind"], "tool_error");

    h.ok(
        "registry_add",
        json!({ "alias": "ghost", "transport": "stdio", "command": "/nonexistent/mcp-server" }),
    )
    .await;
    let launch = h.err("remote_discover", json!({ "alias": "ghost" })).await;
    assert_eq!(launch["kind"], "transport_error");
    assert_eq!(launch["transport_kind"], "launch-failed");

    let bad_args = h
        .err(
            "remote_call",
            json!({ "alias": "echo", "tool_name": "echo", "arguments": "[1, 2]" }),
        )
        .await;
    assert_eq!(bad_args["kind"], "invalid_arguments");
}

#[tokio::test]
async fn slow_provider_does_not_block_others() {
    let h = Arc::new(harness().await);
    h.add_echo("echo").await;

    let slow = {
        let h = h.clone();
        tokio::spawn(async move {
            h.ok(
                "remote_call",
                json!({ "alias": "echo", "tool_name": "slow", "arguments": { "ms": 2000 } }),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    let fast = h
        .ok(
            "remote_call",
            json!({ "alias": "echo", "tool_name": "echo", "arguments": { "n": 1 } }),
        )
        .await;
    assert_eq!(fast["structuredContent"]["n"], 1);
    assert!(start.elapsed() < Duration::from_millis(1500));
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap();
    assert_eq!(slow["structuredContent"]["slept_ms"], 2000);
}

#[tokio::test]
async fn secrets_never_reach_the_agent() {
    let h = harness().await;
    h.add_echo("leaky").await;

    let mut seen = Vec::new();
    seen.push(h.ok("registry_list", json!({})).await);
    seen.push(h.ok("server_status", json!({ "name": "leaky" })).await);
    seen.push(
        h.ok(
            "remote_call",
            json!({ "alias": "leaky", "tool_name": "env", "arguments": { "name": "API_KEY" } }),
        )
        .await,
    );
    seen.push(
        h.ok(
            "remote_call",
            json!({ "alias": "leaky", "tool_name": "echo", "arguments": { "token": SECRET } }),
        )
        .await,
    );
    seen.push(
        h.err(
            "remote_call",
            json!({ "alias": "leaky", "tool_name": "fail", "arguments": { "message": SECRET } }),
        )
        .await,
    );

    for value in &seen {
        assert!(!value.to_string().contains(SECRET), "leaked in {}", value);
    }
    // The child really did see the secret; only its echo was masked.
    assert!(seen[2].to_string().contains("[REDACTED]"));
    assert_eq!(
        seen[0]["providers"][0]["environment"]["API_KEY"],
        "*".repeat(SECRET.len())
    );

    assert!(!h.audit_log().is_empty());
    assert!(!h.audit_log().contains(SECRET));
}

#[tokio::test]
async fn short_and_numeric_environment_values() {
    let h = harness().await;
    h.ok(
        "registry_add",
        json!({
            "alias": "weather1",
            "transport": "stdio",
            "command": echo_provider(),
            "env": { "DEBUG": "1", "PIN": 4242 }
        }),
    )
    .await;

    // A one-character flag is configuration and must not mangle replies.
    let listed = h.ok("registry_list", json!({})).await;
    assert_eq!(listed["providers"][0]["alias"], "weather1");
    assert_eq!(listed["providers"][0]["environment"]["DEBUG"], "*");
    assert_eq!(listed["providers"][0]["environment"]["PIN"], "****");

    let discovered = h.ok("remote_discover", json!({ "alias": "weather1" })).await;
    assert_eq!(discovered["alias"], "weather1");
    assert_eq!(discovered["count"], 5);

    let status = h.ok("server_status", json!({ "name": "weather1" })).await;
    assert_eq!(status["alias"], "weather1");

    // A numeric secret echoed back unquoted is still withheld.
    let echoed = h
        .ok(
            "remote_call",
            json!({ "alias": "weather1", "tool_name": "echo", "arguments": { "pin": 4242, "days": 1 } }),
        )
        .await;
    assert_eq!(echoed["structuredContent"]["pin"], "[REDACTED]");
    assert_eq!(echoed["structuredContent"]["days"], 1);
    assert!(!echoed.to_string().contains("4242"));
    assert!(!h.audit_log().contains("4242"));
}

#[tokio::test]
async fn rejected_parameters_are_audited() {
    let h = harness().await;

    let bad_transport = h
        .err(
            "registry_add",
            json!({ "alias": "weather", "transport": "carrier-pigeon", "command": "x" }),
        )
        .await;
    assert_eq!(bad_transport["kind"], "invalid_descriptor");

    let missing_tool = h.err("remote_call", json!({ "alias": "weather" })).await;
    assert_eq!(missing_tool["kind"], "invalid_arguments");

    let records: Vec<Value> = h
        .audit_log()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["operation"], "register");
    assert_eq!(records[0]["alias"], "weather");
    assert_eq!(records[0]["outcome"]["error"], "invalid_descriptor");
    assert_eq!(records[1]["operation"], "invoke");
    assert_eq!(records[1]["outcome"]["error"], "invalid_arguments");
}

#[tokio::test]
async fn duplicate_aliases_are_rejected() {
    let h = harness().await;
    h.add_echo("weather").await;

    let dup = h
        .err(
            "registry_add",
            json!({ "alias": "weather", "transport": "http", "url": "http://localhost:9000/mcp" }),
        )
        .await;
    assert_eq!(dup["kind"], "duplicate_alias");

    let scaffold_dup = h.err("scaffold_server", json!({ "name": "weather" })).await;
    assert_eq!(scaffold_dup["kind"], "duplicate_alias");

    let listed = h.ok("registry_list", json!({})).await;
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["providers"][0]["transport"], "process");
}

#[tokio::test]
async fn stock_data_scaffold_and_container_build() {
    let containers = Arc::new(FakeContainers::default());
    let h = harness_with(Arc::new(RecordingRunner::default()), containers.clone()).await;

    let view = h
        .ok(
            "scaffold_server",
            json!({
                "name": "stock-data",
                "language": "python",
                "tools": ["get_price", "get_history"],
                "description": "Stock quotes"
            }),
        )
        .await;
    assert_eq!(view["alias"], "stock-data");
    assert_eq!(view["managed"], true);
    assert_eq!(view["build_state"], "unbuilt");

    let dir = h.broker.config().server_dir("stock-data");
    let source = std::fs::read_to_string(dir.join("server.py")).unwrap();
    assert!(source.contains("get_price"));
    assert!(source.contains("get_history"));

    let built = h
        .ok("build_server", json!({ "name": "stock-data", "use_docker": true }))
        .await;
    assert_eq!(built["build_state"], "containerized");
    assert_eq!(built["image"], "mcp-forge/stock-data:latest");
    let args: Vec<&str> = built["launch"]["args"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect();
    assert_eq!(args.last(), Some(&"mcp-forge/stock-data:latest"));
    assert!(args.windows(2).any(|w| w == ["--network", "none"]));

    let calls = containers.calls.lock().unwrap().clone();
    assert!(calls[0].starts_with("build mcp-forge/stock-data:staging-"));
    assert!(calls.iter().any(|c| c.starts_with("remove mcp-forge/stock-data:staging-")));

    let status = h.ok("server_status", json!({ "name": "stock-data" })).await;
    assert_eq!(status["build_state"], "containerized");
    assert_eq!(status["building"], false);
    assert_eq!(status["source_present"], true);
}

#[tokio::test]
async fn local_build_is_repeatable() {
    let runner = Arc::new(RecordingRunner::default());
    let h = harness_with(runner.clone(), Arc::new(FakeContainers::default())).await;

    h.ok("scaffold_server", json!({ "name": "notes", "tools": "add_note, list_notes" }))
        .await;

    let first = h.ok("build_server", json!({ "name": "notes" })).await;
    let second = h.ok("build_server", json!({ "name": "notes" })).await;

    assert_eq!(first["build_state"], "local");
    assert_eq!(first["mode"], "local");
    assert_eq!(first["launch"], second["launch"]);
    assert!(first["launch"]["command"]
        .as_str()
        .unwrap()
        .ends_with(".venv/bin/python"));

    let steps = runner.steps.lock().unwrap().clone();
    // venv + pip, twice.
    assert_eq!(steps.len(), 4);
    assert!(steps[0].contains("-m venv"));
    assert_eq!(steps[0..2], steps[2..4]);
}

#[tokio::test]
async fn edit_then_rebuild_keeps_registration() {
    let h = harness_with(
        Arc::new(RecordingRunner::default()),
        Arc::new(FakeContainers::default()),
    )
    .await;
    h.ok("scaffold_server", json!({ "name": "calc", "language": "node" }))
        .await;

    let code = "// calculator\nconsole.log('ready');\n";
    let edited = h.ok("edit_server", json!({ "name": "calc", "code": code })).await;
    assert_eq!(edited["bytes_written"], code.len());

    let dir = h.broker.config().server_dir("calc");
    assert_eq!(std::fs::read_to_string(dir.join("index.js")).unwrap(), code);

    h.ok(
        "registry_add",
        json!({ "alias": "remote", "transport": "http", "url": "http://127.0.0.1:1/mcp" }),
    )
    .await;
    let external = h.err("edit_server", json!({ "name": "remote", "code": "x" })).await;
    assert_eq!(external["kind"], "external_provider");
    let external = h.err("build_server", json!({ "name": "remote" })).await;
    assert_eq!(external["kind"], "external_provider");
}
