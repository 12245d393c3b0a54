//! Minimal stdio MCP server used for smoke tests.
//!
//! Tools:
//! - `get_forecast {city, days}`: canned forecast
//! - `echo {..}`: returns its arguments
//! - `env {name}`: returns an environment variable's value
//! - `slow {ms}`: sleeps before answering
//! - `fail {message}`: answers with `isError: true`
//!
//! `tools/list` is paged two tools at a time to exercise cursors.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use mcp_forge::transport::protocol::{
    INVALID_PARAMS, METHOD_NOT_FOUND, PROTOCOL_VERSION, RpcRequest, RpcResponse,
};

const PAGE_SIZE: usize = 2;

fn tool_catalog() -> Vec<Value> {
    vec![
        json!({
            "name": "get_forecast",
            "description": "Weather forecast for a city",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "city": { "type": "string" },
                    "days": { "type": "integer", "minimum": 1 }
                },
                "required": ["city"]
            }
        }),
        json!({
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": { "type": "object" }
        }),
        json!({
            "name": "env",
            "description": "Read an environment variable",
            "inputSchema": {
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }
        }),
        json!({
            "name": "slow",
            "description": "Sleep for ms milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } }
            }
        }),
        json!({
            "name": "fail",
            "description": "Always report a tool failure",
            "inputSchema": { "type": "object" }
        }),
    ]
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Providers often print a banner; the broker must skip it.
    eprintln!("forge-echo-provider ready");

    let (tx, mut rx) = mpsc::channel::<String>(16);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Ignoring malformed line: {}", e);
                continue;
            }
        };
        let Some(id) = request.id.clone() else {
            continue;
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle(id, &request.method, request.params).await;
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = tx.send(text).await;
            }
        });
    }

    drop(tx);
    let _ = writer.await;
}

async fn handle(id: Value, method: &str, params: Option<Value>) -> RpcResponse {
    let params = params.unwrap_or_else(|| json!({}));
    match method {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "forge-echo-provider", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => RpcResponse::success(id, json!({})),
        "tools/list" => RpcResponse::success(id, list_page(&params)),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match call(name, arguments).await {
                Some(result) => RpcResponse::success(id, result),
                None => RpcResponse::failure(id, INVALID_PARAMS, format!("Unknown tool: {}", name)),
            }
        }
        other => RpcResponse::failure(id, METHOD_NOT_FOUND, format!("Method not found: {}", other)),
    }
}

fn list_page(params: &Value) -> Value {
    let catalog = tool_catalog();
    let start = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0)
        .min(catalog.len());
    let end = (start + PAGE_SIZE).min(catalog.len());
    let mut page = json!({ "tools": catalog[start..end].to_vec() });
    if end < catalog.len() {
        page["nextCursor"] = json!(end.to_string());
    }
    page
}

fn text_result(text: String, structured: Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "structuredContent": structured,
        "isError": false
    })
}

async fn call(name: &str, arguments: Value) -> Option<Value> {
    let result = match name {
        "get_forecast" => {
            let city = arguments.get("city").and_then(Value::as_str).unwrap_or("Nowhere");
            let days = arguments.get("days").and_then(Value::as_u64).unwrap_or(1);
            let daily: Vec<Value> = (1..=days)
                .map(|day| json!({ "day": day, "summary": "Cloudy", "high_c": 14 + day }))
                .collect();
            text_result(
                format!("{}: cloudy for {} day(s)", city, days),
                json!({ "city": city, "days": daily }),
            )
        }
        "echo" => text_result(arguments.to_string(), arguments),
        "env" => {
            let var = arguments.get("name").and_then(Value::as_str).unwrap_or_default();
            let value = std::env::var(var).unwrap_or_default();
            text_result(value.clone(), json!({ "name": var, "value": value }))
        }
        "slow" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(500);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            text_result(format!("slept {}ms", ms), json!({ "slept_ms": ms }))
        }
        "fail" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            json!({
                "content": [{ "type": "text", "text": message }],
                "isError": true
            })
        }
        _ => return None,
    };
    Some(result)
}
