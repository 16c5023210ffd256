//! Reference MCP worker.
//!
//! Speaks line-delimited JSON-RPC on stdio and serves a few demo tools plus
//! diagnostic ones used by the integration tests. Behavior switches:
//!
//! - `EXAMPLE_WORKER_SILENT_HANDSHAKE=1`: never answer `initialize`
//! - `EXAMPLE_WORKER_FAIL_START=1`: exit before reading anything
//! - `EXAMPLE_WORKER_HANDSHAKE_DELAY_MS`: wait this long before answering `initialize`
//! - `EXAMPLE_WORKER_IGNORE_EOF=1`: keep running after stdin closes
//! - `EXAMPLE_WORKER_EXTRA_TOOLS=1`: also expose `extra_tool`
//! - `EXAMPLE_WORKER_EXTRA_TOOLS_FILE`: expose `extra_tool` while this file exists
//! - `EXAMPLE_WORKER_GENERATION`: label reported by `process_info`

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_proxy::proxy::transport::{FrameReader, FrameWriter, Framing};
use mcp_proxy::proxy::types::{
    error_codes, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ToolDefinition,
};

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn env_millis(name: &str) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Checked on every request so the tool list can change while running.
fn extra_tools_enabled() -> bool {
    env_flag("EXAMPLE_WORKER_EXTRA_TOOLS")
        || std::env::var_os("EXAMPLE_WORKER_EXTRA_TOOLS_FILE")
            .is_some_and(|path| Path::new(&path).exists())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if env_flag("EXAMPLE_WORKER_FAIL_START") {
        eprintln!("example-worker: refusing to start");
        std::process::exit(2);
    }
    tracing::info!(pid = std::process::id(), "example-worker starting");

    let silent = env_flag("EXAMPLE_WORKER_SILENT_HANDSHAKE");
    let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

    let writer = tokio::spawn(async move {
        let mut writer = FrameWriter::new(tokio::io::stdout(), Framing::Line);
        while let Some(response) = rx.recv().await {
            if writer.write(&JsonRpcMessage::Response(response)).await.is_err() {
                break;
            }
        }
    });

    let mut reader = FrameReader::new(tokio::io::stdin(), Framing::Line);
    while let Some(message) = reader.read_next().await? {
        let JsonRpcMessage::Request(request) = message else {
            continue;
        };
        if silent && request.method == "initialize" {
            tracing::info!("ignoring initialize");
            continue;
        }
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle(request).await;
            let _ = tx.send(response);
        });
    }

    if env_flag("EXAMPLE_WORKER_IGNORE_EOF") {
        tracing::info!("stdin closed, staying up");
        std::future::pending::<()>().await;
    }

    tracing::info!("stdin closed, exiting");
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn handle(request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id;
    let params = request.params.unwrap_or(Value::Null);

    match request.method.as_str() {
        "initialize" => {
            let delay = env_millis("EXAMPLE_WORKER_HANDSHAKE_DELAY_MS");
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": params
                        .get("protocolVersion")
                        .cloned()
                        .unwrap_or_else(|| json!("2025-03-26")),
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "example-server", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tools() })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match call(name, &args).await {
                Some(result) => JsonRpcResponse::success(id, result),
                None => JsonRpcResponse::failure(
                    Some(id),
                    error_codes::INVALID_PARAMS,
                    format!("unknown tool: {name}"),
                ),
            }
        }
        other => JsonRpcResponse::failure(
            Some(id),
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ),
    }
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

async fn call(name: &str, args: &Value) -> Option<Value> {
    let result = match name {
        "hello_world" => {
            let who = args.get("name").and_then(Value::as_str).unwrap_or("World");
            json!({ "success": true, "message": format!("Hello, {who}!") })
        }
        "add_numbers" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            json!({ "success": true, "result": a + b })
        }
        "list_items" => {
            let prefix = args.get("filter_prefix").and_then(Value::as_str);
            let items: Vec<&str> = args
                .get("items")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            let filtered: Vec<&str> = items
                .into_iter()
                .filter(|item| prefix.map_or(true, |p| item.starts_with(p)))
                .collect();
            json!({ "success": true, "count": filtered.len(), "items": filtered })
        }
        "process_info" => json!({
            "pid": std::process::id(),
            "generation": std::env::var("EXAMPLE_WORKER_GENERATION").ok(),
        }),
        "slow_echo" => {
            let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            json!({ "text": args.get("text").cloned().unwrap_or(Value::Null) })
        }
        "crash" => {
            tracing::warn!("crash requested");
            std::process::exit(3);
        }
        "fail" => return Some(text_result("intentional failure".into(), true)),
        "extra_tool" if extra_tools_enabled() => json!({ "extra": true }),
        _ => return None,
    };
    Some(text_result(result.to_string(), false))
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
        annotations: None,
    }
}

fn tools() -> Vec<ToolDefinition> {
    let mut tools = vec![
        tool(
            "hello_world",
            "A simple hello world tool",
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } }
            }),
        ),
        tool(
            "add_numbers",
            "Add two numbers together",
            json!({
                "type": "object",
                "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                "required": ["a", "b"]
            }),
        ),
        tool(
            "list_items",
            "Process a list of items with optional prefix filtering",
            json!({
                "type": "object",
                "properties": {
                    "items": { "type": "array", "items": { "type": "string" } },
                    "filter_prefix": { "type": "string" }
                },
                "required": ["items"]
            }),
        ),
        tool(
            "process_info",
            "Report the worker process id",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "slow_echo",
            "Echo text back after a delay",
            json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" },
                    "delay_ms": { "type": "integer" }
                },
                "required": ["text"]
            }),
        ),
        tool(
            "crash",
            "Exit the worker process immediately",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "fail",
            "Return a tool error",
            json!({ "type": "object", "properties": {} }),
        ),
    ];
    if extra_tools_enabled() {
        tools.push(tool(
            "extra_tool",
            "Only present when extra tools are enabled",
            json!({ "type": "object", "properties": {} }),
        ));
    }
    tools
}
