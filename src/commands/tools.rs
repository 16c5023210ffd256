//! Meta-tools exposed to the MCP client.
//!
//! Each meta-tool maps onto one `ProxyCore` operation. Results are JSON
//! objects with a `success` flag; failures carry `error` and `error_kind`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::proxy::errors::ProxyError;
use crate::proxy::installer::InstallRequest;
use crate::proxy::loader::ProxyCore;
use crate::proxy::types::ToolDefinition;

/// State shared by every meta-tool invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub core: Arc<ProxyCore>,
    /// Default `max_results` for `search_tools`.
    pub search_max_results: usize,
}

// ─── Arguments ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ServerArgs {
    server_name: String,
}

#[derive(Debug, Deserialize)]
struct CallArgs {
    server_name: String,
    tool_name: String,
    #[serde(default, alias = "arguments")]
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct InstallArgs {
    git_url: String,
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    server_file: Option<String>,
    #[serde(default)]
    env_vars: Option<HashMap<String, String>>,
    #[serde(default)]
    requirements_file: Option<String>,
    #[serde(default)]
    auto_detect: Option<bool>,
}

impl From<InstallArgs> for InstallRequest {
    fn from(args: InstallArgs) -> Self {
        Self {
            git_url: args.git_url,
            server_name: args.server_name,
            server_file: args.server_file,
            env: args.env_vars.unwrap_or_default(),
            requirements_file: args.requirements_file,
            auto_detect: args.auto_detect.unwrap_or(true),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UninstallArgs {
    server_name: String,
    #[serde(default)]
    delete_files: bool,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ToolInfoArgs {
    tool_name: String,
    #[serde(default)]
    server_name: Option<String>,
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ProxyError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(|e| ProxyError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Wrap an operation's outcome in the `{success, ...}` envelope.
fn respond(outcome: Result<Value, ProxyError>) -> Value {
    match outcome {
        Ok(Value::Object(mut fields)) => {
            fields.insert("success".into(), Value::Bool(true));
            Value::Object(fields)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(e) => failure(&e),
    }
}

fn failure(e: &ProxyError) -> Value {
    let mut body = json!({
        "success": false,
        "error": e.to_string(),
        "error_kind": e.kind(),
        "infrastructure": e.is_infrastructure(),
    });
    if let ProxyError::ToolNotFound { suggestions, .. } = e {
        if !suggestions.is_empty() {
            body["suggestions"] = json!(suggestions);
        }
    }
    if let ProxyError::ReloadFailed { previous_kept, .. } = e {
        body["previous_kept"] = json!(previous_kept);
    }
    body
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Run a meta-tool. Returns `None` for an unknown tool name.
pub async fn dispatch(ctx: &CommandContext, name: &str, arguments: Value) -> Option<Value> {
    let core = &ctx.core;
    let outcome = match name {
        "load_mcp_server_dynamically" => load(core, arguments).await,
        "call_dynamic_server_tool" => call(core, arguments).await,
        "get_loaded_servers" => Ok(loaded_servers(core)),
        "reload_mcp_server" => reload(core, arguments).await,
        "refresh_server_tools" => refresh(core, arguments).await,
        "unload_mcp_server" => unload(core, arguments).await,
        "list_available_servers" => available_servers(core),
        "install_mcp_server_from_git" => install(core, arguments).await,
        "install_and_load_mcp_server" => install_and_load(core, arguments).await,
        "list_installed_mcp_servers" => list_installed(core).await,
        "uninstall_mcp_server" => uninstall(core, arguments).await,
        "search_tools" => search(ctx, arguments),
        "list_all_tools" => Ok(list_all_tools(core)),
        "get_tool_info" => tool_info(core, arguments),
        _ => return None,
    };
    Some(respond(outcome))
}

async fn load(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: ServerArgs = parse_args("load_mcp_server_dynamically", arguments)?;
    let report = core.load(&args.server_name).await?;
    let mut body = to_json(&report);
    body["message"] = json!(format!(
        "Loaded '{}' with {} tools",
        report.server, report.tool_count
    ));
    Ok(body)
}

async fn call(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: CallArgs = parse_args("call_dynamic_server_tool", arguments)?;
    let result = core
        .call(&args.server_name, &args.tool_name, args.parameters)
        .await?;
    Ok(json!({
        "server": result.server,
        "tool": result.tool,
        "result": result.simplified(),
        "execution_time_ms": result.execution_time_ms,
    }))
}

fn loaded_servers(core: &ProxyCore) -> Value {
    let servers = core.loaded_servers();
    json!({
        "count": servers.len(),
        "servers": servers,
    })
}

async fn reload(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: ServerArgs = parse_args("reload_mcp_server", arguments)?;
    Ok(to_json(&core.reload(&args.server_name).await?))
}

async fn refresh(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: ServerArgs = parse_args("refresh_server_tools", arguments)?;
    Ok(to_json(&core.refresh_tools(&args.server_name).await?))
}

async fn unload(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: ServerArgs = parse_args("unload_mcp_server", arguments)?;
    Ok(to_json(&core.unload(&args.server_name).await?))
}

fn available_servers(core: &ProxyCore) -> Result<Value, ProxyError> {
    let servers = core.available_servers()?;
    Ok(json!({
        "count": servers.len(),
        "servers": servers,
    }))
}

async fn install(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: InstallArgs = parse_args("install_mcp_server_from_git", arguments)?;
    Ok(to_json(&core.install(&args.into()).await?))
}

async fn install_and_load(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: InstallArgs = parse_args("install_and_load_mcp_server", arguments)?;
    let (installed, activation) = core.install_and_load(&args.into()).await?;
    Ok(json!({
        "installed": installed,
        "activation": activation,
    }))
}

async fn list_installed(core: &ProxyCore) -> Result<Value, ProxyError> {
    let servers = core.list_installed().await?;
    Ok(json!({
        "count": servers.len(),
        "servers": servers,
    }))
}

async fn uninstall(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: UninstallArgs = parse_args("uninstall_mcp_server", arguments)?;
    Ok(to_json(
        &core.uninstall(&args.server_name, args.delete_files).await?,
    ))
}

fn search(ctx: &CommandContext, arguments: Value) -> Result<Value, ProxyError> {
    let args: SearchArgs = parse_args("search_tools", arguments)?;
    let limit = args.max_results.unwrap_or(ctx.search_max_results);
    let hits = ctx.core.search(&args.query, limit);
    Ok(json!({
        "query": args.query,
        "count": hits.len(),
        "results": hits,
    }))
}

fn list_all_tools(core: &ProxyCore) -> Value {
    let tools: Vec<Value> = core
        .list_all_tools()
        .iter()
        .map(|t| json!({ "server": t.server, "name": t.name, "description": t.description }))
        .collect();
    json!({
        "count": tools.len(),
        "tools": tools,
    })
}

fn tool_info(core: &ProxyCore, arguments: Value) -> Result<Value, ProxyError> {
    let args: ToolInfoArgs = parse_args("get_tool_info", arguments)?;
    let matches = core.get_tool_info(&args.tool_name, args.server_name.as_deref())?;
    Ok(json!({
        "tool_name": args.tool_name,
        "matches": matches,
    }))
}

// ─── Definitions ─────────────────────────────────────────────────────────────

fn definition(name: &str, description: &str, input_schema: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
        annotations: None,
    }
}

fn server_name_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "server_name": { "type": "string", "description": description }
        },
        "required": ["server_name"]
    })
}

fn no_args_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn install_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "git_url": {
                "type": "string",
                "description": "Repository URL; append @branch or @tag to pin a ref"
            },
            "server_name": { "type": "string", "description": "Name in .mcp.json (default: repository name)" },
            "server_file": { "type": "string", "description": "Entry file to run (default: auto-detect)" },
            "env_vars": {
                "type": "object",
                "description": "Environment variables passed to the server",
                "additionalProperties": { "type": "string" }
            },
            "requirements_file": { "type": "string", "description": "Requirements file (default: requirements.txt)" },
            "auto_detect": { "type": "boolean", "description": "Detect the entry file when server_file is absent" }
        },
        "required": ["git_url"]
    })
}

/// Every meta-tool, in the order `tools/list` reports them.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        definition(
            "load_mcp_server_dynamically",
            "Start a configured MCP server and make its tools callable without restarting the client.",
            server_name_schema("Server name from .mcp.json"),
        ),
        definition(
            "call_dynamic_server_tool",
            "Call a tool on a dynamically loaded MCP server.",
            json!({
                "type": "object",
                "properties": {
                    "server_name": { "type": "string", "description": "Loaded server name" },
                    "tool_name": { "type": "string", "description": "Tool to call" },
                    "parameters": { "type": "object", "description": "Tool arguments" }
                },
                "required": ["server_name", "tool_name"]
            }),
        ),
        definition(
            "get_loaded_servers",
            "Show every loaded server with its state, process id, and tools.",
            no_args_schema(),
        ),
        definition(
            "reload_mcp_server",
            "Restart a loaded server to pick up code or config changes.",
            server_name_schema("Loaded server name"),
        ),
        definition(
            "refresh_server_tools",
            "Re-read a loaded server's tool list without restarting it.",
            server_name_schema("Loaded server name"),
        ),
        definition(
            "unload_mcp_server",
            "Stop a loaded server and remove its tools.",
            server_name_schema("Loaded server name"),
        ),
        definition(
            "list_available_servers",
            "List servers configured in .mcp.json and whether each is loaded.",
            no_args_schema(),
        ),
        definition(
            "install_mcp_server_from_git",
            "Clone an MCP server from git, install its dependencies, and add it to .mcp.json.",
            install_schema(),
        ),
        definition(
            "install_and_load_mcp_server",
            "Install an MCP server from git and load it immediately.",
            install_schema(),
        ),
        definition(
            "list_installed_mcp_servers",
            "List servers installed from git.",
            no_args_schema(),
        ),
        definition(
            "uninstall_mcp_server",
            "Remove an installed server from .mcp.json, unloading it first if needed.",
            json!({
                "type": "object",
                "properties": {
                    "server_name": { "type": "string", "description": "Installed server name" },
                    "delete_files": { "type": "boolean", "description": "Also delete the cloned repository" }
                },
                "required": ["server_name"]
            }),
        ),
        definition(
            "search_tools",
            "Search tools across loaded servers by keyword.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Keywords to match against tool names and descriptions" },
                    "max_results": { "type": "integer", "description": "Maximum results to return" }
                },
                "required": ["query"]
            }),
        ),
        definition(
            "list_all_tools",
            "List every tool from every loaded server.",
            no_args_schema(),
        ),
        definition(
            "get_tool_info",
            "Show the full definition of a tool, including its input schema.",
            json!({
                "type": "object",
                "properties": {
                    "tool_name": { "type": "string", "description": "Tool name" },
                    "server_name": { "type": "string", "description": "Restrict to one server" }
                },
                "required": ["tool_name"]
            }),
        ),
    ]
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::MemoryConfigStore;
    use crate::proxy::loader::CoreOptions;

    fn ctx() -> CommandContext {
        CommandContext {
            core: Arc::new(ProxyCore::new(
                Arc::new(MemoryConfigStore::new()),
                CoreOptions::default(),
            )),
            search_max_results: 10,
        }
    }

    #[test]
    fn test_definitions_are_unique_objects() {
        let defs = definitions();
        assert_eq!(defs.len(), 14);
        let mut names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 14);
        assert!(defs
            .iter()
            .all(|d| d.input_schema["type"] == "object" && !d.description.is_empty()));
    }

    #[tokio::test]
    async fn test_unknown_meta_tool() {
        assert!(dispatch(&ctx(), "no_such_tool", Value::Null).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_argument_is_invalid() {
        let body = dispatch(&ctx(), "load_mcp_server_dynamically", json!({}))
            .await
            .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "invalid_arguments");
    }

    #[tokio::test]
    async fn test_call_unloaded_reports_kind() {
        let body = dispatch(
            &ctx(),
            "call_dynamic_server_tool",
            json!({ "server_name": "ghost", "tool_name": "echo" }),
        )
        .await
        .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "not_loaded");
        assert_eq!(body["infrastructure"], false);
    }

    #[tokio::test]
    async fn test_refresh_unloaded_reports_kind() {
        let body = dispatch(&ctx(), "refresh_server_tools", json!({ "server_name": "ghost" }))
            .await
            .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "not_loaded");
    }

    #[tokio::test]
    async fn test_empty_views_succeed() {
        let ctx = ctx();
        let loaded = dispatch(&ctx, "get_loaded_servers", Value::Null).await.unwrap();
        assert_eq!(loaded["success"], true);
        assert_eq!(loaded["count"], 0);

        let search = dispatch(&ctx, "search_tools", json!({ "query": "add" }))
            .await
            .unwrap();
        assert_eq!(search["success"], true);
        assert_eq!(search["results"], json!([]));
    }

    #[test]
    fn test_install_args_default_auto_detect() {
        let args: InstallArgs = parse_args(
            "install_mcp_server_from_git",
            json!({ "git_url": "https://github.com/acme/tools", "env_vars": { "K": "V" } }),
        )
        .unwrap();
        let request = InstallRequest::from(args);
        assert!(request.auto_detect);
        assert_eq!(request.env.get("K").map(String::as_str), Some("V"));
    }
}
