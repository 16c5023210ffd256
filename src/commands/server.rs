//! MCP server loop facing the client.
//!
//! Reads line-delimited JSON-RPC from the client, answers the MCP lifecycle
//! methods itself, and runs each `tools/call` on its own task so a slow
//! worker never blocks other requests. Responses are written through a
//! single writer task.

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::tools::{self, CommandContext};
use crate::proxy::transport::{FrameError, FrameReader, FrameWriter, Framing};
use crate::proxy::types::{
    error_codes, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, CLIENT_NAME, PROTOCOL_VERSION,
};

pub struct CommandServer {
    ctx: CommandContext,
}

impl CommandServer {
    pub fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }

    /// Serve one client connection until it closes its end.
    ///
    /// Requests still running at end of input are allowed to finish and
    /// their responses are written before this returns.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcMessage>();

        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer, Framing::Line);
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.write(&message).await {
                    tracing::warn!(error = %e, "failed to write response to client");
                    break;
                }
            }
        });

        let mut reader = FrameReader::new(reader, Framing::Line);
        let outcome = loop {
            match reader.read_next().await {
                Ok(Some(JsonRpcMessage::Request(request))) => {
                    let ctx = self.ctx.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = handle_request(&ctx, request).await;
                        let _ = tx.send(JsonRpcMessage::Response(response));
                    });
                }
                Ok(Some(JsonRpcMessage::Notification(notification))) => {
                    tracing::debug!(method = %notification.method, "client notification");
                }
                Ok(Some(JsonRpcMessage::Response(_))) => {
                    tracing::debug!("ignoring response from client");
                }
                Ok(None) => {
                    tracing::info!("client closed input");
                    break Ok(());
                }
                // One bad line does not poison the stream.
                Err(FrameError::Malformed(reason)) => {
                    tracing::warn!(reason = %reason, "unparseable client message");
                    let response = JsonRpcResponse::failure(None, error_codes::PARSE_ERROR, reason);
                    let _ = tx.send(JsonRpcMessage::Response(response));
                }
                Err(e) => break Err(e),
            }
        };

        // The writer task ends once every in-flight request has dropped its sender.
        drop(tx);
        let _ = writer_task.await;
        outcome
    }
}

async fn handle_request(ctx: &CommandContext, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id;
    let params = request.params.unwrap_or(Value::Null);

    match request.method.as_str() {
        "initialize" => {
            let protocol_version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION);
            if let Some(client) = params.pointer("/clientInfo/name").and_then(Value::as_str) {
                tracing::info!(client, protocol_version, "client initialized");
            }
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": protocol_version,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": {
                        "name": CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tools::definitions() })),
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return JsonRpcResponse::failure(
                    Some(id),
                    error_codes::INVALID_PARAMS,
                    "tools/call requires a tool name",
                );
            };
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

            tracing::debug!(tool = name, "meta-tool call");
            match tools::dispatch(ctx, name, arguments).await {
                Some(body) => {
                    let is_error = body["success"] != Value::Bool(true);
                    let text = serde_json::to_string_pretty(&body).unwrap_or_default();
                    JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{ "type": "text", "text": text }],
                            "isError": is_error,
                        }),
                    )
                }
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
