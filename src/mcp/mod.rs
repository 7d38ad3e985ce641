//! MCP tool channel: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! The loop is deliberately thin. It answers the MCP handshake
//! (`initialize`, `tools/list`) and routes `tools/call` into the
//! dispatcher; tool-level failures are structured payloads inside
//! successful JSON-RPC responses, never protocol errors. Bad input never
//! crashes the loop.

pub mod protocol;
pub mod tools;

use crate::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, ToolCallParams, INVALID_PARAMS, METHOD_NOT_FOUND,
    PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::mcp::tools::ToolDispatcher;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Serve the tool channel until stdin reaches EOF.
pub async fn serve_stdio(dispatcher: Arc<ToolDispatcher>) -> std::io::Result<()> {
    info!("mcp stdio channel started");
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();

    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break; // EOF: the supervisor closed our stdin
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&dispatcher, trimmed).await {
            let mut out = serde_json::to_string(&response)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            out.push('\n');
            stdout.write_all(out.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    info!("mcp stdio channel closed");
    Ok(())
}

/// Process one request line. `None` means no response is due
/// (notifications).
pub async fn handle_line(dispatcher: &ToolDispatcher, line: &str) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("unparseable JSON-RPC line: {}", e);
            return Some(JsonRpcResponse::error(None, PARSE_ERROR, e.to_string()));
        }
    };

    match request.method.as_str() {
        "initialize" => Some(JsonRpcResponse::result(
            request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )),
        "ping" => Some(JsonRpcResponse::result(request.id, json!({}))),
        "tools/list" => Some(JsonRpcResponse::result(
            request.id,
            json!({ "tools": tools::tool_descriptors() }),
        )),
        "tools/call" => {
            let params: ToolCallParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    return Some(JsonRpcResponse::error(
                        request.id,
                        INVALID_PARAMS,
                        e.to_string(),
                    ))
                }
            };
            match dispatcher.dispatch(&params.name, params.arguments).await {
                Ok(payload) => Some(JsonRpcResponse::result(
                    request.id,
                    wrap_tool_result(payload),
                )),
                Err(unknown) => Some(JsonRpcResponse::error(
                    request.id,
                    INVALID_PARAMS,
                    format!("unknown tool: {}", unknown.0),
                )),
            }
        }
        method if method.starts_with("notifications/") => {
            debug!("notification ignored: {}", method);
            None
        }
        other => {
            if request.is_notification() {
                None
            } else {
                Some(JsonRpcResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("method not found: {}", other),
                ))
            }
        }
    }
}

/// Wrap a dispatcher payload as MCP tool-call content.
fn wrap_tool_result(payload: Value) -> Value {
    let is_error = payload
        .get("success")
        .and_then(Value::as_bool)
        .map(|ok| !ok)
        .unwrap_or(false);
    json!({
        "content": [ { "type": "text", "text": payload.to_string() } ],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;

    fn dispatcher() -> ToolDispatcher {
        ToolDispatcher::new(Arc::new(SessionRegistry::new()), None)
    }

    #[tokio::test]
    async fn test_initialize_answers_capabilities() {
        let d = dispatcher();
        let resp = handle_line(&d, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "ssh-mcp-server");
    }

    #[tokio::test]
    async fn test_initialized_notification_has_no_response() {
        let d = dispatcher();
        let resp = handle_line(
            &d,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn test_tools_list_contains_exec() {
        let d = dispatcher();
        let resp = handle_line(&d, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].clone();
        assert!(tools.as_array().unwrap().iter().any(|t| t["name"] == "exec"));
    }

    #[tokio::test]
    async fn test_tool_error_is_payload_not_rpc_error() {
        let d = dispatcher();
        let resp = handle_line(
            &d,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"exec","arguments":{"sessionName":"ghost","command":"ls"}}}"#,
        )
        .await
        .unwrap();
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("not-found"));
    }

    #[tokio::test]
    async fn test_parse_error_response() {
        let d = dispatcher();
        let resp = handle_line(&d, "{ not json").await.unwrap();
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let d = dispatcher();
        let resp = handle_line(&d, r#"{"jsonrpc":"2.0","id":4,"method":"shells/destroy"}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let d = dispatcher();
        let resp = handle_line(
            &d,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"rm-rf","arguments":{}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }
}
