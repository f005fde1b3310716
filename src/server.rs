//! Line-framed JSON-RPC control surface over stdio.
//!
//! One request object per line on stdin, one response per line on stdout.
//! Tool calls are dispatched to the [`ToolRegistry`]; tool failures come back
//! as `content` with `isError: true` rather than protocol errors, so the
//! supervisor itself never goes down over a bad request. Logging goes to
//! stderr - stdout belongs to this protocol.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tools::ToolRegistry;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "shepherd";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// The supervisor's request dispatcher.
pub struct ControlServer {
    tools: ToolRegistry,
}

impl ControlServer {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    /// Handle one request. Notifications (no id) get no response.
    pub async fn handle_request(&self, request: &JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.id.is_none() {
            debug!(method = %request.method, "Ignoring notification");
            return None;
        }
        let id = request.id.clone();
        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": SERVER_VERSION,
                    }
                }),
            ),
            "initialized" | "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                JsonRpcResponse::success(id, json!({ "tools": self.tools.definitions() }))
            }
            "tools/call" => self.handle_tools_call(id, request.params.as_ref()).await,
            other => {
                JsonRpcResponse::error(id, -32601, format!("Method not found: {}", other))
            }
        };
        Some(response)
    }

    async fn handle_tools_call(
        &self,
        id: Option<Value>,
        params: Option<&Value>,
    ) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, -32602, "Missing params".to_string());
        };
        let Some(tool_name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::error(id, -32602, "Missing tool name".to_string());
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.tools.execute(tool_name, arguments).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result)
                    .unwrap_or_else(|_| result.to_string());
                JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }]
                    }),
                )
            }
            Err(e) => JsonRpcResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": format!("Error: {}", e) }],
                    "isError": true
                }),
            ),
        }
    }

    /// Serve requests from stdin until EOF or shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                debug!("stdin closed, stopping control server");
                break;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(&request).await,
                Err(e) => {
                    warn!(error = %e, "Unparseable control request");
                    Some(JsonRpcResponse::error(
                        None,
                        -32700,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                let mut payload = serde_json::to_string(&response)?;
                payload.push('\n');
                stdout.write_all(payload.as_bytes()).await?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }
}
