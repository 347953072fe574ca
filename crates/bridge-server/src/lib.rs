use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use docbridge_core::Bridge;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

mod auth;
pub mod error;
pub mod http_server;
pub mod tools;
pub mod transport;

pub use error::{ToolError, ToolResult};

use crate::transport::HttpSettings;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[async_trait]
pub trait BridgeTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, params: Value) -> ToolResult<Value>;
    fn input_schema(&self) -> Value;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn BridgeTool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn BridgeTool>>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();

        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_none() {
                order.push(name);
            }
        }

        Self { tools: map, order }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BridgeTool>> {
        self.tools.get(name).cloned()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }
}

/// JSON-RPC front of the bridge. The orchestrator reaches it over stdio or `POST /message`;
/// remote clients only ever talk to the HTTP task endpoints.
pub struct BridgeServer {
    registry: ToolRegistry,
    bridge: Arc<Bridge>,
}

impl BridgeServer {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let registry = ToolRegistry::new(tools::default_tools(bridge.clone()));
        Self::with_registry(bridge, registry)
    }

    pub fn with_registry(bridge: Arc<Bridge>, registry: ToolRegistry) -> Self {
        Self { registry, bridge }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        tracing::info!("serving orchestrator JSON-RPC on stdin/stdout");
        self.serve_lines(io::stdin(), io::stdout()).await
    }

    /// Line-delimited JSON-RPC loop. Every request runs as its own task so a pending tool
    /// call never holds up the ones behind it; replies go through one writer in completion order.
    pub async fn serve_lines<R, W>(self: Arc<Self>, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (replies, mut outbox) = mpsc::unbounded_channel::<Value>();
        let writer = tokio::spawn(async move {
            let mut output = output;
            while let Some(response) = outbox.recv().await {
                let out = serde_json::to_string(&response)? + "\n";
                output.write_all(out.as_bytes()).await?;
                output.flush().await?;
            }
            anyhow::Ok(())
        });

        let mut reader = BufReader::new(input);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::info!("orchestrator closed stdin");
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let request = match serde_json::from_str::<Value>(trimmed) {
                        Ok(request) => request,
                        Err(err) => {
                            tracing::warn!("unparseable JSON-RPC line: {err}");
                            let _ = replies.send(json!({
                                "jsonrpc": "2.0",
                                "id": Value::Null,
                                "error": {"code": -32700, "message": "Parse error"}
                            }));
                            continue;
                        }
                    };

                    let server = self.clone();
                    let replies = replies.clone();
                    tokio::spawn(async move {
                        let response = match server.handle_jsonrpc(request).await {
                            Ok(response) => response,
                            Err(err) => {
                                tracing::error!("JSON-RPC handling failed: {err:#}");
                                Some(json!({
                                    "jsonrpc": "2.0",
                                    "id": Value::Null,
                                    "error": {"code": -32603, "message": "Internal error"}
                                }))
                            }
                        };
                        if let Some(response) = response {
                            let _ = replies.send(response);
                        }
                    });
                }
                Err(err) => {
                    tracing::error!("failed to read stdin: {err}");
                    break;
                }
            }
        }

        // in-flight calls keep their sender clones, so the writer drains them before stopping
        drop(replies);
        writer.await.context("stdout writer task failed")??;
        Ok(())
    }

    pub async fn handle_jsonrpc(&self, request: Value) -> Result<Option<Value>> {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Missing method field"))?;

        if method.starts_with("notifications/") {
            tracing::debug!(method, "notification received");
            return Ok(None);
        }

        tracing::debug!(method, id = ?request.get("id"), "handling JSON-RPC request");

        let request: JsonRpcRequest = serde_json::from_value(request)?;
        let response = handle_request(request, &self.registry).await;
        Ok(Some(serde_json::to_value(&response)?))
    }

    pub async fn serve_http(self: Arc<Self>, settings: HttpSettings) -> Result<()> {
        http_server::run_http_transport(self, settings).await
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, error: ToolError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code: error.code(),
                message: error.message(),
                data: error.data(),
            }),
        }
    }
}

async fn handle_request(request: JsonRpcRequest, registry: &ToolRegistry) -> JsonRpcResponse {
    let JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params,
    } = request;
    let id = id.unwrap_or(Value::Null);

    if jsonrpc != "2.0" {
        return JsonRpcResponse::error(
            id,
            ToolError::rpc(-32600, format!("Unsupported JSON-RPC version: {jsonrpc}"), None),
        );
    }

    match method.as_str() {
        "initialize" => JsonRpcResponse::result(id, initialize_result()),
        "ping" => JsonRpcResponse::result(id, json!({})),
        "tools/list" => JsonRpcResponse::result(id, json!({ "tools": registry.descriptors() })),
        "tools/call" => handle_tools_call(id, params, registry).await,
        _ => JsonRpcResponse::error(
            id,
            ToolError::rpc(-32601, format!("Unknown method: {method}"), None),
        ),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2025-06-18",
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": "docbridge-server",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

async fn handle_tools_call(
    id: Value,
    params: Option<Value>,
    registry: &ToolRegistry,
) -> JsonRpcResponse {
    let params = match params {
        Some(Value::Object(map)) => map,
        _ => {
            return JsonRpcResponse::error(
                id,
                ToolError::InvalidRequest("Missing params object for tools/call".into()),
            );
        }
    };

    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(
            id,
            ToolError::InvalidRequest("Missing 'name' in params".into()),
        );
    };

    let Some(tool) = registry.get(name) else {
        return JsonRpcResponse::error(id, ToolError::ToolNotFound(name.to_string()));
    };

    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    match tool.execute(arguments).await {
        Ok(result) => JsonRpcResponse::result(id, result),
        Err(err) => {
            tracing::warn!(tool = name, "tool call failed: {err}");
            JsonRpcResponse::error(id, err)
        }
    }
}
