use std::sync::Arc;

use async_trait::async_trait;
use docbridge_core::{Bridge, ExecuteRequest};
use serde_json::{json, Value};

use crate::error::{ToolError, ToolResult};
use crate::BridgeTool;

/// Sends a script to the attached document host and waits for its outcome.
pub struct ExecuteScriptTool {
    bridge: Arc<Bridge>,
}

impl ExecuteScriptTool {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl BridgeTool for ExecuteScriptTool {
    fn name(&self) -> &str {
        "execute_script"
    }

    fn description(&self) -> &str {
        "Run a script inside the attached document host (word, excel, powerpoint) and return its result. \
         Oversized or risky scripts are refused before dispatch; failures come back with remediation guidance."
    }

    async fn execute(&self, params: Value) -> ToolResult<Value> {
        let request: ExecuteRequest = serde_json::from_value(params)
            .map_err(|err| ToolError::InvalidRequest(format!("invalid arguments: {err}")))?;

        let outcome = self.bridge.execute(request).await?;
        Ok(json!({
            "content": [{ "type": "text", "text": outcome.render_text() }],
            "structuredContent": outcome.to_json(),
            "isError": !outcome.is_success(),
        }))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "target": {
                    "type": "string",
                    "description": "Host surface the script runs against",
                    "examples": ["word", "excel", "powerpoint"]
                },
                "script": {
                    "type": "string",
                    "description": "Script body to execute in the host"
                },
                "description": {
                    "type": "string",
                    "description": "Short label of what the script does"
                }
            },
            "required": ["target", "script"],
            "additionalProperties": false
        })
    }
}

/// Snapshot of the bridge: queued tasks, attached clients, cached results, retry counters.
pub struct BridgeStatusTool {
    bridge: Arc<Bridge>,
}

impl BridgeStatusTool {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl BridgeTool for BridgeStatusTool {
    fn name(&self) -> &str {
        "bridge_status"
    }

    fn description(&self) -> &str {
        "Report pending and executing tasks, connected push clients and retry state"
    }

    async fn execute(&self, _params: Value) -> ToolResult<Value> {
        let status = serde_json::to_value(self.bridge.status())
            .map_err(|err| ToolError::Internal(err.to_string()))?;
        let text = serde_json::to_string_pretty(&status)
            .map_err(|err| ToolError::Internal(err.to_string()))?;
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": status,
        }))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }
}

pub fn default_tools(bridge: Arc<Bridge>) -> Vec<Arc<dyn BridgeTool>> {
    vec![
        Arc::new(ExecuteScriptTool::new(bridge.clone())),
        Arc::new(BridgeStatusTool::new(bridge)),
    ]
}
