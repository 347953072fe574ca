use docbridge_core::BridgeError;
use serde_json::Value;
use thiserror::Error;

pub type ToolResult<T> = Result<T, ToolError>;

/// Errors surfaced to the orchestrator as JSON-RPC error objects.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl ToolError {
    pub fn code(&self) -> i32 {
        match self {
            ToolError::InvalidRequest(_) => -32602,
            ToolError::ToolNotFound(_) => -32601,
            ToolError::Internal(_) => -32603,
            ToolError::Rpc { code, .. } => *code,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ToolError::InvalidRequest(msg)
            | ToolError::ToolNotFound(msg)
            | ToolError::Internal(msg) => msg.clone(),
            ToolError::Rpc { message, .. } => message.clone(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            ToolError::Rpc { data, .. } => data.clone(),
            _ => None,
        }
    }

    pub fn rpc<D: Into<Option<Value>>, M: Into<String>>(code: i32, message: M, data: D) -> Self {
        ToolError::Rpc {
            code,
            message: message.into(),
            data: data.into(),
        }
    }
}

impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::InvalidRequest(msg) | BridgeError::InvalidCorrelationId(msg) => {
                ToolError::InvalidRequest(msg)
            }
            BridgeError::Internal(msg) => ToolError::Internal(msg),
        }
    }
}
