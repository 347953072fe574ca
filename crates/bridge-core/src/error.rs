use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    #[error("internal error: {0}")]
    Internal(String),
}
