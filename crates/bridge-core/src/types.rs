use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::retry::Fingerprint;

/// Document-editor surface a script runs against.
///
/// The three office hosts are known by name; anything else is carried verbatim so
/// that the core stays a pure transport for routing labels it does not understand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HostTarget {
    Word,
    Excel,
    PowerPoint,
    Custom(String),
}

impl HostTarget {
    pub fn as_str(&self) -> &str {
        match self {
            HostTarget::Word => "word",
            HostTarget::Excel => "excel",
            HostTarget::PowerPoint => "powerpoint",
            HostTarget::Custom(name) => name,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, HostTarget::Custom(name) if name.trim().is_empty())
    }
}

impl From<String> for HostTarget {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "word" => HostTarget::Word,
            "excel" => HostTarget::Excel,
            "powerpoint" | "ppt" => HostTarget::PowerPoint,
            _ => HostTarget::Custom(value),
        }
    }
}

impl From<&str> for HostTarget {
    fn from(value: &str) -> Self {
        HostTarget::from(value.to_string())
    }
}

impl From<HostTarget> for String {
    fn from(value: HostTarget) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One dispatch unit held by the correlation store.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTask {
    pub correlation_id: Uuid,
    pub target: HostTarget,
    pub script: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub fingerprint: Option<Fingerprint>,
}

impl ExecutionTask {
    pub fn new(target: HostTarget, script: impl Into<String>, description: Option<String>) -> Self {
        let script = script.into();
        let fingerprint = Fingerprint::of(&script);
        Self {
            correlation_id: Uuid::new_v4(),
            target,
            script,
            description,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            fingerprint: Some(fingerprint),
        }
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            correlation_id: self.correlation_id,
            target: self.target.clone(),
            script: self.script.clone(),
            description: self.description.clone(),
        }
    }
}

/// Wire shape of a task handed to a remote client, on both the push stream and the pull query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub correlation_id: Uuid,
    pub target: HostTarget,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Closed failure taxonomy shared by client-reported and core-internal failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidReference,
    ApiUnavailable,
    GeneralFailure,
    NetworkFailure,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::InvalidArgument,
        ErrorKind::InvalidReference,
        ErrorKind::ApiUnavailable,
        ErrorKind::GeneralFailure,
        ErrorKind::NetworkFailure,
        ErrorKind::Timeout,
        ErrorKind::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::InvalidReference => "InvalidReference",
            ErrorKind::ApiUnavailable => "ApiUnavailable",
            ErrorKind::GeneralFailure => "GeneralFailure",
            ErrorKind::NetworkFailure => "NetworkFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Whether a failure of this kind may enter the repair loop.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Outcome recorded exactly once per correlation id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn succeeded(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error: ExecutionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Inbound tool call from the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(alias = "host")]
    pub target: HostTarget,
    #[serde(alias = "code")]
    pub script: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ExecuteRequest {
    pub fn new(target: impl Into<HostTarget>, script: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            script: script.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Result report posted by a remote client. `error` stays raw until the classifier sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubmission {
    pub correlation_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Protocol-level answer to a result submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    Accepted,
    Stale,
    UnknownCorrelationId,
}

impl SubmitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitStatus::Accepted => "accepted",
            SubmitStatus::Stale => "stale",
            SubmitStatus::UnknownCorrelationId => "unknown_correlation_id",
        }
    }
}
