use serde_json::Value;

use crate::types::{ErrorKind, ExecutionError};

/// Maps the host's native error codes and legacy type names onto the closed taxonomy.
fn kind_from_label(label: &str) -> Option<ErrorKind> {
    let kind = match label.trim() {
        "InvalidArgument" => ErrorKind::InvalidArgument,
        "InvalidReference" => ErrorKind::InvalidReference,
        "ApiNotFound" | "ApiUnavailable" => ErrorKind::ApiUnavailable,
        "GeneralException" | "GeneralFailure" => ErrorKind::GeneralFailure,
        "NetworkError" | "NetworkFailure" => ErrorKind::NetworkFailure,
        "Timeout" => ErrorKind::Timeout,
        "UnknownError" | "Unknown" => ErrorKind::Unknown,
        _ => return None,
    };
    Some(kind)
}

fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidArgument => "The argument is invalid, missing, or has an incorrect format",
        ErrorKind::InvalidReference => "The reference is not valid for the current operation",
        ErrorKind::ApiUnavailable => "The API is not available on this host",
        ErrorKind::GeneralFailure => "An internal error occurred while processing the request",
        ErrorKind::NetworkFailure => "Network error",
        ErrorKind::Timeout => "No result was reported before the deadline",
        ErrorKind::Unknown => "Unknown error",
    }
}

fn mentions_network(message: &str) -> bool {
    message.to_ascii_lowercase().contains("network")
}

fn string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
}

/// Turns whatever a remote client reported into a structured error.
///
/// Recognised shapes, in order: a native `code`, an explicit `kind`/`type`, a
/// `NetworkError` name or a message mentioning the network. Anything else is `Unknown`.
pub fn classify(raw: &Value) -> ExecutionError {
    match raw {
        Value::Object(_) => classify_object(raw),
        Value::String(message) => classify_message(message),
        Value::Null => ExecutionError::new(
            ErrorKind::Unknown,
            "Remote execution failed without error details",
        ),
        other => classify_message(&other.to_string()),
    }
}

/// Classifies a failure reported without any error payload.
pub fn classify_missing() -> ExecutionError {
    classify(&Value::Null)
}

fn classify_message(message: &str) -> ExecutionError {
    let kind = if mentions_network(message) {
        ErrorKind::NetworkFailure
    } else {
        ErrorKind::Unknown
    };
    let message = if message.trim().is_empty() {
        default_message(kind).to_string()
    } else {
        message.to_string()
    };
    ExecutionError::new(kind, message)
}

fn classify_object(raw: &Value) -> ExecutionError {
    let message = string_field(raw, &["message", "errorMessage"]);
    let stack_trace = string_field(raw, &["stackTrace", "stack"]).map(str::to_string);
    let native_code = raw.get("code").and_then(|code| match code {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    });

    let from_code = native_code.as_deref().and_then(kind_from_label);
    let from_kind = string_field(raw, &["kind", "type"]).and_then(kind_from_label);
    let from_name = string_field(raw, &["name"])
        .filter(|name| *name == "NetworkError")
        .map(|_| ErrorKind::NetworkFailure);
    let from_message = message
        .filter(|text| mentions_network(text))
        .map(|_| ErrorKind::NetworkFailure);

    let kind = from_code
        .or(from_kind)
        .or(from_name)
        .or(from_message)
        .unwrap_or(ErrorKind::Unknown);

    let message = match message {
        Some(text) => text.to_string(),
        None if kind == ErrorKind::Unknown => {
            if raw.as_object().is_some_and(|map| map.is_empty()) {
                default_message(kind).to_string()
            } else {
                raw.to_string()
            }
        }
        None => default_message(kind).to_string(),
    };

    ExecutionError {
        kind,
        code: native_code,
        message,
        stack_trace,
    }
}
