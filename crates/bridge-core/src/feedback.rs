use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ErrorKind, ExecutionError, HostTarget};

static HOST_API: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b(?:Word|Excel|PowerPoint)\.\w+").ok());

/// Fixed remediation material for one error kind.
pub struct Remediation {
    pub summary: &'static str,
    pub techniques: &'static [&'static str],
    pub common_causes: &'static [&'static str],
}

pub fn remediation_for(kind: ErrorKind) -> &'static Remediation {
    match kind {
        ErrorKind::InvalidArgument => &INVALID_ARGUMENT,
        ErrorKind::InvalidReference => &INVALID_REFERENCE,
        ErrorKind::ApiUnavailable => &API_UNAVAILABLE,
        ErrorKind::GeneralFailure => &GENERAL_FAILURE,
        ErrorKind::NetworkFailure => &NETWORK_FAILURE,
        ErrorKind::Timeout => &TIMEOUT,
        ErrorKind::Unknown => &UNKNOWN,
    }
}

static INVALID_ARGUMENT: Remediation = Remediation {
    summary: "Argument validation failed; check parameter names, types and allowed values",
    techniques: &[
        "Use the correct InsertLocation value (\"Before\", \"After\", \"Start\", \"End\")",
        "Make sure cell addresses are well formed (\"A1\", \"B2:D4\")",
        "Check array indexes against their bounds",
        "Match each parameter type (string, number, boolean)",
        "Never pass null or undefined for a required parameter",
    ],
    common_causes: &[
        "Misspelled parameter",
        "Wrong enumeration value",
        "Parameter type mismatch",
        "Missing required parameter",
    ],
};

static INVALID_REFERENCE: Remediation = Remediation {
    summary: "The referenced object does not exist or is no longer valid; verify it before use",
    techniques: &[
        "Verify existence before use: prefer getItemOrNullObject() over getItem()",
        "Load referenced properties with load() and await context.sync() before reading them",
        "Check the isNullObject sentinel before proceeding",
        "Create objects before referencing them",
        "Check names exactly, they are case sensitive",
    ],
    common_causes: &[
        "Worksheet or named range does not exist",
        "Object was deleted",
        "Misspelled name",
        "Property read before synchronisation",
    ],
};

static API_UNAVAILABLE: Remediation = Remediation {
    summary: "The API is not available on this host version or platform",
    techniques: &[
        "Guard the call with Office.context.requirements.isSetSupported()",
        "Provide a fallback implementation",
        "Prefer older, widely supported APIs",
        "Check the minimum host version the API requires",
    ],
    common_causes: &[
        "API introduced in a newer host version",
        "Unsupported platform",
        "Misspelled API name",
        "Missing requirement set",
    ],
};

static GENERAL_FAILURE: Remediation = Remediation {
    summary: "Internal host error or conflicting operations",
    techniques: &[
        "Simplify the script and avoid doing too much in one run",
        "Work in batches and call context.sync() after each batch",
        "Avoid concurrent operations on the same objects",
        "Create objects before modifying them",
    ],
    common_causes: &[
        "Too much data loaded at once",
        "Operations in the wrong order",
        "Concurrent operation conflict",
        "Host in an unexpected state",
    ],
};

static NETWORK_FAILURE: Remediation = Remediation {
    summary: "Network connectivity problem or request timeout inside the host",
    techniques: &[
        "Check that the host has network access",
        "Reduce the amount of data moved per request",
        "Retry the operation once connectivity is back",
    ],
    common_causes: &["Unstable network", "Request timeout", "Server not responding"],
};

static TIMEOUT: Remediation = Remediation {
    summary: "No client reported a result before the deadline",
    techniques: &[
        "Check that the document host is open and the client is attached",
        "Reload the client page to re-establish its connection",
        "Split long-running scripts into smaller steps",
    ],
    common_causes: &[
        "Document host not loaded",
        "Client disconnected from the server",
        "Script running for too long",
    ],
};

static UNKNOWN: Remediation = Remediation {
    summary: "Unrecognised error; further diagnosis is needed",
    techniques: &[
        "Check the script syntax",
        "Await every asynchronous call",
        "Wrap the body in try/catch to capture the precise error",
        "Reduce the script step by step to isolate the failure",
    ],
    common_causes: &[
        "Syntax error",
        "Unawaited asynchronous operation",
        "Undefined variable",
        "Type conversion error",
    ],
};

/// Best-effort description of where the failure happened.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentContext {
    pub target: Option<HostTarget>,
    pub host_version: Option<String>,
    pub platform: Option<String>,
}

impl EnvironmentContext {
    pub fn for_target(target: HostTarget) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

/// Host API namespaces a script touches, e.g. `Excel.run`.
pub fn used_apis(script: &str) -> Vec<String> {
    let Some(regex) = HOST_API.as_ref() else {
        return Vec::new();
    };
    regex
        .find_iter(script)
        .map(|found| found.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Likely causes read off the error message.
pub fn infer_causes(error: &ExecutionError) -> Vec<String> {
    let message = error.message.to_ascii_lowercase();
    let mut causes = Vec::new();

    match error.kind {
        ErrorKind::InvalidArgument => {
            if message.contains("name") {
                causes.push("A parameter name may be misspelled or not exist");
            }
            if message.contains("range") || message.contains("address") {
                causes.push("A cell address may be malformed");
            }
            if message.contains("value") {
                causes.push("A parameter value may be out of range");
            }
        }
        ErrorKind::InvalidReference => {
            if message.contains("worksheet") || message.contains("sheet") {
                causes.push("The referenced worksheet may not exist");
            }
            if message.contains("null") || message.contains("undefined") {
                causes.push("An object may not be initialised");
            }
        }
        ErrorKind::ApiUnavailable => {
            causes.push("The host version may not support this API");
            causes.push("The API may not be available on this platform");
        }
        _ => {}
    }

    if causes.is_empty() {
        return remediation_for(error.kind)
            .common_causes
            .iter()
            .map(|cause| cause.to_string())
            .collect();
    }
    causes.into_iter().map(str::to_string).collect()
}

/// Fix suggestions derived from the failing script itself.
pub fn script_suggestions(error: &ExecutionError, script: &str) -> Vec<String> {
    let mut suggestions = Vec::new();

    match error.kind {
        ErrorKind::InvalidArgument => {
            if script.contains(".getItem(") {
                suggestions.push("Consider getItemOrNullObject() instead of getItem()");
            }
            if script.contains("InsertLocation") {
                suggestions.push("Check InsertLocation values (\"Before\", \"After\", ...)");
            }
        }
        ErrorKind::InvalidReference => {
            if !script.contains(".load(") {
                suggestions.push("Add load() and sync() before reading properties");
            }
            if !script.contains("getItemOrNullObject") {
                suggestions.push("Use getItemOrNullObject() to check that the object exists");
            }
            if !script.contains("isNullObject") {
                suggestions.push("Check isNullObject before using the object");
            }
        }
        ErrorKind::ApiUnavailable => {
            suggestions.push("Add an isSetSupported() check with a fallback");
        }
        ErrorKind::GeneralFailure => {
            if !script.contains("context.sync()") {
                suggestions.push("Add context.sync() so queued operations are applied");
            }
            if script.len() > 500 {
                suggestions.push("Split the operation into smaller steps");
            }
        }
        _ => {}
    }

    if !script.contains("try") || !script.contains("catch") {
        suggestions.push("Add try/catch error handling");
    }

    suggestions.into_iter().map(str::to_string).collect()
}

fn push_error_block(out: &mut String, error: &ExecutionError) {
    out.push_str("## Error\n\n");
    let _ = writeln!(out, "- **Kind**: {}", error.kind);
    let _ = writeln!(out, "- **Message**: {}", error.message);
    if let Some(code) = &error.code {
        let _ = writeln!(out, "- **Code**: {code}");
    }
    if let Some(stack) = &error.stack_trace {
        let _ = write!(out, "- **Stack trace**:\n```\n{}\n```\n", stack.trim_end());
    }
}

fn push_list(out: &mut String, title: &str, items: impl IntoIterator<Item = impl AsRef<str>>) {
    let _ = writeln!(out, "**{title}**:");
    for item in items {
        let _ = writeln!(out, "- {}", item.as_ref());
    }
    out.push('\n');
}

/// Remediation message handed back to the orchestrator after a failed attempt.
pub fn build_feedback(
    error: &ExecutionError,
    script: &str,
    attempt: u32,
    max_attempts: u32,
    environment: Option<&EnvironmentContext>,
) -> String {
    let remediation = remediation_for(error.kind);
    let mut out = format!(
        "Script execution failed (attempt {attempt}/{max_attempts}). Fix the script and resubmit it.\n\n"
    );

    push_error_block(&mut out, error);

    let _ = write!(out, "\n## Failed script\n\n```javascript\n{}\n```\n\n", script.trim());

    out.push_str("## Environment\n\n");
    let env = environment.cloned().unwrap_or_default();
    let target = env
        .target
        .map(|target| target.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let _ = writeln!(out, "- **Target**: {target}");
    let _ = writeln!(
        out,
        "- **Host version**: {}",
        env.host_version.as_deref().unwrap_or("unknown")
    );
    let _ = writeln!(
        out,
        "- **Platform**: {}",
        env.platform.as_deref().unwrap_or("unknown")
    );
    let apis = used_apis(script);
    let _ = writeln!(
        out,
        "- **APIs used**: {}\n",
        if apis.is_empty() {
            "none recognised".to_string()
        } else {
            apis.join(", ")
        }
    );

    out.push_str("## Remediation\n\n");
    let _ = writeln!(out, "**Problem**: {}\n", remediation.summary);
    push_list(&mut out, "Likely causes", infer_causes(error));
    push_list(&mut out, "Techniques", remediation.techniques);
    let suggestions = script_suggestions(error, script);
    if !suggestions.is_empty() {
        push_list(&mut out, "For this script", suggestions);
    }

    out.push_str(
        "## Required\n\n\
         Resubmit a corrected, complete script through the same tool:\n\n\
         1. Identify the root cause from the error kind and message\n\
         2. Apply the matching remediation techniques\n\
         3. Add the needed checks (getItemOrNullObject, isNullObject, isSetSupported)\n\
         4. Send the full corrected script, not only an explanation\n",
    );
    out
}

/// Terminal report once the repair budget of a script is spent.
pub fn build_terminal_report(error: &ExecutionError, attempts: u32) -> String {
    format!(
        "Execution failed: exhausted {attempts} attempts without success.\n\n\
         - **Kind**: {}\n\
         - **Last error**: {}\n\n\
         No further automatic repair will be attempted for this script.",
        error.kind, error.message
    )
}

/// Message returned when no client answered in time.
pub fn build_timeout_report(timeout: Duration) -> String {
    let remediation = remediation_for(ErrorKind::Timeout);
    let mut out = format!("Execution timed out after {timeout:?}.\n\n");
    push_list(&mut out, "Possible causes", remediation.common_causes);
    push_list(&mut out, "Suggestions", remediation.techniques);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"await Excel.run(async (context) => {
  const sheet = context.workbook.worksheets.getItem("Missing");
  sheet.activate();
  await context.sync();
});"#;

    #[test]
    fn every_kind_has_three_to_five_techniques() {
        for kind in ErrorKind::ALL {
            let count = remediation_for(kind).techniques.len();
            assert!((3..=5).contains(&count), "{kind}: {count}");
        }
    }

    #[test]
    fn feedback_carries_error_script_and_instruction() {
        let error = ExecutionError::new(ErrorKind::InvalidReference, "Worksheet not found")
            .with_code("ItemNotFound");
        let env = EnvironmentContext::for_target(HostTarget::Excel);
        let text = build_feedback(&error, SCRIPT, 2, 3, Some(&env));

        assert!(text.contains("attempt 2/3"));
        assert!(text.contains("- **Kind**: InvalidReference"));
        assert!(text.contains("- **Code**: ItemNotFound"));
        assert!(text.contains(SCRIPT));
        assert!(text.contains("- **Target**: excel"));
        assert!(text.contains("Excel.run"));
        assert!(text.contains("Verify existence before use"));
        assert!(text.contains("The referenced worksheet may not exist"));
        assert!(text.contains("Check isNullObject before using the object"));
        assert!(text.contains("Resubmit a corrected, complete script"));
    }

    #[test]
    fn used_apis_are_deduplicated() {
        let apis = used_apis("Word.run(); Word.run(); Excel.Range; PowerPoint.run()");
        assert_eq!(apis, vec!["Excel.Range", "PowerPoint.run", "Word.run"]);
    }

    #[test]
    fn terminal_report_mentions_exhaustion() {
        let error = ExecutionError::new(ErrorKind::GeneralFailure, "busy");
        let text = build_terminal_report(&error, 3);
        assert!(text.contains("exhausted 3 attempts"));
        assert!(!text.contains("Resubmit"));
    }
}
