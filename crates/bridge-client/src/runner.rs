use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use docbridge_core::TaskEnvelope;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// What a runner reports back for one task. `error` stays raw; the server classifies it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunReport {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl RunReport {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: Value) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Executes scripts inside the document host.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, task: &TaskEnvelope) -> RunReport;
}

/// Runs each script through an external program: the script goes to stdin and a JSON
/// `{success, data?, error?}` is expected on stdout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn spawn_and_collect(&self, task: &TaskEnvelope) -> Result<std::process::Output, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("DOCBRIDGE_TARGET", task.target.as_str())
            .env("DOCBRIDGE_CORRELATION_ID", task.correlation_id.to_string())
            .env("DOCBRIDGE_DESCRIPTION", task.description.as_deref().unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("failed to start {}: {err}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(task.script.as_bytes())
                .await
                .map_err(|err| format!("failed to write script: {err}"))?;
        }

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|err| format!("failed to wait for {}: {err}", self.program)),
            Err(_) => Err(format!("script exceeded {:?}", self.timeout)),
        }
    }
}

#[async_trait]
impl ScriptRunner for CommandRunner {
    async fn run(&self, task: &TaskEnvelope) -> RunReport {
        let output = match self.spawn_and_collect(task).await {
            Ok(output) => output,
            Err(message) => {
                return RunReport::failed(json!({ "code": "GeneralException", "message": message }))
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("runner exited with {}", output.status)
            } else {
                stderr
            };
            return RunReport::failed(json!({ "message": message }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(correlation_id = %task.correlation_id, bytes = stdout.len(), "runner finished");
        match serde_json::from_str::<RunReport>(stdout.trim()) {
            Ok(report) => report,
            Err(err) => RunReport::failed(json!({
                "message": format!("runner printed invalid JSON: {err}"),
                "stack": stdout.trim(),
            })),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use docbridge_core::HostTarget;

    fn task() -> TaskEnvelope {
        TaskEnvelope {
            correlation_id: uuid::Uuid::new_v4(),
            target: HostTarget::Word,
            script: "await context.sync();".into(),
            description: None,
        }
    }

    fn shell(script: &str) -> CommandRunner {
        CommandRunner::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn reads_json_report_from_stdout() {
        let runner = shell(r#"cat > /dev/null; echo '{"success":true,"data":{"ok":1}}'"#);
        assert_eq!(runner.run(&task()).await, RunReport::ok(Some(json!({"ok": 1}))));
    }

    #[tokio::test]
    async fn script_arrives_on_stdin() {
        let runner = shell(r#"body=$(cat); printf '{"success":true,"data":"%s"}' "$DOCBRIDGE_TARGET:$body""#);
        let report = runner.run(&task()).await;
        assert_eq!(report.data, Some(json!("word:await context.sync();")));
    }

    #[tokio::test]
    async fn non_zero_exit_becomes_raw_error() {
        let report = shell("cat > /dev/null; echo boom >&2; exit 3").run(&task()).await;
        assert!(!report.success);
        assert_eq!(report.error.unwrap()["message"], json!("boom"));
    }

    #[tokio::test]
    async fn invalid_json_and_timeouts_fail() {
        let report = shell("cat > /dev/null; echo not-json").run(&task()).await;
        assert!(!report.success);

        let report = shell("sleep 5")
            .with_timeout(Duration::from_millis(50))
            .run(&task())
            .await;
        assert_eq!(report.error.unwrap()["code"], json!("GeneralException"));
    }
}
