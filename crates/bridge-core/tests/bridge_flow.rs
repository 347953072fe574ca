use std::sync::Arc;
use std::time::Duration;

use docbridge_core::{
    Bridge, BridgeConfig, DeliveryMode, DeliverySession, ErrorKind, ExecuteRequest,
    ResultSubmission, SubmitStatus, TaskEnvelope, ToolOutcome,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;

fn bridge_with_timeout(timeout_ms: u64) -> Arc<Bridge> {
    Arc::new(Bridge::new(BridgeConfig {
        result_timeout_ms: Some(timeout_ms),
        fallback_poll_ms: 10,
        ..BridgeConfig::default()
    }))
}

fn bridge() -> Arc<Bridge> {
    bridge_with_timeout(5_000)
}

fn spawn_execute(bridge: &Arc<Bridge>, request: ExecuteRequest) -> JoinHandle<ToolOutcome> {
    let bridge = bridge.clone();
    tokio::spawn(async move { bridge.execute(request).await.unwrap() })
}

async fn next_pending(bridge: &Bridge) -> TaskEnvelope {
    for _ in 0..400 {
        if let Some(task) = bridge.hub().list_pending().into_iter().next() {
            return task;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("no task was dispatched");
}

fn success(task: &TaskEnvelope, data: Value) -> ResultSubmission {
    ResultSubmission {
        correlation_id: task.correlation_id.to_string(),
        success: true,
        data: Some(data),
        error: None,
    }
}

fn failure(task: &TaskEnvelope, error: Value) -> ResultSubmission {
    ResultSubmission {
        correlation_id: task.correlation_id.to_string(),
        success: false,
        data: None,
        error: Some(error),
    }
}

fn script(lines: usize, mutations: usize) -> String {
    let mut out = Vec::new();
    for i in 0..mutations {
        out.push(format!("body.insertParagraph(\"row {i}\", \"End\");"));
    }
    while out.len() + 2 < lines {
        out.push(format!("const v{} = {};", out.len(), out.len()));
    }
    out.push("await context.sync();".to_string());
    out.push("return { success: true };".to_string());
    out.join("\n")
}

/// Runs one dispatch and answers it with a failure.
async fn fail_once(bridge: &Arc<Bridge>, script: &str) -> ToolOutcome {
    let call = spawn_execute(bridge, ExecuteRequest::new("excel", script));
    let task = next_pending(bridge).await;
    let status = bridge
        .submit(failure(
            &task,
            json!({"code": "InvalidReference", "message": "Worksheet not found"}),
        ))
        .unwrap();
    assert_eq!(status, SubmitStatus::Accepted);
    call.await.unwrap()
}

#[tokio::test]
async fn pull_client_round_trip() {
    let bridge = bridge();
    let call = spawn_execute(
        &bridge,
        ExecuteRequest::new("A", "noop").with_description("test"),
    );

    let task = next_pending(&bridge).await;
    let pending = bridge.hub().list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].correlation_id, task.correlation_id);
    assert_eq!(task.target.as_str(), "A");
    assert_eq!(task.script, "noop");
    assert_eq!(task.description.as_deref(), Some("test"));

    let status = bridge.submit(success(&task, json!({"ok": 1}))).unwrap();
    assert_eq!(status, SubmitStatus::Accepted);

    let outcome = call.await.unwrap();
    assert_eq!(outcome.to_json(), json!({"success": true, "data": {"ok": 1}}));
    assert!(bridge.hub().list_pending().is_empty());
}

#[tokio::test]
async fn second_submission_is_a_no_op() {
    let bridge = bridge();
    let call = spawn_execute(&bridge, ExecuteRequest::new("word", "noop"));
    let task = next_pending(&bridge).await;

    assert_eq!(
        bridge.submit(success(&task, json!("first"))).unwrap(),
        SubmitStatus::Accepted
    );
    assert_eq!(
        bridge.submit(success(&task, json!("second"))).unwrap(),
        SubmitStatus::Stale
    );

    match call.await.unwrap() {
        ToolOutcome::Success { data, .. } => assert_eq!(data, Some(json!("first"))),
        other => panic!("unexpected outcome: {other:?}"),
    }
    // still stale once the waiter has consumed the result
    assert_eq!(
        bridge.submit(failure(&task, json!("late"))).unwrap(),
        SubmitStatus::Stale
    );
    assert_eq!(bridge.bus().get(&task.correlation_id).unwrap().data, Some(json!("first")));
}

#[tokio::test]
async fn unknown_and_malformed_ids_are_rejected() {
    let bridge = bridge();
    let unknown = ResultSubmission {
        correlation_id: uuid::Uuid::new_v4().to_string(),
        success: true,
        data: None,
        error: None,
    };
    assert_eq!(
        bridge.submit(unknown).unwrap(),
        SubmitStatus::UnknownCorrelationId
    );

    let malformed = ResultSubmission {
        correlation_id: "not-a-uuid".into(),
        success: true,
        data: None,
        error: None,
    };
    assert!(bridge.submit(malformed).is_err());
}

#[tokio::test]
async fn unanswered_task_times_out_and_is_removed() {
    let bridge = bridge_with_timeout(50);
    let outcome = bridge
        .execute(ExecuteRequest::new("excel", "noop"))
        .await
        .unwrap();

    match outcome {
        ToolOutcome::Failure {
            kind,
            attempt,
            terminal,
            ..
        } => {
            assert_eq!(kind, ErrorKind::Timeout);
            assert_eq!(attempt, None);
            assert!(!terminal);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(bridge.store().is_empty());
    assert_eq!(bridge.bus().waiter_count(), 0);
    assert_eq!(bridge.retry().tracked(), 0);
}

#[tokio::test]
async fn result_after_timeout_is_unknown() {
    let bridge = bridge_with_timeout(200);
    let waiter = spawn_execute(&bridge, ExecuteRequest::new("excel", "noop"));
    let task = next_pending(&bridge).await;

    assert!(matches!(
        waiter.await.unwrap(),
        ToolOutcome::Failure {
            kind: ErrorKind::Timeout,
            ..
        }
    ));
    assert_eq!(
        bridge.submit(success(&task, json!("late"))).unwrap(),
        SubmitStatus::UnknownCorrelationId
    );
    assert!(bridge.bus().get(&task.correlation_id).is_none());
}

#[tokio::test]
async fn gate_blocks_before_anything_is_enqueued() {
    let bridge = bridge();

    for blocked in [script(90, 0), script(85, 20)] {
        let outcome = bridge
            .execute(ExecuteRequest::new("word", blocked))
            .await
            .unwrap();
        match &outcome {
            ToolOutcome::Blocked { issues, guidance } => {
                assert!(!issues.is_empty());
                assert!(guidance.contains("Split the work into smaller steps"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(outcome.to_json()["status"], json!("blocked"));
        assert!(bridge.store().is_empty());
        assert!(bridge.hub().list_pending().is_empty());
    }

    let call = spawn_execute(&bridge, ExecuteRequest::new("word", script(25, 3)));
    let task = next_pending(&bridge).await;
    bridge.submit(success(&task, json!({"done": true}))).unwrap();
    match call.await.unwrap() {
        ToolOutcome::Success { advisories, .. } => assert!(advisories.is_empty()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn warned_script_carries_advisories_on_success() {
    let bridge = bridge();
    let call = spawn_execute(&bridge, ExecuteRequest::new("word", script(40, 6)));
    let task = next_pending(&bridge).await;
    bridge.submit(success(&task, json!(null))).unwrap();

    let outcome = call.await.unwrap();
    let body = outcome.to_json();
    let advisories = body["advisories"].as_array().unwrap();
    assert!(advisories
        .iter()
        .any(|line| line.as_str().unwrap().starts_with("Too many lines: 40")));
}

#[tokio::test]
async fn repair_budget_is_three_attempts() {
    let bridge = bridge();
    let broken = "const s = context.workbook.worksheets.getItem(\"Missing\");";

    for attempt in 1..=3 {
        match fail_once(&bridge, broken).await {
            ToolOutcome::Failure {
                kind,
                remediation,
                attempt: reported,
                max_attempts,
                terminal,
                ..
            } => {
                assert_eq!(kind, ErrorKind::InvalidReference);
                assert_eq!(reported, Some(attempt));
                assert_eq!(max_attempts, 3);
                assert!(!terminal);
                let remediation = remediation.unwrap();
                assert!(remediation.contains(&format!("attempt {attempt}/3")));
                assert!(remediation.contains(broken));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    match fail_once(&bridge, broken).await {
        ToolOutcome::Failure {
            message,
            remediation,
            terminal,
            ..
        } => {
            assert!(terminal);
            assert!(remediation.is_none());
            assert!(message.contains("exhausted 3 attempts"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(bridge.retry().tracked(), 0);
}

#[tokio::test]
async fn success_resets_the_fingerprint_budget() {
    let bridge = bridge();
    let flaky = "await context.sync();";

    fail_once(&bridge, flaky).await;
    fail_once(&bridge, flaky).await;

    let call = spawn_execute(&bridge, ExecuteRequest::new("excel", flaky));
    let task = next_pending(&bridge).await;
    bridge.submit(success(&task, json!(1))).unwrap();
    assert!(call.await.unwrap().is_success());

    match fail_once(&bridge, flaky).await {
        ToolOutcome::Failure { attempt, .. } => assert_eq!(attempt, Some(1)),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn pushed_task_stays_pullable_after_failover() {
    let bridge = bridge();
    let mut stream = bridge.hub().subscribe();
    let mut session = DeliverySession::new(bridge.config().push_reconnect_attempts);

    let call = spawn_execute(&bridge, ExecuteRequest::new("powerpoint", "noop"));
    let pushed = stream.recv().await.unwrap();
    drop(stream);

    for _ in 0..3 {
        session.on_push_failure();
    }
    assert_eq!(session.mode(), DeliveryMode::PullFallback);

    let pending = bridge.hub().list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].correlation_id, pushed.correlation_id);

    let claimed = bridge.hub().claim(&pushed.correlation_id).unwrap();
    bridge.submit(success(&claimed, json!({"slides": 3}))).unwrap();
    assert!(call.await.unwrap().is_success());
}

#[tokio::test]
async fn concurrent_identical_scripts_share_one_dispatch() {
    let bridge = bridge();
    let first = spawn_execute(&bridge, ExecuteRequest::new("excel", "noop"));
    let task = next_pending(&bridge).await;
    let second = spawn_execute(&bridge, ExecuteRequest::new("excel", "noop"));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(bridge.hub().list_pending().len(), 1);
    bridge.submit(success(&task, json!({"ok": 1}))).unwrap();

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first, second);
    assert!(first.is_success());
    assert_eq!(bridge.status().inflight_scripts, 0);
}

#[tokio::test]
async fn cancelled_leader_hands_its_task_to_the_follower() {
    let bridge = bridge();
    let leader = spawn_execute(&bridge, ExecuteRequest::new("word", "body.insertText(\"x\", \"End\");"));
    let task = next_pending(&bridge).await;
    let follower = spawn_execute(&bridge, ExecuteRequest::new("word", "body.insertText(\"x\", \"End\");"));
    sleep(Duration::from_millis(50)).await;

    leader.abort();
    let _ = leader.await;
    sleep(Duration::from_millis(50)).await;

    let pending = bridge.hub().list_pending();
    assert_eq!(pending.len(), 1, "identical script dispatched twice");
    assert_eq!(pending[0].correlation_id, task.correlation_id);
    assert!(!follower.is_finished());

    assert_eq!(
        bridge.submit(success(&task, json!({"ok": 1}))).unwrap(),
        SubmitStatus::Accepted
    );
    let outcome = follower.await.unwrap();
    assert_eq!(outcome.to_json()["data"], json!({"ok": 1}));
    assert!(bridge.hub().list_pending().is_empty());
    assert_eq!(bridge.status().inflight_scripts, 0);
}

#[tokio::test]
async fn abandoned_slot_is_resumed_by_a_later_identical_call() {
    let bridge = bridge();
    let leader = spawn_execute(&bridge, ExecuteRequest::new("excel", "noop"));
    let task = next_pending(&bridge).await;
    leader.abort();
    let _ = leader.await;

    let again = spawn_execute(&bridge, ExecuteRequest::new("excel", "noop"));
    sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.hub().list_pending().len(), 1);

    bridge.submit(success(&task, json!("done"))).unwrap();
    assert!(again.await.unwrap().is_success());
}

#[tokio::test]
async fn read_without_data_gets_a_reminder() {
    let bridge = bridge();
    let call = spawn_execute(
        &bridge,
        ExecuteRequest::new("word", "noop").with_description("Read the first paragraph"),
    );
    let task = next_pending(&bridge).await;
    bridge
        .submit(ResultSubmission {
            correlation_id: task.correlation_id.to_string(),
            success: true,
            data: None,
            error: None,
        })
        .unwrap();

    let outcome = call.await.unwrap();
    assert!(outcome
        .render_text()
        .contains("This was a read operation but no data was returned"));
}

#[tokio::test]
async fn write_without_data_gets_a_softer_hint() {
    let bridge = bridge();
    let call = spawn_execute(
        &bridge,
        ExecuteRequest::new("word", "noop").with_description("Append a heading"),
    );
    let task = next_pending(&bridge).await;
    bridge
        .submit(ResultSubmission {
            correlation_id: task.correlation_id.to_string(),
            success: true,
            data: None,
            error: None,
        })
        .unwrap();

    let outcome = call.await.unwrap();
    let text = outcome.render_text();
    assert!(text.starts_with("Execution succeeded."));
    assert!(text.contains("No data was returned"));
    assert!(!text.contains("read operation"));

    let with_data = spawn_execute(&bridge, ExecuteRequest::new("word", "noop2"));
    let task = next_pending(&bridge).await;
    bridge.submit(success(&task, json!({"ok": 1}))).unwrap();
    assert_eq!(with_data.await.unwrap().to_json().get("reminder"), None);
}
