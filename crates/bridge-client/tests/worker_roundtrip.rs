use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docbridge_client::{
    BridgeClient, DeliveryMode, RunReport, ScriptRunner, SubmitStatus, TaskEnvelope, Worker,
    WorkerOptions,
};
use docbridge_core::{Bridge, BridgeConfig, ExecuteRequest, ResultSubmission};
use docbridge_server::{http_server::build_router, transport::HttpSettings, BridgeServer};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

struct Echo;

#[async_trait]
impl ScriptRunner for Echo {
    async fn run(&self, task: &TaskEnvelope) -> RunReport {
        RunReport::ok(Some(json!({ "target": task.target.as_str(), "len": task.script.len() })))
    }
}

async fn serve(sse_enabled: bool) -> (Arc<Bridge>, SocketAddr) {
    let bridge = Arc::new(Bridge::new(BridgeConfig {
        result_timeout_ms: Some(5_000),
        ..BridgeConfig::default()
    }));
    let server = Arc::new(BridgeServer::new(bridge.clone()));
    let settings = HttpSettings {
        sse_enabled,
        ..HttpSettings::default()
    };
    let router = build_router(server, &settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service()).await.unwrap();
    });
    (bridge, addr)
}

fn options(push_enabled: bool) -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(20),
        max_push_failures: 3,
        push_enabled,
    }
}

async fn execute_once(bridge: &Arc<Bridge>) -> docbridge_core::ToolOutcome {
    let request = ExecuteRequest::new("word", "await context.sync();");
    timeout(Duration::from_secs(5), bridge.execute(request))
        .await
        .expect("execute did not finish")
        .unwrap()
}

#[tokio::test]
async fn pull_worker_completes_a_task() {
    let (bridge, addr) = serve(true).await;
    let client = BridgeClient::new(format!("http://{addr}"), None);
    let mut worker = Worker::new(client, Echo, options(false));
    let handle = tokio::spawn(async move { worker.run().await });

    let outcome = execute_once(&bridge).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.to_json()["data"]["target"], json!("word"));
    handle.abort();
}

#[tokio::test]
async fn push_worker_receives_streamed_tasks() {
    let (bridge, addr) = serve(true).await;
    let client = BridgeClient::new(format!("http://{addr}"), None);
    let mut worker = Worker::new(client, Echo, options(true));
    let handle = tokio::spawn(async move { worker.run().await });

    for _ in 0..200 {
        if bridge.hub().subscriber_count() > 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bridge.hub().subscriber_count(), 1);

    let outcome = execute_once(&bridge).await;
    assert!(outcome.is_success());
    handle.abort();
}

#[tokio::test]
async fn missing_stream_falls_back_to_polling() {
    let (bridge, addr) = serve(false).await;
    let client = BridgeClient::new(format!("http://{addr}"), None);
    match client.open_stream().await {
        Err(docbridge_client::ClientError::Status { status, .. }) => assert_eq!(status, 404),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("stream should be unavailable"),
    }

    let mut worker = Worker::new(client, Echo, options(true));
    assert_eq!(worker.mode(), DeliveryMode::PushActive);
    let handle = tokio::spawn(async move { worker.run().await });
    let outcome = execute_once(&bridge).await;
    assert!(outcome.is_success());
    handle.abort();
}

#[tokio::test]
async fn client_calls_map_server_statuses() {
    let (bridge, addr) = serve(true).await;
    let client = BridgeClient::new(format!("http://{addr}"), None);

    let pending = {
        let bridge = bridge.clone();
        tokio::spawn(async move { execute_once(&bridge).await })
    };

    let task = loop {
        if let Some(task) = client.pending(false).await.unwrap().into_iter().next() {
            break task;
        }
        sleep(Duration::from_millis(10)).await;
    };
    assert!(client.claim(&task.correlation_id).await.unwrap().is_some());
    assert!(client.claim(&task.correlation_id).await.unwrap().is_none());

    let submission = ResultSubmission {
        correlation_id: task.correlation_id.to_string(),
        success: true,
        data: Some(json!(1)),
        error: None,
    };
    assert_eq!(client.submit(&submission).await.unwrap(), SubmitStatus::Accepted);
    assert!(pending.await.unwrap().is_success());
    assert_eq!(client.submit(&submission).await.unwrap(), SubmitStatus::Stale);

    let unknown = ResultSubmission {
        correlation_id: uuid::Uuid::new_v4().to_string(),
        ..submission
    };
    assert_eq!(
        client.submit(&unknown).await.unwrap(),
        SubmitStatus::UnknownCorrelationId
    );
}
