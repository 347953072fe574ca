//! Reference remote client for the document bridge.
//!
//! The worker holds a push stream open while it can, falls back to polling the pending
//! query for good after repeated push failures, claims each task before running it and
//! posts the outcome back.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod error;
pub mod runner;
pub mod sse;

pub use docbridge_core::{DeliveryMode, DeliverySession, ResultSubmission, SubmitStatus, TaskEnvelope};
pub use error::{ClientError, ClientResult};
pub use runner::{CommandRunner, RunReport, ScriptRunner};

use crate::sse::{SseDecoder, SseFrame};

#[derive(Deserialize)]
struct TaskList {
    tasks: Vec<TaskEnvelope>,
}

#[derive(Deserialize)]
struct ClaimReply {
    task: TaskEnvelope,
}

#[derive(Deserialize)]
struct SubmitReply {
    status: SubmitStatus,
}

/// Thin HTTP client over the bridge's client-facing endpoints.
#[derive(Clone)]
pub struct BridgeClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl BridgeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> ClientResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn pending(&self, claim: bool) -> ClientResult<Vec<TaskEnvelope>> {
        let request = self
            .http
            .get(self.url("/api/tasks/pending"))
            .query(&[("claim", claim)]);
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(response.json::<TaskList>().await?.tasks)
    }

    /// `None` when another client got there first.
    pub async fn claim(&self, id: &Uuid) -> ClientResult<Option<TaskEnvelope>> {
        let request = self.http.post(self.url(&format!("/api/tasks/{id}/claim")));
        let response = self.authorized(request).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(None);
        }
        let response = Self::check(response).await?;
        Ok(Some(response.json::<ClaimReply>().await?.task))
    }

    pub async fn submit(&self, submission: &ResultSubmission) -> ClientResult<SubmitStatus> {
        let request = self.http.post(self.url("/api/tool-result")).json(submission);
        let response = self.authorized(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SubmitStatus::UnknownCorrelationId);
        }
        let response = Self::check(response).await?;
        Ok(response.json::<SubmitReply>().await?.status)
    }

    pub async fn open_stream(&self) -> ClientResult<TaskStream> {
        let request = self
            .http
            .get(self.url("/api/task-stream"))
            .header(header::ACCEPT, "text/event-stream");
        let response = Self::check(self.authorized(request).send().await?).await?;
        Ok(TaskStream {
            body: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            queued: Vec::new(),
        })
    }
}

/// Event on the push stream, heartbeats already filtered out.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected(Value),
    Task(TaskEnvelope),
}

pub struct TaskStream {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    decoder: SseDecoder,
    queued: Vec<SseFrame>,
}

impl TaskStream {
    /// Next meaningful event, or `None` once the server closes the stream.
    pub async fn next_event(&mut self) -> ClientResult<Option<StreamEvent>> {
        loop {
            while !self.queued.is_empty() {
                let frame = self.queued.remove(0);
                if let Some(event) = decode_frame(frame)? {
                    return Ok(Some(event));
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.queued = self.decoder.push(&chunk),
                Some(Err(err)) => return Err(ClientError::Stream(err.to_string())),
                None => return Ok(None),
            }
        }
    }
}

fn decode_frame(frame: SseFrame) -> ClientResult<Option<StreamEvent>> {
    match frame {
        SseFrame::Comment(comment) => {
            debug!(comment, "stream heartbeat");
            Ok(None)
        }
        SseFrame::Event { event, data } => match event.as_str() {
            "connected" => Ok(Some(StreamEvent::Connected(serde_json::from_str(&data)?))),
            "task" => Ok(Some(StreamEvent::Task(serde_json::from_str(&data)?))),
            other => {
                debug!(event = other, "ignoring unknown stream event");
                Ok(None)
            }
        },
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_push_failures: u32,
    pub push_enabled: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(150),
            reconnect_delay: Duration::from_secs(1),
            max_push_failures: 3,
            push_enabled: true,
        }
    }
}

/// Client session: push first, pull once push has failed `max_push_failures` times in a row.
pub struct Worker<R> {
    client: BridgeClient,
    runner: R,
    session: DeliverySession,
    options: WorkerOptions,
}

impl<R: ScriptRunner> Worker<R> {
    pub fn new(client: BridgeClient, runner: R, options: WorkerOptions) -> Self {
        let session = if options.push_enabled {
            DeliverySession::new(options.max_push_failures)
        } else {
            DeliverySession::pull_only()
        };
        Self {
            client,
            runner,
            session,
            options,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.session.mode()
    }

    /// Runs until the surrounding task is cancelled.
    pub async fn run(&mut self) {
        while self.session.uses_push() {
            match self.run_push().await {
                Ok(()) => warn!("task stream closed by server"),
                Err(err) => warn!("task stream failed: {err}"),
            }
            if self.session.on_push_failure() == DeliveryMode::PullFallback {
                break;
            }
            sleep(self.options.reconnect_delay).await;
        }

        info!(interval_ms = self.options.poll_interval.as_millis() as u64, "polling for pending tasks");
        loop {
            if let Err(err) = self.poll_once().await {
                warn!("pending query failed: {err}");
            }
            sleep(self.options.poll_interval).await;
        }
    }

    async fn run_push(&mut self) -> ClientResult<()> {
        let mut stream = self.client.open_stream().await?;
        while let Some(event) = stream.next_event().await? {
            match event {
                StreamEvent::Connected(info) => {
                    self.session.on_push_connected();
                    info!(
                        heartbeat_secs = info["heartbeatSecs"].as_u64(),
                        server_poll_ms = info["pollIntervalMs"].as_u64(),
                        "task stream connected"
                    );
                }
                StreamEvent::Task(task) => {
                    if let Some(task) = self.client.claim(&task.correlation_id).await? {
                        self.execute(task).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Claims every pending task and runs them in order. Returns how many ran.
    pub async fn poll_once(&self) -> ClientResult<usize> {
        let tasks = self.client.pending(true).await?;
        let count = tasks.len();
        for task in tasks {
            self.execute(task).await;
        }
        Ok(count)
    }

    async fn execute(&self, task: TaskEnvelope) {
        info!(correlation_id = %task.correlation_id, target = %task.target, "executing task");
        let report = self.runner.run(&task).await;
        let submission = submission_for(&task, report);

        match self.client.submit(&submission).await {
            Ok(SubmitStatus::Accepted) => {
                debug!(correlation_id = %task.correlation_id, "result accepted")
            }
            Ok(status) => {
                warn!(correlation_id = %task.correlation_id, status = status.as_str(), "result not recorded")
            }
            Err(err) => warn!(correlation_id = %task.correlation_id, "failed to submit result: {err}"),
        }
    }
}

pub fn submission_for(task: &TaskEnvelope, report: RunReport) -> ResultSubmission {
    ResultSubmission {
        correlation_id: task.correlation_id.to_string(),
        success: report.success,
        data: report.data,
        error: report.error,
    }
}
