//! The bridge facade: gate, store, transport, bus, classifier and retry wired together.
//!
//! One [`Bridge`] owns every process-wide store. Transports (stdio, HTTP) hold an
//! `Arc<Bridge>` and never keep state of their own, so re-creating a transport keeps
//! every in-flight task, cached result and retry counter.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Delivery, ResultBus};
use crate::classify::{classify, classify_missing};
use crate::config::BridgeConfig;
use crate::delivery::TaskHub;
use crate::error::{BridgeError, BridgeResult};
use crate::feedback::{build_feedback, build_terminal_report, build_timeout_report, EnvironmentContext};
use crate::gate::{Assessment, GateLevel, RiskGate};
use crate::retry::{Fingerprint, RetryCoordinator};
use crate::store::{CorrelationStore, ResolveOutcome, StoreCounts};
use crate::types::{
    ErrorKind, ExecuteRequest, ExecutionError, ExecutionResult, ExecutionTask, HostTarget,
    ResultSubmission, SubmitStatus,
};

static SHARED: OnceCell<Arc<Bridge>> = OnceCell::new();

const READ_VERBS: [&str; 6] = ["read", "get", "fetch", "list", "inspect", "show"];

/// What the orchestrator gets back from one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success {
        data: Option<Value>,
        advisories: Vec<String>,
        reminder: Option<String>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        code: Option<String>,
        remediation: Option<String>,
        attempt: Option<u32>,
        max_attempts: u32,
        terminal: bool,
    },
    Blocked {
        issues: Vec<String>,
        guidance: String,
    },
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success { .. })
    }

    pub fn to_json(&self) -> Value {
        match self {
            ToolOutcome::Success {
                data,
                advisories,
                reminder,
            } => {
                let mut body = json!({ "success": true });
                if let Some(data) = data {
                    body["data"] = data.clone();
                }
                if !advisories.is_empty() {
                    body["advisories"] = json!(advisories);
                }
                if let Some(reminder) = reminder {
                    body["reminder"] = json!(reminder);
                }
                body
            }
            ToolOutcome::Failure {
                kind,
                message,
                code,
                remediation,
                attempt,
                max_attempts,
                terminal,
            } => {
                let mut body = json!({
                    "success": false,
                    "kind": kind,
                    "message": message,
                    "terminal": terminal,
                });
                if let Some(code) = code {
                    body["code"] = json!(code);
                }
                if let Some(remediation) = remediation {
                    body["remediation"] = json!(remediation);
                }
                if let Some(attempt) = attempt {
                    body["attempt"] = json!(attempt);
                    body["maxAttempts"] = json!(max_attempts);
                }
                body
            }
            ToolOutcome::Blocked { issues, guidance } => json!({
                "success": false,
                "status": "blocked",
                "issues": issues,
                "guidance": guidance,
            }),
        }
    }

    /// Text rendering handed to the orchestrator as tool content.
    pub fn render_text(&self) -> String {
        match self {
            ToolOutcome::Success {
                data,
                advisories,
                reminder,
            } => {
                let mut out = String::from("Execution succeeded.");
                if let Some(data) = data {
                    let rendered =
                        serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
                    let _ = write!(out, "\n\nReturned data:\n```json\n{rendered}\n```");
                }
                if let Some(reminder) = reminder {
                    let _ = write!(out, "\n\n{reminder}");
                }
                if !advisories.is_empty() {
                    out.push_str("\n\nAdvisories:");
                    for advisory in advisories {
                        let _ = write!(out, "\n- {advisory}");
                    }
                }
                out
            }
            ToolOutcome::Failure {
                message,
                remediation,
                ..
            } => remediation.clone().unwrap_or_else(|| message.clone()),
            ToolOutcome::Blocked { guidance, .. } => guidance.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub tasks: usize,
    pub results: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub tasks: StoreCounts,
    pub push_subscribers: usize,
    pub waiters: usize,
    pub cached_results: usize,
    pub retry_tracked: usize,
    pub inflight_scripts: usize,
    pub max_repair_attempts: u32,
}

type InflightKey = (HostTarget, Fingerprint);
type InflightMap = HashMap<InflightKey, InflightSlot>;

struct InflightSlot {
    token: Uuid,
    outcome: watch::Receiver<Option<ToolOutcome>>,
    /// Correlation id once dispatched. Whoever takes the slot over waits on it instead of
    /// dispatching the script a second time.
    task: Option<Uuid>,
}

pub struct Bridge {
    config: BridgeConfig,
    store: Arc<CorrelationStore>,
    bus: ResultBus,
    hub: TaskHub,
    gate: RiskGate,
    retry: RetryCoordinator,
    inflight: Arc<Mutex<InflightMap>>,
}

enum Slot {
    Leader {
        guard: InflightGuard,
        resume: Option<Uuid>,
    },
    Follower(watch::Receiver<Option<ToolOutcome>>),
}

/// Publishing side of an in-flight script. A leader dropped before publishing keeps its
/// dispatched task in the slot, so the next caller for the same script resumes that task.
struct InflightGuard {
    key: InflightKey,
    token: Uuid,
    sender: watch::Sender<Option<ToolOutcome>>,
    slots: Arc<Mutex<InflightMap>>,
    published: bool,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let store = Arc::new(CorrelationStore::new());
        let hub = TaskHub::new(store.clone(), config.task_buffer);
        Self {
            bus: ResultBus::new(config.fallback_poll_interval()),
            gate: RiskGate::new(Default::default(), config.gate),
            retry: RetryCoordinator::new(config.max_repair_attempts),
            inflight: Arc::default(),
            store,
            hub,
            config,
        }
    }

    pub fn with_gate(mut self, gate: RiskGate) -> Self {
        self.gate = gate;
        self
    }

    /// The process-wide bridge. The first caller's config wins.
    pub fn shared(config: BridgeConfig) -> Arc<Bridge> {
        SHARED
            .get_or_init(|| {
                info!("initialising process-wide bridge");
                Arc::new(Bridge::new(config))
            })
            .clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &CorrelationStore {
        &self.store
    }

    pub fn bus(&self) -> &ResultBus {
        &self.bus
    }

    pub fn hub(&self) -> &TaskHub {
        &self.hub
    }

    pub fn gate(&self) -> &RiskGate {
        &self.gate
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    fn inflight(&self) -> MutexGuard<'_, InflightMap> {
        lock_slots(&self.inflight)
    }

    /// Tool-call entry point. Suspends until a client reports, the deadline passes or
    /// the gate refuses the script.
    pub async fn execute(&self, request: ExecuteRequest) -> BridgeResult<ToolOutcome> {
        if request.target.is_empty() {
            return Err(BridgeError::InvalidRequest("target must not be empty".into()));
        }
        if request.script.trim().is_empty() {
            return Err(BridgeError::InvalidRequest("script must not be empty".into()));
        }

        self.sweep();

        let assessment = self.gate.assess(&request.script);
        match assessment.level {
            GateLevel::Block => {
                warn!(
                    target = %request.target,
                    lines = assessment.metrics.lines,
                    mutations = assessment.metrics.mutation_calls,
                    "script blocked by gate"
                );
                return Ok(ToolOutcome::Blocked {
                    guidance: self.gate.block_guidance(&assessment),
                    issues: assessment.issues,
                });
            }
            GateLevel::Warn => {
                warn!(target = %request.target, issues = ?assessment.issues, "script passed gate with warnings");
            }
            GateLevel::Ok => {}
        }

        let key = (request.target.clone(), Fingerprint::of(&request.script));
        loop {
            match self.join_inflight(&key) {
                Slot::Leader { guard, resume } => {
                    let outcome = self
                        .dispatch_and_wait(&request, &key.1, &assessment, &guard, resume)
                        .await?;
                    guard.publish(outcome.clone());
                    return Ok(outcome);
                }
                Slot::Follower(mut receiver) => {
                    debug!(fingerprint = %key.1.short(), "attaching to in-flight dispatch");
                    if let Ok(outcome) = receiver.wait_for(Option::is_some).await {
                        if let Some(outcome) = outcome.clone() {
                            return Ok(outcome);
                        }
                    }
                    // leader went away without an outcome; take over its task
                }
            }
        }
    }

    fn join_inflight(&self, key: &InflightKey) -> Slot {
        let mut inflight = self.inflight();
        let resume = match inflight.get(key) {
            Some(slot) if slot.outcome.has_changed().is_ok() => {
                return Slot::Follower(slot.outcome.clone());
            }
            Some(slot) => slot.task,
            None => None,
        };
        let token = Uuid::new_v4();
        let (sender, outcome) = watch::channel(None);
        inflight.insert(
            key.clone(),
            InflightSlot {
                token,
                outcome,
                task: resume,
            },
        );
        Slot::Leader {
            guard: InflightGuard {
                key: key.clone(),
                token,
                sender,
                slots: self.inflight.clone(),
                published: false,
            },
            resume,
        }
    }

    async fn dispatch_and_wait(
        &self,
        request: &ExecuteRequest,
        fingerprint: &Fingerprint,
        assessment: &Assessment,
        guard: &InflightGuard,
        resume: Option<Uuid>,
    ) -> BridgeResult<ToolOutcome> {
        let resumable =
            resume.filter(|id| self.store.get(id).is_some() || self.bus.get(id).is_some());
        let (id, waiter) = match resumable {
            Some(id) => {
                info!(correlation_id = %id, "resuming dispatch abandoned by an earlier caller");
                (id, self.bus.subscribe(id))
            }
            None => {
                let task = ExecutionTask::new(
                    request.target.clone(),
                    request.script.clone(),
                    request.description.clone(),
                );
                let id = task.correlation_id;

                // subscribe before the task becomes visible so no result can slip past
                let waiter = self.bus.subscribe(id);
                if !self.store.enqueue(task.clone()) {
                    return Err(BridgeError::Internal(format!(
                        "correlation id {id} is already in flight"
                    )));
                }
                guard.record_task(id);
                self.hub.dispatch(&task);
                (id, waiter)
            }
        };

        let timeout = self.config.result_timeout();
        let result = match waiter.wait(timeout).await {
            Ok(result) => result,
            Err(_) => {
                self.store.remove(&id);
                warn!(correlation_id = %id, timeout_ms = timeout.as_millis() as u64, "no result before deadline");
                return Ok(ToolOutcome::Failure {
                    kind: ErrorKind::Timeout,
                    message: format!("Execution timed out after {timeout:?}"),
                    code: None,
                    remediation: Some(build_timeout_report(timeout)),
                    attempt: None,
                    max_attempts: self.retry.max_attempts(),
                    terminal: false,
                });
            }
        };

        self.store.remove(&id);
        Ok(self.conclude(request, fingerprint, assessment, result))
    }

    fn conclude(
        &self,
        request: &ExecuteRequest,
        fingerprint: &Fingerprint,
        assessment: &Assessment,
        result: ExecutionResult,
    ) -> ToolOutcome {
        if result.success {
            self.retry.record_outcome(fingerprint, true);
            let reminder = match (&result.data, request.description.as_deref()) {
                (Some(_), _) => None,
                (None, Some(description)) if describes_read(description) => Some(
                    "This was a read operation but no data was returned. Return the values after context.sync() (e.g. `return range.values`) and call the tool again."
                        .to_string(),
                ),
                (None, _) => Some(
                    "No data was returned. To hand read values back, return them after context.sync() (e.g. `return { values: range.values }`)."
                        .to_string(),
                ),
            };
            return ToolOutcome::Success {
                data: result.data,
                advisories: assessment.advisories(),
                reminder,
            };
        }

        let error = result.error.unwrap_or_else(classify_missing);
        let max_attempts = self.retry.max_attempts();
        if !error.kind.is_retryable() {
            return failure(error, None, None, max_attempts, false);
        }

        self.retry.record_outcome(fingerprint, false);
        let decision = self.retry.should_retry(fingerprint);
        if decision.allowed {
            let environment = EnvironmentContext::for_target(request.target.clone());
            let remediation = build_feedback(
                &error,
                &request.script,
                decision.attempt,
                max_attempts,
                Some(&environment),
            );
            failure(error, Some(remediation), Some(decision.attempt), max_attempts, false)
        } else {
            warn!(fingerprint = %fingerprint.short(), kind = %error.kind, "repair attempts exhausted");
            let report = build_terminal_report(&error, max_attempts);
            failure(
                ExecutionError {
                    message: report,
                    ..error
                },
                None,
                Some(decision.attempt),
                max_attempts,
                true,
            )
        }
    }

    /// Result-submission entry point.
    pub fn submit(&self, submission: ResultSubmission) -> BridgeResult<SubmitStatus> {
        let id = Uuid::parse_str(submission.correlation_id.trim())
            .map_err(|_| BridgeError::InvalidCorrelationId(submission.correlation_id.clone()))?;

        let result = if submission.success {
            ExecutionResult::succeeded(submission.data)
        } else {
            let error = match submission.error.as_ref() {
                Some(raw) => classify(raw),
                None => classify_missing(),
            };
            ExecutionResult::failed(error)
        };

        match self.store.resolve(&id, result.success) {
            ResolveOutcome::Resolved => {
                if self.bus.submit(id, result) == Delivery::Duplicate {
                    warn!(correlation_id = %id, "result cache already held an entry");
                }
                info!(correlation_id = %id, success = submission.success, "result accepted");
                Ok(SubmitStatus::Accepted)
            }
            ResolveOutcome::AlreadyResolved => {
                warn!(correlation_id = %id, "stale result submission ignored");
                Ok(SubmitStatus::Stale)
            }
            ResolveOutcome::Unknown if self.bus.get(&id).is_some() => {
                warn!(correlation_id = %id, "stale result submission ignored");
                Ok(SubmitStatus::Stale)
            }
            ResolveOutcome::Unknown => {
                warn!(correlation_id = %id, "result for unknown correlation id");
                Ok(SubmitStatus::UnknownCorrelationId)
            }
        }
    }

    /// Drops tasks and cached results older than the TTL.
    pub fn sweep(&self) -> SweepReport {
        let ttl = self.config.task_ttl();
        let report = SweepReport {
            tasks: self.store.sweep_expired(ttl),
            results: self.bus.sweep_expired(ttl),
        };
        // abandoned slots live only as long as their task
        self.inflight().retain(|_, slot| {
            slot.outcome.has_changed().is_ok()
                || slot
                    .task
                    .is_some_and(|id| self.store.get(&id).is_some() || self.bus.get(&id).is_some())
        });
        if report != SweepReport::default() {
            debug!(tasks = report.tasks, results = report.results, "expired entries swept");
        }
        report
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            tasks: self.store.counts(),
            push_subscribers: self.hub.subscriber_count(),
            waiters: self.bus.waiter_count(),
            cached_results: self.bus.cached_count(),
            retry_tracked: self.retry.tracked(),
            inflight_scripts: self.inflight().len(),
            max_repair_attempts: self.retry.max_attempts(),
        }
    }
}

impl InflightGuard {
    fn record_task(&self, id: Uuid) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.key) {
            if slot.token == self.token {
                slot.task = Some(id);
            }
        }
    }

    fn publish(mut self, outcome: ToolOutcome) {
        self.sender.send_replace(Some(outcome));
        self.published = true;
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        let Some(slot) = slots.get(&self.key) else {
            return;
        };
        if slot.token != self.token {
            return;
        }
        let task = slot.task;
        match task {
            Some(id) if !self.published => {
                debug!(correlation_id = %id, "dispatching caller went away, task kept for takeover");
            }
            _ => {
                slots.remove(&self.key);
            }
        }
    }
}

fn lock_slots(slots: &Mutex<InflightMap>) -> MutexGuard<'_, InflightMap> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failure(
    error: ExecutionError,
    remediation: Option<String>,
    attempt: Option<u32>,
    max_attempts: u32,
    terminal: bool,
) -> ToolOutcome {
    ToolOutcome::Failure {
        kind: error.kind,
        message: error.message,
        code: error.code,
        remediation,
        attempt,
        max_attempts,
        terminal,
    }
}

fn describes_read(description: &str) -> bool {
    let lowered = description.to_ascii_lowercase();
    lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| READ_VERBS.contains(&word))
}
