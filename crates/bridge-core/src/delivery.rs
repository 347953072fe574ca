use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::CorrelationStore;
use crate::types::{ExecutionTask, TaskEnvelope};

/// Fan-out of dispatched tasks to push subscribers, backed by the correlation store for
/// pull clients. A task that reaches no subscriber stays discoverable via `list_pending`.
#[derive(Clone)]
pub struct TaskHub {
    sender: broadcast::Sender<TaskEnvelope>,
    store: Arc<CorrelationStore>,
}

impl TaskHub {
    pub fn new(store: Arc<CorrelationStore>, buffer: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(buffer.max(1));
        Self { sender, store }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Best-effort push. Returns how many stream subscribers received the event.
    pub fn dispatch(&self, task: &ExecutionTask) -> usize {
        match self.sender.send(task.envelope()) {
            Ok(receivers) => {
                info!(
                    correlation_id = %task.correlation_id,
                    target = %task.target,
                    receivers,
                    "task dispatched"
                );
                receivers
            }
            Err(_) => {
                debug!(
                    correlation_id = %task.correlation_id,
                    "no push subscribers, task left for pull clients"
                );
                0
            }
        }
    }

    pub fn list_pending(&self) -> Vec<TaskEnvelope> {
        self.store
            .list_pending()
            .iter()
            .map(ExecutionTask::envelope)
            .collect()
    }

    /// Takes one task for execution. `None` when it is unknown or already claimed.
    pub fn claim(&self, id: &Uuid) -> Option<TaskEnvelope> {
        if !self.store.mark_executing(id) {
            return None;
        }
        self.store.get(id).map(|task| task.envelope())
    }

    /// Claims every task still pending and returns the ones this caller won.
    pub fn claim_pending(&self) -> Vec<TaskEnvelope> {
        self.store
            .list_pending()
            .into_iter()
            .filter(|task| self.store.mark_executing(&task.correlation_id))
            .map(|task| task.envelope())
            .collect()
    }
}

/// Delivery mode of one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    PushActive,
    /// Consecutive push failures seen so far.
    PushReconnecting(u32),
    PullFallback,
}

/// Push/pull failover state machine. `PullFallback` is terminal for the session.
#[derive(Debug, Clone)]
pub struct DeliverySession {
    mode: DeliveryMode,
    max_reconnects: u32,
}

impl DeliverySession {
    pub fn new(max_reconnects: u32) -> Self {
        Self {
            mode: DeliveryMode::PushActive,
            max_reconnects,
        }
    }

    /// A session that never tries the push channel.
    pub fn pull_only() -> Self {
        Self {
            mode: DeliveryMode::PullFallback,
            max_reconnects: 0,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn uses_push(&self) -> bool {
        !matches!(self.mode, DeliveryMode::PullFallback)
    }

    pub fn on_push_connected(&mut self) -> DeliveryMode {
        if self.mode != DeliveryMode::PullFallback {
            if let DeliveryMode::PushReconnecting(failures) = self.mode {
                info!(failures, "push stream re-established");
            }
            self.mode = DeliveryMode::PushActive;
        }
        self.mode
    }

    pub fn on_push_failure(&mut self) -> DeliveryMode {
        self.mode = match self.mode {
            DeliveryMode::PullFallback => DeliveryMode::PullFallback,
            DeliveryMode::PushActive => DeliveryMode::PushReconnecting(1),
            DeliveryMode::PushReconnecting(failures) => DeliveryMode::PushReconnecting(failures + 1),
        };
        if let DeliveryMode::PushReconnecting(failures) = self.mode {
            if failures >= self.max_reconnects {
                warn!(failures, "push stream unavailable, switching to pull mode");
                self.mode = DeliveryMode::PullFallback;
            } else {
                warn!(failures, max = self.max_reconnects, "push stream failed, reconnecting");
            }
        }
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostTarget;

    fn hub() -> (TaskHub, Arc<CorrelationStore>) {
        let store = Arc::new(CorrelationStore::new());
        (TaskHub::new(store.clone(), 16), store)
    }

    #[test]
    fn dispatch_without_subscribers_keeps_task_pullable() {
        let (hub, store) = hub();
        let task = ExecutionTask::new(HostTarget::Word, "noop", None);
        store.enqueue(task.clone());

        assert_eq!(hub.dispatch(&task), 0);
        let pending = hub.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id, task.correlation_id);
    }

    #[tokio::test]
    async fn subscribers_receive_envelopes() {
        let (hub, store) = hub();
        let mut receiver = hub.subscribe();
        let task = ExecutionTask::new(HostTarget::Excel, "noop", Some("d".into()));
        store.enqueue(task.clone());

        assert_eq!(hub.dispatch(&task), 1);
        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope, task.envelope());
        // pushing does not claim
        assert_eq!(hub.list_pending().len(), 1);
    }

    #[test]
    fn a_task_is_claimed_once() {
        let (hub, store) = hub();
        let task = ExecutionTask::new(HostTarget::Word, "noop", None);
        let id = task.correlation_id;
        store.enqueue(task);

        assert!(hub.claim(&id).is_some());
        assert!(hub.claim(&id).is_none());
        assert!(hub.claim_pending().is_empty());
        assert!(hub.list_pending().is_empty());
    }

    #[test]
    fn three_push_failures_fall_back_to_pull_for_good() {
        let mut session = DeliverySession::new(3);
        assert_eq!(session.on_push_failure(), DeliveryMode::PushReconnecting(1));
        assert_eq!(session.on_push_failure(), DeliveryMode::PushReconnecting(2));
        assert_eq!(session.on_push_failure(), DeliveryMode::PullFallback);
        assert_eq!(session.on_push_connected(), DeliveryMode::PullFallback);
        assert!(!session.uses_push());
    }

    #[test]
    fn reconnect_resets_failure_count() {
        let mut session = DeliverySession::new(3);
        session.on_push_failure();
        session.on_push_failure();
        assert_eq!(session.on_push_connected(), DeliveryMode::PushActive);
        assert_eq!(session.on_push_failure(), DeliveryMode::PushReconnecting(1));
    }
}
