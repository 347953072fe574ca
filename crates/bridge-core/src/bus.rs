use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::ExecutionResult;

/// What happened to a submitted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiter was registered and has been woken.
    Notified,
    /// Nobody was listening; the result sits in the backup cache.
    Cached,
    /// A result for this id was already recorded; the submission was ignored.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
}

#[derive(Default)]
struct BusState {
    waiters: HashMap<Uuid, oneshot::Sender<ExecutionResult>>,
    cache: HashMap<Uuid, ExecutionResult>,
}

/// One-shot, per-correlation-id wakeups with a backup result cache.
///
/// `submit` always writes the cache before firing the waiter, so a waiter that lost its
/// notification (or subscribed late) still finds the result by polling the cache.
#[derive(Clone, Default)]
pub struct ResultBus {
    state: Arc<Mutex<BusState>>,
    poll_every: Option<Duration>,
}

impl ResultBus {
    pub fn new(fallback_poll: Duration) -> Self {
        Self {
            state: Arc::default(),
            poll_every: Some(fallback_poll),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the single waiter for `id`. The returned handle unregisters itself when dropped.
    pub fn subscribe(&self, id: Uuid) -> ResultWaiter {
        let (sender, receiver) = oneshot::channel();
        if self.state().waiters.insert(id, sender).is_some() {
            warn!(correlation_id = %id, "replacing an existing result waiter");
        }
        ResultWaiter {
            id,
            receiver,
            bus: self.clone(),
        }
    }

    pub async fn await_result(
        &self,
        id: Uuid,
        timeout: Duration,
    ) -> Result<ExecutionResult, WaitError> {
        self.subscribe(id).wait(timeout).await
    }

    pub fn submit(&self, id: Uuid, result: ExecutionResult) -> Delivery {
        let mut state = self.state();
        if state.cache.contains_key(&id) {
            return Delivery::Duplicate;
        }
        state.cache.insert(id, result.clone());

        match state.waiters.remove(&id) {
            Some(sender) => match sender.send(result) {
                Ok(()) => Delivery::Notified,
                Err(_) => {
                    debug!(correlation_id = %id, "waiter went away before notification");
                    Delivery::Cached
                }
            },
            None => Delivery::Cached,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ExecutionResult> {
        self.state().cache.get(id).cloned()
    }

    pub fn take(&self, id: &Uuid) -> Option<ExecutionResult> {
        self.state().cache.remove(id)
    }

    pub fn has_waiter(&self, id: &Uuid) -> bool {
        self.state().waiters.contains_key(id)
    }

    pub fn waiter_count(&self) -> usize {
        self.state().waiters.len()
    }

    pub fn cached_count(&self) -> usize {
        self.state().cache.len()
    }

    /// Purges cached results older than `ttl`.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let Some(threshold) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let mut state = self.state();
        let before = state.cache.len();
        state.cache.retain(|_, result| result.timestamp > threshold);
        before - state.cache.len()
    }

    fn unregister(&self, id: &Uuid) {
        let mut state = self.state();
        if let Some(sender) = state.waiters.get(id) {
            if sender.is_closed() {
                state.waiters.remove(id);
            }
        }
    }
}

/// A registered interest in one correlation id.
pub struct ResultWaiter {
    id: Uuid,
    receiver: oneshot::Receiver<ExecutionResult>,
    bus: ResultBus,
}

impl ResultWaiter {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the notification, the cache, or the deadline, whichever comes first.
    pub async fn wait(mut self, timeout: Duration) -> Result<ExecutionResult, WaitError> {
        if let Some(result) = self.bus.get(&self.id) {
            return Ok(result);
        }

        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let mut poll = interval(self.bus.poll_every.unwrap_or(Duration::from_millis(100)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut notifier_open = true;
        loop {
            tokio::select! {
                received = &mut self.receiver, if notifier_open => {
                    match received {
                        Ok(result) => return Ok(result),
                        Err(_) => notifier_open = false,
                    }
                }
                _ = poll.tick() => {
                    if let Some(result) = self.bus.get(&self.id) {
                        return Ok(result);
                    }
                }
                _ = &mut deadline => {
                    return match self.bus.get(&self.id) {
                        Some(result) => Ok(result),
                        None => Err(WaitError::Timeout),
                    };
                }
            }
        }
    }
}

impl Drop for ResultWaiter {
    fn drop(&mut self) {
        self.receiver.close();
        self.bus.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> ResultBus {
        ResultBus::new(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn submit_wakes_registered_waiter() {
        let bus = bus();
        let id = Uuid::new_v4();
        let waiter = bus.subscribe(id);

        let submitter = bus.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            submitter.submit(id, ExecutionResult::succeeded(Some(json!({"ok": 1}))));
        });

        let result = waiter.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.data, Some(json!({"ok": 1})));
        assert!(!bus.has_waiter(&id));
    }

    #[tokio::test]
    async fn timeout_leaves_no_registered_waiter() {
        let bus = bus();
        let id = Uuid::new_v4();

        let outcome = bus.await_result(id, Duration::from_millis(20)).await;
        assert_eq!(outcome, Err(WaitError::Timeout));
        assert!(!bus.has_waiter(&id));
        assert_eq!(bus.waiter_count(), 0);
    }

    #[tokio::test]
    async fn late_subscriber_reads_backup_cache() {
        let bus = bus();
        let id = Uuid::new_v4();
        assert_eq!(
            bus.submit(id, ExecutionResult::succeeded(None)),
            Delivery::Cached
        );

        let result = bus.await_result(id, Duration::from_millis(50)).await.unwrap();
        assert!(result.success);
    }

    #[test]
    fn second_submission_is_ignored() {
        let bus = bus();
        let id = Uuid::new_v4();
        bus.submit(id, ExecutionResult::succeeded(Some(json!(1))));
        assert_eq!(
            bus.submit(id, ExecutionResult::succeeded(Some(json!(2)))),
            Delivery::Duplicate
        );
        assert_eq!(bus.get(&id).unwrap().data, Some(json!(1)));
    }

    #[test]
    fn sweep_purges_stale_results() {
        let bus = bus();
        let mut old = ExecutionResult::succeeded(None);
        old.timestamp = Utc::now() - chrono::Duration::minutes(6);
        bus.submit(Uuid::new_v4(), old);
        bus.submit(Uuid::new_v4(), ExecutionResult::succeeded(None));

        assert_eq!(bus.sweep_expired(Duration::from_secs(300)), 1);
        assert_eq!(bus.cached_count(), 1);
    }
}
