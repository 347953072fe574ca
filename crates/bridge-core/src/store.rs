use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::types::{ExecutionTask, TaskStatus};

/// Outcome of recording a terminal status on a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    AlreadyResolved,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub executing: usize,
    pub resolved: usize,
}

/// In-flight execution requests keyed by correlation id.
///
/// Every operation takes the single map lock for its whole duration, so each one is
/// linearizable per key and the status transitions stay monotonic.
#[derive(Default)]
pub struct CorrelationStore {
    tasks: Mutex<HashMap<Uuid, ExecutionTask>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, ExecutionTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new task. A correlation id collision is logged and refused, never overwritten.
    pub fn enqueue(&self, task: ExecutionTask) -> bool {
        let mut tasks = self.tasks();
        if tasks.contains_key(&task.correlation_id) {
            error!(
                correlation_id = %task.correlation_id,
                "correlation id collision, refusing to overwrite in-flight task"
            );
            return false;
        }
        debug!(correlation_id = %task.correlation_id, target = %task.target, "task enqueued");
        tasks.insert(task.correlation_id, task);
        true
    }

    /// Moves a task from `pending` to `executing`. Returns false when the task is unknown
    /// or was already claimed, which lets exactly one client take it.
    pub fn mark_executing(&self, id: &Uuid) -> bool {
        let mut tasks = self.tasks();
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Executing;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<ExecutionTask> {
        self.tasks().get(id).cloned()
    }

    pub fn resolve(&self, id: &Uuid, success: bool) -> ResolveOutcome {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(id) else {
            return ResolveOutcome::Unknown;
        };
        if task.status.is_terminal() {
            return ResolveOutcome::AlreadyResolved;
        }
        task.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        ResolveOutcome::Resolved
    }

    pub fn remove(&self, id: &Uuid) -> Option<ExecutionTask> {
        self.tasks().remove(id)
    }

    /// Tasks still waiting for a client, oldest first.
    pub fn list_pending(&self) -> Vec<ExecutionTask> {
        let mut pending: Vec<_> = self
            .tasks()
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|task| task.created_at);
        pending
    }

    /// Drops every task older than `ttl`, whatever its status.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let Some(threshold) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };

        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|_, task| task.created_at > threshold);
        before - tasks.len()
    }

    pub fn counts(&self) -> StoreCounts {
        let tasks = self.tasks();
        let mut counts = StoreCounts::default();
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Executing => counts.executing += 1,
                TaskStatus::Completed | TaskStatus::Failed => counts.resolved += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
