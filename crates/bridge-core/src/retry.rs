use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Content hash of a script, used to scope retry budgets and dedupe dispatches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(script: &str) -> Self {
        Self(hex::encode(Sha256::digest(script.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDecision {
    pub allowed: bool,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Bounded repair budget per script fingerprint.
pub struct RetryCoordinator {
    max_attempts: u32,
    counters: Mutex<HashMap<Fingerprint, u32>>,
}

impl RetryCoordinator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<Fingerprint, u32>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Success clears the counter, a failure bumps it.
    pub fn record_outcome(&self, fingerprint: &Fingerprint, success: bool) {
        let mut counters = self.counters();
        if success {
            if counters.remove(fingerprint).is_some() {
                debug!(fingerprint = %fingerprint.short(), "retry counter cleared after success");
            }
            return;
        }
        let count = counters.entry(fingerprint.clone()).or_insert(0);
        *count += 1;
        debug!(fingerprint = %fingerprint.short(), attempts = *count, "failure recorded");
    }

    /// Whether another repair cycle may run. Once the budget is spent the entry is
    /// dropped, so a later unrelated cycle for the same text starts from scratch.
    pub fn should_retry(&self, fingerprint: &Fingerprint) -> RetryDecision {
        let mut counters = self.counters();
        let attempt = counters.get(fingerprint).copied().unwrap_or(0);
        let allowed = attempt <= self.max_attempts;
        if allowed {
            info!(
                fingerprint = %fingerprint.short(),
                attempt,
                max = self.max_attempts,
                "repair attempt allowed"
            );
        } else {
            counters.remove(fingerprint);
            warn!(
                fingerprint = %fingerprint.short(),
                attempts = attempt,
                "repair budget exhausted"
            );
        }
        RetryDecision {
            allowed,
            attempt,
            max_attempts: self.max_attempts,
        }
    }

    pub fn attempts(&self, fingerprint: &Fingerprint) -> u32 {
        self.counters().get(fingerprint).copied().unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.counters().len()
    }
}
