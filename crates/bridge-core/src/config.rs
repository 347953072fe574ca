use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RESULT_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_TASK_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u32 = 3;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 150;
pub const DEFAULT_PUSH_RECONNECT_ATTEMPTS: u32 = 3;

/// Runtime knobs of the bridge. Every field has a default so a partial `[bridge]`
/// table in the server config is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub result_timeout_secs: u64,
    /// Milliseconds override for `result_timeout_secs`, mostly useful in tests.
    pub result_timeout_ms: Option<u64>,
    pub task_ttl_secs: u64,
    pub max_repair_attempts: u32,
    pub heartbeat_secs: u64,
    pub poll_interval_ms: u64,
    pub push_reconnect_attempts: u32,
    pub fallback_poll_ms: u64,
    pub task_buffer: usize,
    pub gate: GateThresholds,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            result_timeout_secs: DEFAULT_RESULT_TIMEOUT_SECS,
            result_timeout_ms: None,
            task_ttl_secs: DEFAULT_TASK_TTL_SECS,
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            push_reconnect_attempts: DEFAULT_PUSH_RECONNECT_ATTEMPTS,
            fallback_poll_ms: 100,
            task_buffer: 128,
            gate: GateThresholds::default(),
        }
    }
}

impl BridgeConfig {
    pub fn result_timeout(&self) -> Duration {
        match self.result_timeout_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs(self.result_timeout_secs),
        }
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_poll_ms.max(10))
    }
}

/// Size limits applied by the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub warn_lines: usize,
    pub warn_mutations: usize,
    pub block_lines: usize,
    pub block_mutations: usize,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            warn_lines: 30,
            warn_mutations: 5,
            block_lines: 80,
            block_mutations: 15,
        }
    }
}
