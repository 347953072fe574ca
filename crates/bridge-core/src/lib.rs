//! Remote execution bridge: hands scripts from an orchestrator to a remote document host,
//! waits for the outcome and drives a bounded repair loop on failure.

pub mod bridge;
pub mod bus;
pub mod classify;
pub mod config;
pub mod delivery;
pub mod error;
pub mod feedback;
pub mod gate;
pub mod retry;
pub mod store;
pub mod types;

pub use bridge::{Bridge, BridgeStatus, SweepReport, ToolOutcome};
pub use bus::{Delivery, ResultBus, ResultWaiter, WaitError};
pub use classify::classify;
pub use config::{BridgeConfig, GateThresholds};
pub use delivery::{DeliveryMode, DeliverySession, TaskHub};
pub use error::{BridgeError, BridgeResult};
pub use gate::{Assessment, GateLevel, RiskGate, RiskPolicy, RiskRule, Severity};
pub use retry::{Fingerprint, RetryCoordinator, RetryDecision};
pub use store::{CorrelationStore, ResolveOutcome, StoreCounts};
pub use types::{
    ErrorKind, ExecuteRequest, ExecutionError, ExecutionResult, ExecutionTask, HostTarget,
    ResultSubmission, SubmitStatus, TaskEnvelope, TaskStatus,
};
