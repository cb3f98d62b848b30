//! Core orchestration logic.
//!
//! This module contains:
//! - Retry: RetryPolicy and the StepInvoker that applies it
//! - Poller: poll-until-complete for long-running operations
//! - Approval: the human-in-the-loop approval gate
//! - Orchestrator: the five-stage plan
//! - Registry: idempotency-key registry of process instances
//! - Journal: append-only audit trail of process events
//! - Engine: submission, signalling and queries

pub mod approval;
pub mod engine;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod poller;
pub mod registry;
pub mod retry;

// Re-export commonly used types
pub use approval::{
    validate_request, ApprovalConfig, ApprovalGate, ApprovalSnapshot, GateHandle, GateSignal,
    GateStatus, SignalReceipt,
};
pub use engine::{Engine, EngineSettings, ResultQuery, Services, Submission};
pub use error::{ProcessError, StageFailure};
pub use journal::{hash_input, EventSink, Journal};
pub use orchestrator::{OrchestrationPlan, OrchestrationRequest, Orchestrator};
pub use poller::{AsyncPoller, PollConfig};
pub use registry::{derive_key, ProcessEntry, ProcessRegistry, ProcessWriter};
pub use retry::{PolicyError, RetryPolicy, StepInvoker};
