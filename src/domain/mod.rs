//! Domain types for the conductor.
//!
//! This module contains the core data structures:
//! - Process: instances, kinds, statuses and typed outputs
//! - Outcome: step results and the ordered aggregate of a plan
//! - Approval: requests, decisions and recorded decision state
//! - Payment: tracking entries for asynchronous payments
//! - Events: journal records

pub mod approval;
pub mod events;
pub mod outcome;
pub mod payment;
pub mod process;

// Re-export commonly used types
pub use approval::{ActionExecution, ApprovalOutcome, ApprovalRequest, ApprovalState, Decision};
pub use events::{EventType, ProcessEvent};
pub use outcome::{AggregateResult, BusinessOutcome, Stage, StageOutput, StepResult};
pub use payment::{PaymentState, PaymentTrackingEntry};
pub use process::{
    AlreadyTerminal, FailureReport, ProcessInstance, ProcessKind, ProcessOutput, ProcessStatus,
};
