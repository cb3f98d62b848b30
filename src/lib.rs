//! conductor - Durable task orchestration engine
//!
//! Runs long-lived processes made of remote steps: retried calls,
//! poll-until-complete operations, human approval gates and a fixed
//! five-stage plan with a concurrent fan-out.
//!
//! # Architecture
//!
//! - Every process is registered under an idempotency key; resubmitting a
//!   key returns the existing instance and never re-executes a step
//! - One task drives each process and is the only writer of its state
//! - Queries read published snapshots and never block the process
//! - Signals (approve, reject, cancel) are delivered through a mailbox
//! - An optional JSONL journal records what happened, for audit
//!
//! # Modules
//!
//! - `adapters`: Remote step interfaces, HTTP and simulated services
//! - `core`: Retry, polling, approval gate, orchestrator, registry, engine
//! - `domain`: Data structures (ProcessInstance, StepResult, events)
//! - `config`: Config file and environment resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the five-stage plan with asynchronous settlement
//! conductor orchestrate user-42 --async-payment --poll-interval-ms 2000
//!
//! # Submit an approval request and approve it after five seconds
//! conductor approval req-7 --details "New laptop for the team" --after-secs 5
//!
//! # Show the journal of a process
//! conductor history orchestration-user-42
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Engine, EngineSettings, OrchestrationRequest, ProcessError, Services};
pub use domain::{
    ApprovalRequest, ProcessEvent, ProcessInstance, ProcessKind, ProcessStatus, StepResult,
};
