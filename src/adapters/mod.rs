//! Interfaces to remote step operations.
//!
//! Every remote call the conductor makes goes through one of these traits.
//! Implementations must be safe to invoke more than once for one logical
//! step, since retry policies may repeat a call.

pub mod http;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ApprovalRequest, Decision, StageOutput};

pub use http::{HttpServiceConfig, HttpServices, HttpStepOperation};
pub use simulated::{
    ErrorInjector, Latency, SimulatedApprovalDesk, SimulatedGreeter, SimulatedPaymentGateway,
    SimulatedService,
};

/// Input handed to every orchestration step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInput {
    pub process_id: String,

    /// Who the plan runs for (e.g. a user id)
    pub subject: String,

    pub amount_cents: u64,

    /// Outputs of the stages that already finished, in plan order
    #[serde(default)]
    pub upstream: Vec<StageOutput>,
}

impl StepInput {
    pub fn new(process_id: impl Into<String>, subject: impl Into<String>, amount_cents: u64) -> Self {
        Self {
            process_id: process_id.into(),
            subject: subject.into(),
            amount_cents,
            upstream: Vec::new(),
        }
    }

    pub fn with_upstream(mut self, upstream: Vec<StageOutput>) -> Self {
        self.upstream = upstream;
        self
    }
}

/// Answer of one status check against a long-running operation.
///
/// `Pending` is an expected, normal answer; transport problems are reported
/// through the `Err` side of the call instead.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Pending,
    Succeeded(T),
    Failed(T),
}

/// A remote call that answers synchronously
#[async_trait]
pub trait StepOperation: Send + Sync {
    /// Service name, used in logs and in the aggregate result
    fn name(&self) -> &str;

    async fn call(&self, input: &StepInput) -> Result<serde_json::Value>;
}

/// A remote operation that is started once and then polled for completion
#[async_trait]
pub trait AsyncOperation: Send + Sync {
    fn name(&self) -> &str;

    /// Start the operation and return its id
    async fn initiate(&self, input: &StepInput) -> Result<String>;

    async fn check_status(&self, operation_id: &str) -> Result<PollStatus<serde_json::Value>>;

    /// Forget an operation nobody will poll again. Called when polling
    /// fails, times out or is cancelled before a terminal answer.
    fn abandon(&self, _operation_id: &str) {}
}

/// Side effects of an approval process
#[async_trait]
pub trait ApprovalActions: Send + Sync {
    async fn notify_approvers(&self, request: &ApprovalRequest) -> Result<()>;

    async fn notify_requester(&self, requester: &str, message: &str) -> Result<()>;

    /// Carry out what was approved and describe the result
    async fn execute_approved_action(&self, request: &ApprovalRequest) -> Result<String>;

    async fn log_decision(
        &self,
        request_id: &str,
        decision: Decision,
        approver: &str,
        comment: &str,
    ) -> Result<()>;
}

/// Steps of the simple two-step greeting process
#[async_trait]
pub trait GreetingActions: Send + Sync {
    async fn say_hello(&self, name: &str) -> Result<String>;

    async fn create_greeting(&self, greeting: &str, name: &str) -> Result<String>;
}
