//! Human-in-the-loop approval gate.
//!
//! A gate validates the request, notifies approvers and then suspends until
//! an approve, reject or cancel signal arrives on its mailbox, or until the
//! deadline passes. The first signal wins: handles and the gate race for
//! one shared claim, so every later signal is answered `Ignored`. A cancel
//! also interrupts the notification of approvers. Progress is published
//! through a watch channel and can be read at any time without touching
//! the gate.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::adapters::ApprovalActions;
use crate::domain::{
    ActionExecution, ApprovalOutcome, ApprovalRequest, ApprovalState, Decision, EventType,
    ProcessEvent, ProcessStatus, StepResult,
};

use super::error::StageFailure;
use super::registry::ProcessWriter;
use super::retry::{PolicyError, RetryPolicy, StepInvoker};

/// Request types accepted when a request carries a type
pub const DEFAULT_REQUEST_TYPES: &[&str] = &[
    "BUDGET_REQUEST",
    "PERSONNEL_CHANGE",
    "SYSTEM_ACCESS",
    "PROCUREMENT",
    "POLICY_EXCEPTION",
];

/// Approval gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// How long to wait for a decision
    #[serde(default = "default_decision_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_min_details_len")]
    pub min_details_len: usize,

    #[serde(default = "default_request_types")]
    pub allowed_request_types: Vec<String>,

    /// Policy for notification and follow-up steps
    #[serde(default = "default_step_retry")]
    pub step_retry: RetryPolicy,
}

fn default_decision_timeout() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_min_details_len() -> usize {
    10
}
fn default_request_types() -> Vec<String> {
    DEFAULT_REQUEST_TYPES.iter().map(|t| t.to_string()).collect()
}
fn default_step_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: 1_000,
        max_interval_ms: 10_000,
        backoff_coefficient: 2.0,
        max_attempts: 3,
        timeout_ms: 5 * 60_000,
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_decision_timeout(),
            min_details_len: default_min_details_len(),
            allowed_request_types: default_request_types(),
            step_retry: default_step_retry(),
        }
    }
}

impl ApprovalConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        self.step_retry.validate()
    }
}

/// Check a request before anyone is asked to decide on it
pub fn validate_request(request: &ApprovalRequest, config: &ApprovalConfig) -> Result<(), String> {
    if request.request_id.trim().is_empty() {
        return Err("Invalid request ID".to_string());
    }

    if let Some(request_type) = &request.request_type {
        if !config
            .allowed_request_types
            .iter()
            .any(|allowed| allowed == request_type)
        {
            return Err(format!(
                "Invalid request type '{}'. Valid types: {}",
                request_type,
                config.allowed_request_types.join(", ")
            ));
        }
    }

    if request.details.trim().chars().count() < config.min_details_len {
        return Err(format!(
            "Request details must be at least {} characters long",
            config.min_details_len
        ));
    }

    Ok(())
}

/// Lifecycle of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Submitted,
    Validating,
    AwaitingDecision,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
    /// A mandatory step failed
    Failed,
    Completed,
}

impl GateStatus {
    /// Signals are still accepted
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Validating | Self::AwaitingDecision
        )
    }
}

/// Point-in-time view of a gate
#[derive(Debug, Clone)]
pub struct ApprovalSnapshot {
    pub status: GateStatus,
    pub current_step: String,
    pub approval: ApprovalState,
    pub request: ApprovalRequest,
    awaiting_since: Option<Instant>,
    decided_at: Option<Instant>,
}

impl ApprovalSnapshot {
    fn new(request: ApprovalRequest) -> Self {
        Self {
            status: GateStatus::Submitted,
            current_step: "SUBMITTED".to_string(),
            approval: ApprovalState::default(),
            request,
            awaiting_since: None,
            decided_at: None,
        }
    }

    /// Time spent waiting for a decision. Zero before the wait starts,
    /// frozen once a decision is reached.
    pub fn elapsed_wait(&self) -> Duration {
        match self.awaiting_since {
            Some(since) => self.decided_at.unwrap_or_else(Instant::now) - since,
            None => Duration::ZERO,
        }
    }
}

/// Message delivered to a waiting gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateSignal {
    Approve {
        who: String,
        comment: Option<String>,
    },
    Reject {
        who: String,
        reason: Option<String>,
    },
    Cancel,
}

/// Whether a signal was taken by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalReceipt {
    Accepted,
    /// The outcome was already settled; the signal had no effect
    Ignored,
}

/// Caller side of a gate: sends signals and reads snapshots
#[derive(Debug, Clone)]
pub struct GateHandle {
    signals: mpsc::UnboundedSender<GateSignal>,
    state: watch::Receiver<ApprovalSnapshot>,
    /// Set by whoever settles the outcome first: a signal or the gate
    settled: Arc<AtomicBool>,
}

impl GateHandle {
    pub fn approve(&self, who: &str, comment: Option<&str>) -> SignalReceipt {
        self.send(GateSignal::Approve {
            who: who.to_string(),
            comment: comment.map(str::to_string),
        })
    }

    pub fn reject(&self, who: &str, reason: Option<&str>) -> SignalReceipt {
        self.send(GateSignal::Reject {
            who: who.to_string(),
            reason: reason.map(str::to_string),
        })
    }

    pub fn cancel(&self) -> SignalReceipt {
        self.send(GateSignal::Cancel)
    }

    pub fn send(&self, signal: GateSignal) -> SignalReceipt {
        if !self.state.borrow().status.is_open() {
            return SignalReceipt::Ignored;
        }
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SignalReceipt::Ignored;
        }
        match self.signals.send(signal) {
            Ok(()) => SignalReceipt::Accepted,
            Err(_) => SignalReceipt::Ignored,
        }
    }

    pub fn snapshot(&self) -> ApprovalSnapshot {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> GateStatus {
        self.state.borrow().status
    }
}

/// Executing side of a gate
pub struct ApprovalGate {
    request: ApprovalRequest,
    config: ApprovalConfig,
    actions: Arc<dyn ApprovalActions>,
    invoker: StepInvoker,
    signals: mpsc::UnboundedReceiver<GateSignal>,
    state: watch::Sender<ApprovalSnapshot>,
    settled: Arc<AtomicBool>,
}

/// How the notify-approvers step ended
enum Notified {
    /// The step finished; a decision that arrived meanwhile is kept
    Done(StepResult<()>, Option<GateSignal>),
    Cancelled,
}

impl ApprovalGate {
    pub fn new(
        request: ApprovalRequest,
        config: ApprovalConfig,
        actions: Arc<dyn ApprovalActions>,
        invoker: StepInvoker,
    ) -> (Self, GateHandle) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ApprovalSnapshot::new(request.clone()));
        let settled = Arc::new(AtomicBool::new(false));

        let gate = Self {
            request,
            config,
            actions,
            invoker,
            signals: signal_rx,
            state: state_tx,
            settled: settled.clone(),
        };
        let handle = GateHandle {
            signals: signal_tx,
            state: state_rx,
            settled,
        };
        (gate, handle)
    }

    /// Map a decision to the status of the owning process
    pub fn process_status(decision: Decision) -> ProcessStatus {
        match decision {
            Decision::Approved => ProcessStatus::Completed,
            Decision::Rejected => ProcessStatus::Rejected,
            Decision::TimedOut => ProcessStatus::TimedOut,
            Decision::Cancelled => ProcessStatus::Cancelled,
        }
    }

    /// Run the gate to its decision and follow-up steps.
    ///
    /// Only a failure to notify approvers is an error; everything after the
    /// decision is reported inside the outcome.
    #[instrument(skip_all, fields(request_id = %self.request.request_id))]
    pub async fn run(mut self, writer: &ProcessWriter) -> Result<ApprovalOutcome, StageFailure> {
        self.set_step(writer, GateStatus::Validating, "VALIDATING");

        if let Err(reason) = validate_request(&self.request, &self.config) {
            warn!(%reason, "Approval request failed validation");
            self.settle();
            self.close_mailbox();
            self.set_step(writer, GateStatus::Rejected, "REJECTED_VALIDATION");

            let message = format!("Request validation failed: {}", reason);
            self.best_effort("notify_requester", |_| {
                self.actions
                    .notify_requester(&self.request.requester, &message)
            })
            .await;

            self.state.send_modify(|s| s.status = GateStatus::Completed);
            return Ok(ApprovalOutcome {
                decision: Decision::Rejected,
                decided_by: None,
                comment: Some(reason.clone()),
                execution: None,
                message: format!("Request rejected during validation: {}", reason),
            });
        }

        self.set_step(writer, GateStatus::Validating, "NOTIFYING_APPROVERS");
        let early = match self.notify_approvers().await {
            Notified::Cancelled => {
                info!("Cancelled while notifying approvers");
                self.record_signal(&GateSignal::Cancel).await;
                self.close_mailbox();
                let outcome = self.on_cancelled(writer).await;
                self.state.send_modify(|s| s.status = GateStatus::Completed);
                return Ok(outcome);
            }
            Notified::Done(StepResult::Failed { cause, .. }, _) => {
                self.settle();
                self.close_mailbox();
                self.state.send_modify(|s| {
                    s.status = GateStatus::Failed;
                    s.current_step = "NOTIFY_APPROVERS_FAILED".to_string();
                });
                return Err(StageFailure::failed("notify_approvers", cause));
            }
            Notified::Done(_, early) => early,
        };

        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let wall_deadline =
            chrono::Utc::now() + chrono::Duration::milliseconds(self.config.timeout_ms as i64);
        self.state.send_modify(|s| {
            s.approval.deadline = Some(wall_deadline);
            s.awaiting_since = Some(Instant::now());
        });
        self.set_step(writer, GateStatus::AwaitingDecision, "AWAITING_APPROVAL");
        info!(timeout_ms = self.config.timeout_ms, "Waiting for a decision");

        let decision = self.await_decision(deadline, early).await;
        self.close_mailbox();
        self.state.send_modify(|s| s.decided_at = Some(Instant::now()));

        let approval = self.state.borrow().approval.clone();
        if let Err(e) = writer.record_approval(approval.clone()) {
            warn!(error = %e, "Could not record approval state");
        }
        info!(%decision, decided_by = ?approval.decided_by, "Decision reached");

        let outcome = match decision {
            Decision::Approved => self.on_approved(writer, &approval).await,
            Decision::Rejected => self.on_rejected(writer, &approval).await,
            Decision::TimedOut => self.on_timed_out(writer, timeout).await,
            Decision::Cancelled => self.on_cancelled(writer).await,
        };

        self.state.send_modify(|s| s.status = GateStatus::Completed);
        Ok(outcome)
    }

    /// Run the notify-approvers step while watching the mailbox
    async fn notify_approvers(&mut self) -> Notified {
        let actions = &self.actions;
        let request = &self.request;
        let signals = &mut self.signals;

        let notify = self
            .invoker
            .invoke("notify_approvers", &self.config.step_retry, |_| {
                actions.notify_approvers(request)
            });
        tokio::pin!(notify);

        let mut early = None;
        loop {
            tokio::select! {
                result = &mut notify => return Notified::Done(result, early),
                Some(signal) = signals.recv(), if early.is_none() => {
                    if matches!(signal, GateSignal::Cancel) {
                        return Notified::Cancelled;
                    }
                    debug!(?signal, "Decision arrived before approvers were notified");
                    early = Some(signal);
                }
            }
        }
    }

    async fn await_decision(&mut self, deadline: Instant, early: Option<GateSignal>) -> Decision {
        let signal = match early {
            Some(signal) => signal,
            None => tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(signal) => signal,
                    None => {
                        // Every handle is gone; only the deadline can decide now
                        self.settle();
                        tokio::time::sleep_until(deadline).await;
                        return Decision::TimedOut;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if self.settle() {
                        warn!("No decision before the deadline");
                        return Decision::TimedOut;
                    }
                    // A signal claimed the outcome just before the deadline
                    match self.signals.recv().await {
                        Some(signal) => signal,
                        None => return Decision::TimedOut,
                    }
                }
            },
        };
        self.record_signal(&signal).await;

        match signal {
            GateSignal::Approve { who, comment } => {
                self.record(|s| s.record_approval(&who, comment.as_deref()));
                Decision::Approved
            }
            GateSignal::Reject { who, reason } => {
                self.record(|s| s.record_rejection(&who, reason.as_deref()));
                Decision::Rejected
            }
            GateSignal::Cancel => Decision::Cancelled,
        }
    }

    async fn on_approved(&self, writer: &ProcessWriter, approval: &ApprovalState) -> ApprovalOutcome {
        self.set_step(writer, GateStatus::Approved, "EXECUTING_ACTION");
        let who = approval.decided_by.clone().unwrap_or_default();
        let comment = approval.decision_comment.clone().unwrap_or_default();

        let execution = match self
            .invoker
            .invoke("execute_approved_action", &self.config.step_retry, |_| {
                self.actions.execute_approved_action(&self.request)
            })
            .await
        {
            StepResult::Success { value, .. } => ActionExecution::Succeeded(value),
            StepResult::Failed { cause, .. } => {
                warn!(error = %cause, "Approved action failed");
                ActionExecution::Failed(cause)
            }
            StepResult::TimedOut => ActionExecution::Failed("approved action timed out".to_string()),
        };

        let message = format!(
            "Your request {} has been approved by {}. Comments: {}",
            self.request.request_id, who, comment
        );
        self.finish_notifications(writer, Decision::Approved, &who, &comment, &message)
            .await;

        let message = match &execution {
            ActionExecution::Succeeded(result) => {
                format!("Request approved by {}. Action result: {}", who, result)
            }
            ActionExecution::Failed(cause) => format!(
                "Request approved by {}, but the approved action failed: {}",
                who, cause
            ),
        };

        ApprovalOutcome {
            decision: Decision::Approved,
            decided_by: Some(who),
            comment: Some(comment),
            execution: Some(execution),
            message,
        }
    }

    async fn on_rejected(&self, writer: &ProcessWriter, approval: &ApprovalState) -> ApprovalOutcome {
        self.set_step(writer, GateStatus::Rejected, "REJECTED");
        let who = approval.decided_by.clone().unwrap_or_default();
        let reason = approval.decision_comment.clone().unwrap_or_default();

        let message = format!(
            "Your request {} has been rejected by {}. Reason: {}",
            self.request.request_id, who, reason
        );
        self.finish_notifications(writer, Decision::Rejected, &who, &reason, &message)
            .await;

        ApprovalOutcome {
            decision: Decision::Rejected,
            decided_by: Some(who.clone()),
            comment: Some(reason.clone()),
            execution: None,
            message: format!("Request rejected by {}. Reason: {}", who, reason),
        }
    }

    async fn on_timed_out(&self, writer: &ProcessWriter, timeout: Duration) -> ApprovalOutcome {
        self.set_step(writer, GateStatus::TimedOut, "TIMEOUT");
        let message = format!(
            "Your request {} timed out after {:?} without a decision",
            self.request.request_id, timeout
        );
        self.finish_notifications(
            writer,
            Decision::TimedOut,
            "system",
            "No decision before the deadline",
            &message,
        )
        .await;

        ApprovalOutcome {
            decision: Decision::TimedOut,
            decided_by: None,
            comment: None,
            execution: None,
            message: "Request timed out without a decision".to_string(),
        }
    }

    async fn on_cancelled(&self, writer: &ProcessWriter) -> ApprovalOutcome {
        self.set_step(writer, GateStatus::Cancelled, "CANCELLED");
        let message = format!("Your request {} was cancelled", self.request.request_id);
        self.finish_notifications(writer, Decision::Cancelled, "system", "Cancelled", &message)
            .await;

        ApprovalOutcome {
            decision: Decision::Cancelled,
            decided_by: None,
            comment: None,
            execution: None,
            message: "Request cancelled before a decision".to_string(),
        }
    }

    async fn finish_notifications(
        &self,
        writer: &ProcessWriter,
        decision: Decision,
        who: &str,
        comment: &str,
        message: &str,
    ) {
        self.mirror(writer, "NOTIFYING_REQUESTER");
        self.best_effort("notify_requester", |_| {
            self.actions
                .notify_requester(&self.request.requester, message)
        })
        .await;

        self.mirror(writer, "LOGGING_DECISION");
        self.best_effort("log_decision", |_| {
            self.actions
                .log_decision(&self.request.request_id, decision, who, comment)
        })
        .await;
    }

    /// Run a notification step; failures are logged and absorbed
    async fn best_effort<F, Fut>(&self, label: &str, operation: F)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        if let StepResult::Failed { cause, .. } = self
            .invoker
            .invoke(label, &self.config.step_retry, operation)
            .await
        {
            warn!(step = label, error = %cause, "Notification failed, continuing");
        }
    }

    /// Apply a decision to the published state
    fn record(&self, apply: impl FnOnce(&mut ApprovalState) -> bool) {
        self.state.send_if_modified(|s| apply(&mut s.approval));
    }

    /// Claim the outcome for the gate itself. False if a signal got there first.
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    async fn record_signal(&self, signal: &GateSignal) {
        let summary = match signal {
            GateSignal::Approve { who, .. } => format!("Approve signal from {}", who),
            GateSignal::Reject { who, .. } => format!("Reject signal from {}", who),
            GateSignal::Cancel => "Cancel signal".to_string(),
        };
        debug!(%summary, "Signal received");
        let step = self.state.borrow().current_step.clone();
        let sink = self.invoker.sink();
        sink.record(ProcessEvent::new(
            sink.process_id(),
            Some(step),
            EventType::SignalReceived,
            summary,
        ))
        .await;
    }

    fn close_mailbox(&mut self) {
        self.signals.close();
        while let Ok(late) = self.signals.try_recv() {
            debug!(signal = ?late, "Dropping signal received after the decision");
        }
    }

    fn set_step(&self, writer: &ProcessWriter, status: GateStatus, step: &str) {
        self.state.send_modify(|s| {
            s.status = status;
            s.current_step = step.to_string();
        });

        let process_status = match status {
            GateStatus::AwaitingDecision => ProcessStatus::AwaitingSignal,
            _ => ProcessStatus::Running,
        };
        if let Err(e) = writer.advance(process_status, step) {
            debug!(error = %e, "Process already closed");
        }
    }

    fn mirror(&self, writer: &ProcessWriter, step: &str) {
        self.state
            .send_modify(|s| s.current_step = step.to_string());
        if let Err(e) = writer.advance(ProcessStatus::Running, step) {
            debug!(error = %e, "Process already closed");
        }
    }
}
