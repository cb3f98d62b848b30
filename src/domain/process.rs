//! Process instances and their lifecycle.
//!
//! A `ProcessInstance` is one execution of a process kind under an
//! idempotency key. It is written only by the task executing it; every
//! other party reads snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::approval::{ApprovalOutcome, ApprovalState};
use super::outcome::AggregateResult;

/// Kind of process behind an idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessKind {
    SimpleProcess,
    ApprovalProcess,
    OrchestrationProcess,
}

impl ProcessKind {
    /// Prefix used when an idempotency key is derived from a request id
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::SimpleProcess => "hello",
            Self::ApprovalProcess => "approval",
            Self::OrchestrationProcess => "orchestration",
        }
    }
}

/// Status of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    Running,
    AwaitingSignal,
    Completed,
    Rejected,
    TimedOut,
    Failed,
    Cancelled,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::TimedOut | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::AwaitingSignal => "AWAITING_SIGNAL",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Typed final output of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "output")]
pub enum ProcessOutput {
    Simple(String),
    Approval(ApprovalOutcome),
    Orchestration(AggregateResult),
}

/// Why a process ended in FAILED (or TIMED_OUT)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Stage label that was running
    pub stage: String,
    pub cause: String,
}

/// Attempted mutation of an instance that already reached a terminal status
#[derive(Debug, Clone, Error)]
#[error("process '{id}' is already {status}")]
pub struct AlreadyTerminal {
    pub id: String,
    pub status: ProcessStatus,
}

/// One process execution, keyed by its idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub kind: ProcessKind,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub current_stage_label: String,
    pub result: Option<ProcessOutput>,
    pub failure: Option<FailureReport>,

    /// Recorded decision state (approval processes only)
    pub approval: Option<ApprovalState>,
}

impl ProcessInstance {
    pub fn new(id: impl Into<String>, kind: ProcessKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: ProcessStatus::Pending,
            created_at: now,
            last_updated_at: now,
            current_stage_label: "SUBMITTED".to_string(),
            result: None,
            failure: None,
            approval: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_open(&self) -> Result<(), AlreadyTerminal> {
        if self.is_terminal() {
            return Err(AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Move to a non-terminal status with a new stage label
    pub fn advance(
        &mut self,
        status: ProcessStatus,
        stage: impl Into<String>,
    ) -> Result<(), AlreadyTerminal> {
        self.ensure_open()?;
        self.status = status;
        self.current_stage_label = stage.into();
        self.touch();
        Ok(())
    }

    /// Replace the recorded approval state
    pub fn record_approval(&mut self, approval: ApprovalState) -> Result<(), AlreadyTerminal> {
        self.ensure_open()?;
        self.approval = Some(approval);
        self.touch();
        Ok(())
    }

    /// Close the instance with a terminal status and optional output
    pub fn finish(
        &mut self,
        status: ProcessStatus,
        result: Option<ProcessOutput>,
    ) -> Result<(), AlreadyTerminal> {
        self.ensure_open()?;
        debug_assert!(status.is_terminal(), "finish() needs a terminal status");
        self.status = status;
        self.result = result;
        self.touch();
        Ok(())
    }

    /// Close the instance as FAILED (or TIMED_OUT) with the stage that broke
    pub fn fail(
        &mut self,
        status: ProcessStatus,
        stage: impl Into<String>,
        cause: impl Into<String>,
    ) -> Result<(), AlreadyTerminal> {
        self.ensure_open()?;
        let stage = stage.into();
        self.status = status;
        self.failure = Some(FailureReport {
            stage: stage.clone(),
            cause: cause.into(),
        });
        self.current_stage_label = stage;
        self.touch();
        Ok(())
    }

    pub fn approval_outcome(&self) -> Option<&ApprovalOutcome> {
        match &self.result {
            Some(ProcessOutput::Approval(outcome)) => Some(outcome),
            _ => None,
        }
    }

    pub fn aggregate(&self) -> Option<&AggregateResult> {
        match &self.result {
            Some(ProcessOutput::Orchestration(aggregate)) => Some(aggregate),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_creation() {
        let instance = ProcessInstance::new("p1", ProcessKind::OrchestrationProcess);
        assert_eq!(instance.id, "p1");
        assert_eq!(instance.status, ProcessStatus::Pending);
        assert!(!instance.is_terminal());
        assert!(instance.result.is_none());
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut instance = ProcessInstance::new("p1", ProcessKind::SimpleProcess);
        instance.advance(ProcessStatus::Running, "say_hello").unwrap();
        instance
            .finish(
                ProcessStatus::Completed,
                Some(ProcessOutput::Simple("hi".to_string())),
            )
            .unwrap();

        let err = instance
            .advance(ProcessStatus::Running, "again")
            .unwrap_err();
        assert_eq!(err.status, ProcessStatus::Completed);
        assert!(instance.fail(ProcessStatus::Failed, "x", "y").is_err());
        assert_eq!(instance.current_stage_label, "say_hello");
    }

    #[test]
    fn test_fail_records_stage_and_cause() {
        let mut instance = ProcessInstance::new("p1", ProcessKind::OrchestrationProcess);
        instance
            .fail(ProcessStatus::Failed, "stage_a", "connection refused")
            .unwrap();

        let failure = instance.failure.as_ref().unwrap();
        assert_eq!(failure.stage, "stage_a");
        assert_eq!(failure.cause, "connection refused");
        assert_eq!(instance.current_stage_label, "stage_a");
    }

    #[test]
    fn test_status_display_matches_serde() {
        let json = serde_json::to_string(&ProcessStatus::AwaitingSignal).unwrap();
        assert_eq!(json, format!("\"{}\"", ProcessStatus::AwaitingSignal));
    }
}
