//! Journal events for process executions.
//!
//! Every notable transition of a process (submission, step attempts,
//! signals, terminal outcome) is recorded as an immutable event in an
//! append-only journal. The journal is an audit trail: it is read back for
//! inspection, never replayed to resume execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a process journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Idempotency key of the process this event belongs to
    pub process_id: String,

    /// Stage or step label (if applicable)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO payloads)
    pub summary: String,

    /// Attempt number for step-level events
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for completed steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl ProcessEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        process_id: impl Into<String>,
        stage: Option<String>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            process_id: process_id.into(),
            stage,
            event_type,
            summary: summary.into(),
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events recorded in a process journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new process was created under its idempotency key
    ProcessSubmitted,

    /// A stage of the plan started
    StageStarted,

    /// A step attempt failed and will be retried
    StepRetrying,

    /// A step completed successfully
    StepCompleted,

    /// A step exhausted its retry policy
    StepFailed,

    /// A status check reported the remote operation is still processing
    PollPending,

    /// A decision or cancel signal was accepted
    SignalReceived,

    /// Process reached COMPLETED
    ProcessCompleted,

    /// Process reached REJECTED
    ProcessRejected,

    /// Process reached TIMED_OUT
    ProcessTimedOut,

    /// Process reached FAILED
    ProcessFailed,

    /// Process reached CANCELLED
    ProcessCancelled,
}

impl EventType {
    /// Whether this event closes the journal of a process
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ProcessCompleted
                | Self::ProcessRejected
                | Self::ProcessTimedOut
                | Self::ProcessFailed
                | Self::ProcessCancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProcessEvent::new(
            "p1",
            Some("stage_a".to_string()),
            EventType::StepRetrying,
            "UserService failed, retrying",
        )
        .with_attempt(2);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"step_retrying\""));

        let parsed: ProcessEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepRetrying);
        assert_eq!(parsed.attempt, Some(2));
        assert_eq!(parsed.process_id, "p1");
    }

    #[test]
    fn test_event_with_duration_and_error() {
        let event = ProcessEvent::new("p1", None, EventType::StepFailed, "gave up")
            .with_duration(1500)
            .with_error("Connection timeout");

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("Connection timeout"));
    }

    #[test]
    fn test_terminal_event_types() {
        assert!(EventType::ProcessCompleted.is_terminal());
        assert!(EventType::ProcessCancelled.is_terminal());
        assert!(!EventType::SignalReceived.is_terminal());
        assert!(!EventType::StepFailed.is_terminal());
    }
}
