//! Approval requests, decisions and recorded approval state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A request that needs a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,

    /// Optional typed variant; validated against the allow-list when set
    #[serde(default)]
    pub request_type: Option<String>,

    pub details: String,

    pub requester: String,
}

impl ApprovalRequest {
    pub fn new(
        request_id: impl Into<String>,
        details: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            request_type: None,
            details: details.into(),
            requester: requester.into(),
        }
    }

    pub fn with_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }
}

/// Final decision of an approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Decision state recorded on an approval process.
///
/// `approval_received` and `rejection_received` are never both set: the
/// first decision recorded wins and later ones are refused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalState {
    pub approval_received: bool,
    pub rejection_received: bool,
    pub decided_by: Option<String>,
    pub decision_comment: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl ApprovalState {
    pub fn with_deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    pub fn is_decided(&self) -> bool {
        self.approval_received || self.rejection_received
    }

    /// Record an approval. Returns false if a decision was already recorded.
    pub fn record_approval(&mut self, who: &str, comment: Option<&str>) -> bool {
        if self.is_decided() {
            return false;
        }
        self.approval_received = true;
        self.decided_by = Some(who.to_string());
        self.decision_comment =
            Some(comment.unwrap_or("No comments provided").to_string());
        true
    }

    /// Record a rejection. Returns false if a decision was already recorded.
    pub fn record_rejection(&mut self, who: &str, reason: Option<&str>) -> bool {
        if self.is_decided() {
            return false;
        }
        self.rejection_received = true;
        self.decided_by = Some(who.to_string());
        self.decision_comment = Some(reason.unwrap_or("No reason provided").to_string());
        true
    }
}

/// Result of running the approved follow-up action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum ActionExecution {
    Succeeded(String),
    Failed(String),
}

/// Final result of an approval process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub decision: Decision,
    pub decided_by: Option<String>,
    pub comment: Option<String>,

    /// Present only when the request was approved
    pub execution: Option<ActionExecution>,

    /// Message reported back to the requester
    pub message: String,
}
