//! Tracking state of an asynchronous payment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a tracked payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    Initiated,
    Processing,
    Completed,
    Failed,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Entry created when a payment is initiated and mutated by each poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTrackingEntry {
    pub id: String,

    /// Who the payment is for
    pub owner_key: String,

    pub amount_cents: u64,

    pub poll_count: u32,

    pub state: PaymentState,

    pub initiated_at: DateTime<Utc>,

    pub last_updated_at: DateTime<Utc>,
}

impl PaymentTrackingEntry {
    pub fn new(id: impl Into<String>, owner_key: impl Into<String>, amount_cents: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_key: owner_key.into(),
            amount_cents,
            poll_count: 0,
            state: PaymentState::Initiated,
            initiated_at: now,
            last_updated_at: now,
        }
    }

    /// Count one poll and return the new poll count
    pub fn record_poll(&mut self) -> u32 {
        self.poll_count += 1;
        self.last_updated_at = Utc::now();
        self.poll_count
    }

    /// Amount formatted as a decimal string, e.g. "150.75"
    pub fn amount_display(&self) -> String {
        format!("{}.{:02}", self.amount_cents / 100, self.amount_cents % 100)
    }
}
