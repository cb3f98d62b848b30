//! Errors surfaced to callers of the engine.

use thiserror::Error;

use crate::domain::{AlreadyTerminal, ProcessKind};

use super::retry::PolicyError;

/// Errors returned by registry and engine operations
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("idempotency key must not be blank")]
    BlankKey,

    #[error("process '{id}' is a {kind:?} and does not accept decision signals")]
    NotSignalable { id: String, kind: ProcessKind },

    #[error(transparent)]
    AlreadyTerminal(#[from] AlreadyTerminal),

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("process '{0}' did not finish in time")]
    WaitTimedOut(String),
}

impl ProcessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A stage or step that could not complete
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{stage} failed: {cause}")]
pub struct StageFailure {
    /// Label of the stage that broke
    pub stage: String,
    pub cause: String,

    /// The failure was a timeout rather than an exhausted retry budget
    pub timed_out: bool,
}

impl StageFailure {
    pub fn failed(stage: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            cause: cause.into(),
            timed_out: false,
        }
    }

    pub fn timed_out(stage: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            cause: cause.into(),
            timed_out: true,
        }
    }
}
