//! Step and stage outcomes.
//!
//! A `StepResult` is produced once by the invoker or poller and handed by
//! value to whoever scheduled the step. Stage outputs are collected into an
//! `AggregateResult` whose order is fixed by plan position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one logical step, after retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepResult<T> {
    /// The step produced a value; `attempts` counts the attempt that succeeded
    Success { value: T, attempts: u32 },

    /// Every attempt failed; `cause` is the last failure
    Failed { cause: String, attempts_made: u32 },

    /// A deadline or poll budget was exhausted before an answer arrived
    TimedOut,
}

impl<T> StepResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The value of a successful step
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Number of attempts made, zero for a timeout
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } => *attempts,
            Self::Failed { attempts_made, .. } => *attempts_made,
            Self::TimedOut => 0,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepResult<U> {
        match self {
            Self::Success { value, attempts } => StepResult::Success {
                value: f(value),
                attempts,
            },
            Self::Failed {
                cause,
                attempts_made,
            } => StepResult::Failed {
                cause,
                attempts_made,
            },
            Self::TimedOut => StepResult::TimedOut,
        }
    }
}

/// Terminal outcome reported by a long-running remote operation.
///
/// Both variants are valid business results; neither is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "payload")]
pub enum BusinessOutcome<T> {
    Succeeded(T),
    Failed(T),
}

impl<T> BusinessOutcome<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn payload(&self) -> &T {
        match self {
            Self::Succeeded(payload) | Self::Failed(payload) => payload,
        }
    }

    pub fn into_payload(self) -> T {
        match self {
            Self::Succeeded(payload) | Self::Failed(payload) => payload,
        }
    }
}

/// Stage of the orchestration plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Prerequisite call gating everything else
    A,
    /// Parallel fan-out
    B,
    /// Sync call or initiate + poll, concurrent with B
    C,
    /// Final call after the join
    D,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::A => "stage_a",
            Self::B => "stage_b",
            Self::C => "stage_c",
            Self::D => "stage_d",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Output of one service call within the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub stage: Stage,

    /// Name of the service that produced the value
    pub service: String,

    /// Opaque structured payload, read-only once produced
    pub value: serde_json::Value,

    /// Attempts the successful call needed
    pub attempts: u32,
}

/// Result of a completed orchestration, ordered by plan position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Subject the plan ran for (e.g. a user id)
    pub subject: String,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Short description of the execution shape
    pub execution_pattern: String,

    /// A, B[0], C, B[1], B[2..], D
    pub stages: Vec<StageOutput>,
}

impl AggregateResult {
    pub fn total_services(&self) -> usize {
        self.stages.len()
    }

    /// Service names in aggregate order
    pub fn services(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.service.as_str()).collect()
    }

    pub fn values(&self) -> Vec<&serde_json::Value> {
        self.stages.iter().map(|s| &s.value).collect()
    }

    pub fn get(&self, service: &str) -> Option<&StageOutput> {
        self.stages.iter().find(|s| s.service == service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_result_accessors() {
        let ok: StepResult<u32> = StepResult::Success {
            value: 7,
            attempts: 3,
        };
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&7));
        assert_eq!(ok.attempts(), 3);

        let failed: StepResult<u32> = StepResult::Failed {
            cause: "boom".to_string(),
            attempts_made: 5,
        };
        assert!(!failed.is_success());
        assert_eq!(failed.attempts(), 5);
        assert_eq!(failed.map(|v| v * 2).value(), None);

        assert_eq!(StepResult::<u32>::TimedOut.attempts(), 0);
    }

    #[test]
    fn test_business_failure_is_still_a_payload() {
        let outcome = BusinessOutcome::Failed("declined".to_string());
        assert!(outcome.is_failure());
        assert_eq!(outcome.payload(), "declined");
    }

    #[test]
    fn test_step_result_serialization_tag() {
        let result: StepResult<String> = StepResult::TimedOut;
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"outcome":"timed_out"}"#);
    }
}
