//! Retry policies and the step invoker.
//!
//! A `RetryPolicy` is a plain value: it only computes delays. All mutable
//! retry state (attempt counter, last cause) lives inside one call to
//! `StepInvoker::invoke` and is dropped when it returns.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::domain::{EventType, ProcessEvent, StepResult};

use super::journal::EventSink;

/// Backoff behavior for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Upper bound for any delay
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Delay multiplier per failed attempt (>= 1.0)
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,

    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Start-to-close limit of a single attempt
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_initial_interval() -> u64 {
    2_000
}
fn default_max_interval() -> u64 {
    30_000
}
fn default_backoff_coefficient() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    5
}
fn default_timeout() -> u64 {
    45_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_coefficient: default_backoff_coefficient(),
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout(),
        }
    }
}

/// Invalid retry policy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_coefficient must be >= 1.0, got {0}")]
    CoefficientBelowOne(f64),

    #[error("max_interval_ms ({max}) is smaller than initial_interval_ms ({initial})")]
    IntervalInverted { initial: u64, max: u64 },

    #[error("timeout_ms must be greater than zero")]
    ZeroTimeout,
}

impl RetryPolicy {
    /// Policy with constant delay and no backoff growth
    pub fn fixed(interval: Duration, max_attempts: u32, timeout: Duration) -> Self {
        let interval_ms = interval.as_millis() as u64;
        Self {
            initial_interval_ms: interval_ms,
            max_interval_ms: interval_ms,
            backoff_coefficient: 1.0,
            max_attempts,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if !(self.backoff_coefficient >= 1.0) {
            return Err(PolicyError::CoefficientBelowOne(self.backoff_coefficient));
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(PolicyError::IntervalInverted {
                initial: self.initial_interval_ms,
                max: self.max_interval_ms,
            });
        }
        if self.timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(())
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_interval_ms.min(self.max_interval_ms));
        }

        let delay = self.initial_interval_ms as f64
            * self.backoff_coefficient.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_interval_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Every delay the policy can produce, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .collect()
    }
}

/// Runs one remote operation under a retry policy
#[derive(Debug, Clone, Default)]
pub struct StepInvoker {
    sink: EventSink,
}

impl StepInvoker {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Invoke `operation` until it succeeds or the policy is exhausted.
    ///
    /// The operation receives the 1-indexed attempt number. An attempt that
    /// exceeds the policy timeout is dropped and counted as a failure.
    pub async fn invoke<T, F, Fut>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> StepResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let timeout = policy.timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let step_start = Instant::now();

            let cause = match tokio::time::timeout(timeout, operation(attempt)).await {
                Ok(Ok(value)) => {
                    let duration_ms = step_start.elapsed().as_millis() as u64;
                    debug!(step = label, attempt, duration_ms, "Step completed");
                    self.sink
                        .record(
                            ProcessEvent::new(
                                self.sink.process_id(),
                                Some(label.to_string()),
                                EventType::StepCompleted,
                                format!("Step '{}' completed in {}ms", label, duration_ms),
                            )
                            .with_attempt(attempt)
                            .with_duration(duration_ms),
                        )
                        .await;
                    return StepResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("attempt timed out after {:?}", timeout),
            };

            if policy.should_retry(attempt) {
                let delay = policy.delay_for_attempt(attempt);

                warn!(
                    step = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %cause,
                    "Step failed, retrying"
                );
                self.sink
                    .record(
                        ProcessEvent::new(
                            self.sink.process_id(),
                            Some(label.to_string()),
                            EventType::StepRetrying,
                            format!("Step '{}' failed, retrying in {:?}", label, delay),
                        )
                        .with_attempt(attempt)
                        .with_error(cause),
                    )
                    .await;

                tokio::time::sleep(delay).await;
                continue;
            }

            error!(step = label, attempt, error = %cause, "Step failed permanently");
            self.sink
                .record(
                    ProcessEvent::new(
                        self.sink.process_id(),
                        Some(label.to_string()),
                        EventType::StepFailed,
                        format!("Step '{}' failed after {} attempts", label, attempt),
                    )
                    .with_attempt(attempt)
                    .with_error(cause.clone()),
                )
                .await;

            return StepResult::Failed {
                cause,
                attempts_made: attempt,
            };
        }
    }
}
