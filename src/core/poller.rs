//! Poll-until-complete for long-running remote operations.
//!
//! The poller distinguishes three situations:
//! - the operation is not done yet (`PollStatus::Pending`): wait a constant
//!   interval and ask again
//! - the status check itself failed (transport error): retried under a
//!   nested retry policy, exhausting to `StepResult::Failed`
//! - the operation finished, successfully or not: returned immediately as a
//!   successful step carrying a `BusinessOutcome`

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapters::PollStatus;
use crate::domain::{BusinessOutcome, EventType, ProcessEvent, StepResult};

use super::retry::{PolicyError, RetryPolicy, StepInvoker};

/// Polling cadence and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Constant wait between two status checks
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,

    /// Status checks allowed before giving up
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    /// Overall limit for the whole polling cycle
    #[serde(default = "default_poll_deadline")]
    pub deadline_ms: u64,

    /// Retry policy for a status check that fails at the transport level
    #[serde(default = "default_transport_retry")]
    pub transport_retry: RetryPolicy,
}

fn default_poll_interval() -> u64 {
    60_000
}
fn default_max_polls() -> u32 {
    20
}
fn default_poll_deadline() -> u64 {
    20 * 60_000
}
fn default_transport_retry() -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: 1_000,
        max_interval_ms: 10_000,
        backoff_coefficient: 2.0,
        max_attempts: 3,
        timeout_ms: 30_000,
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            deadline_ms: default_poll_deadline(),
            transport_retry: default_transport_retry(),
        }
    }
}

impl PollConfig {
    pub fn new(interval: Duration, max_polls: u32, deadline: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_polls,
            deadline_ms: deadline.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.transport_retry = policy;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_polls == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if self.deadline_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        self.transport_retry.validate()
    }
}

/// Repeats a status check until the remote operation reaches a terminal state
#[derive(Debug, Clone, Default)]
pub struct AsyncPoller {
    invoker: StepInvoker,
}

impl AsyncPoller {
    pub fn new(invoker: StepInvoker) -> Self {
        Self { invoker }
    }

    /// Poll until done, the poll budget is spent or the deadline passes.
    ///
    /// On success `attempts` is the number of status checks that answered.
    pub async fn poll_until_done<T, F, Fut>(
        &self,
        label: &str,
        config: &PollConfig,
        mut status_check: F,
    ) -> StepResult<BusinessOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<PollStatus<T>>>,
    {
        let deadline = config.deadline();
        match tokio::time::timeout(deadline, self.poll_loop(label, config, &mut status_check)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(step = label, deadline_ms = config.deadline_ms, "Polling deadline exceeded");
                self.record_timeout(label, format!("deadline of {:?} exceeded", deadline))
                    .await;
                StepResult::TimedOut
            }
        }
    }

    async fn poll_loop<T, F, Fut>(
        &self,
        label: &str,
        config: &PollConfig,
        status_check: &mut F,
    ) -> StepResult<BusinessOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<PollStatus<T>>>,
    {
        let mut polls = 0u32;

        loop {
            polls += 1;
            let answer = self
                .invoker
                .invoke(label, &config.transport_retry, |_| status_check())
                .await;

            match answer {
                StepResult::Success {
                    value: PollStatus::Succeeded(value),
                    ..
                } => {
                    info!(step = label, polls, "Remote operation completed");
                    return StepResult::Success {
                        value: BusinessOutcome::Succeeded(value),
                        attempts: polls,
                    };
                }
                StepResult::Success {
                    value: PollStatus::Failed(value),
                    ..
                } => {
                    info!(step = label, polls, "Remote operation finished with a business failure");
                    return StepResult::Success {
                        value: BusinessOutcome::Failed(value),
                        attempts: polls,
                    };
                }
                StepResult::Success {
                    value: PollStatus::Pending,
                    ..
                } => {
                    if polls >= config.max_polls {
                        warn!(step = label, polls, "Poll budget exhausted");
                        self.record_timeout(label, format!("still pending after {} polls", polls))
                            .await;
                        return StepResult::TimedOut;
                    }

                    debug!(step = label, polls, "Remote operation still processing");
                    self.invoker
                        .sink()
                        .record(
                            ProcessEvent::new(
                                self.invoker.sink().process_id(),
                                Some(label.to_string()),
                                EventType::PollPending,
                                format!("Poll #{} reported still processing", polls),
                            )
                            .with_attempt(polls),
                        )
                        .await;
                    tokio::time::sleep(config.interval()).await;
                }
                StepResult::Failed {
                    cause,
                    attempts_made,
                } => {
                    return StepResult::Failed {
                        cause,
                        attempts_made,
                    }
                }
                StepResult::TimedOut => return StepResult::TimedOut,
            }
        }
    }

    async fn record_timeout(&self, label: &str, reason: String) {
        self.invoker
            .sink()
            .record(
                ProcessEvent::new(
                    self.invoker.sink().process_id(),
                    Some(label.to_string()),
                    EventType::StepFailed,
                    format!("Polling '{}' timed out", label),
                )
                .with_error(reason),
            )
            .await;
    }
}
