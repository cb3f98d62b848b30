//! Five-stage orchestration plan.
//!
//! Stage A runs alone. Its output feeds Stage B (two or more independent
//! calls) and Stage C (settlement, synchronous or initiate-then-poll), which
//! all run concurrently. Stage D consumes everything before it. The first
//! failure anywhere ends the plan and aborts the calls still in flight.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::adapters::{AsyncOperation, StepInput, StepOperation};
use crate::domain::{
    AggregateResult, EventType, ProcessEvent, ProcessStatus, Stage, StageOutput, StepResult,
};

use super::error::{ProcessError, StageFailure};
use super::poller::{AsyncPoller, PollConfig};
use super::registry::ProcessWriter;
use super::retry::{RetryPolicy, StepInvoker};

/// Services wired into each stage
pub struct OrchestrationPlan {
    /// Stage A
    pub prerequisite: Arc<dyn StepOperation>,

    /// Stage B, reported in this order
    pub fan_out: Vec<Arc<dyn StepOperation>>,

    /// Stage C when settling synchronously
    pub settlement: Arc<dyn StepOperation>,

    /// Stage C when settling through initiate-then-poll
    pub async_settlement: Arc<dyn AsyncOperation>,

    /// Stage D
    pub finalizer: Arc<dyn StepOperation>,
}

impl OrchestrationPlan {
    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.fan_out.len() < 2 {
            return Err(ProcessError::InvalidPlan(format!(
                "stage B needs at least two operations, got {}",
                self.fan_out.len()
            )));
        }
        Ok(())
    }

    /// Short description of the plan shape, e.g.
    /// `UserService -> (OrderService | NotificationService | PaymentService) -> RecommendationService`
    pub fn execution_pattern(&self, async_settlement: bool) -> String {
        let settlement = if async_settlement {
            self.async_settlement.name()
        } else {
            self.settlement.name()
        };
        let concurrent: Vec<&str> = self
            .fan_out
            .iter()
            .map(|op| op.name())
            .chain(std::iter::once(settlement))
            .collect();

        format!(
            "{} -> ({}) -> {}",
            self.prerequisite.name(),
            concurrent.join(" | "),
            self.finalizer.name()
        )
    }
}

/// What to orchestrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub subject: String,

    pub amount_cents: u64,

    /// Settle through initiate-then-poll instead of one synchronous call
    #[serde(default)]
    pub async_settlement: bool,
}

impl OrchestrationRequest {
    pub fn new(subject: impl Into<String>, amount_cents: u64) -> Self {
        Self {
            subject: subject.into(),
            amount_cents,
            async_settlement: false,
        }
    }

    pub fn with_async_settlement(mut self, enabled: bool) -> Self {
        self.async_settlement = enabled;
        self
    }
}

/// Runs an `OrchestrationPlan` for one request
pub struct Orchestrator {
    plan: Arc<OrchestrationPlan>,
    step_retry: RetryPolicy,
    polling: PollConfig,
}

impl Orchestrator {
    pub fn new(
        plan: Arc<OrchestrationPlan>,
        step_retry: RetryPolicy,
        polling: PollConfig,
    ) -> Result<Self, ProcessError> {
        plan.validate()?;
        step_retry.validate()?;
        polling.validate()?;
        Ok(Self {
            plan,
            step_retry,
            polling,
        })
    }

    pub fn plan(&self) -> &OrchestrationPlan {
        &self.plan
    }

    /// Run all stages and return the ordered aggregate
    #[instrument(
        skip(self, invoker, writer),
        fields(process_id = %invoker.sink().process_id(), subject = %request.subject)
    )]
    pub async fn run(
        &self,
        request: &OrchestrationRequest,
        invoker: &StepInvoker,
        writer: &ProcessWriter,
    ) -> Result<AggregateResult, StageFailure> {
        let started_at = Utc::now();
        let base = StepInput::new(
            invoker.sink().process_id(),
            &request.subject,
            request.amount_cents,
        );

        self.enter(Stage::A.label(), invoker, writer).await;
        let prerequisite = self
            .call_step(Stage::A, &self.plan.prerequisite, &base, invoker)
            .await?;

        let input = base.clone().with_upstream(vec![prerequisite.clone()]);
        self.enter("stage_b+stage_c", invoker, writer).await;
        let (fanned, settled) = self
            .join_concurrent(&input, request.async_settlement, invoker)
            .await?;

        let mut stages = Vec::with_capacity(fanned.len() + 3);
        let mut fanned = fanned.into_iter();
        stages.push(prerequisite);
        stages.extend(fanned.next());
        stages.push(settled);
        stages.extend(fanned);

        self.enter(Stage::D.label(), invoker, writer).await;
        let input = base.with_upstream(stages.clone());
        let finalized = self
            .call_step(Stage::D, &self.plan.finalizer, &input, invoker)
            .await?;
        stages.push(finalized);

        info!(services = stages.len(), "Orchestration completed");
        Ok(AggregateResult {
            subject: request.subject.clone(),
            started_at,
            finished_at: Utc::now(),
            execution_pattern: self.plan.execution_pattern(request.async_settlement),
            stages,
        })
    }

    async fn enter(&self, label: &str, invoker: &StepInvoker, writer: &ProcessWriter) {
        if let Err(e) = writer.advance(ProcessStatus::Running, label) {
            warn!(error = %e, "Stage started on a closed process");
        }
        let sink = invoker.sink();
        sink.record(ProcessEvent::new(
            sink.process_id(),
            Some(label.to_string()),
            EventType::StageStarted,
            format!("Stage '{}' started", label),
        ))
        .await;
    }

    async fn call_step(
        &self,
        stage: Stage,
        op: &Arc<dyn StepOperation>,
        input: &StepInput,
        invoker: &StepInvoker,
    ) -> Result<StageOutput, StageFailure> {
        let label = step_label(stage, op.name());
        let result = invoker
            .invoke(&label, &self.step_retry, |_| op.call(input))
            .await;
        stage_output(stage, op.name(), &label, result)
    }

    /// Run Stage B and Stage C together, cancelling the rest on the first failure
    async fn join_concurrent(
        &self,
        input: &StepInput,
        async_settlement: bool,
        invoker: &StepInvoker,
    ) -> Result<(Vec<StageOutput>, StageOutput), StageFailure> {
        let mut fan_out = self.spawn_fan_out(input, invoker);
        let settlement = self.settle(input, async_settlement, invoker);
        tokio::pin!(settlement);

        let mut settled: Option<StageOutput> = None;
        let mut fanned: Vec<Option<StageOutput>> = vec![None; self.plan.fan_out.len()];
        let mut pending = fanned.len();

        while settled.is_none() || pending > 0 {
            tokio::select! {
                result = &mut settlement, if settled.is_none() => match result {
                    Ok(output) => settled = Some(output),
                    Err(failure) => {
                        cancel_in_flight(&mut fan_out, &failure);
                        return Err(failure);
                    }
                },
                Some(joined) = fan_out.join_next(), if pending > 0 => {
                    let (index, result) = joined.map_err(|e| {
                        StageFailure::failed(Stage::B.label(), format!("fan-out task ended abnormally: {}", e))
                    })?;
                    let op = &self.plan.fan_out[index];
                    let label = step_label(Stage::B, op.name());
                    match stage_output(Stage::B, op.name(), &label, result) {
                        Ok(output) => {
                            fanned[index] = Some(output);
                            pending -= 1;
                        }
                        Err(failure) => {
                            cancel_in_flight(&mut fan_out, &failure);
                            return Err(failure);
                        }
                    }
                }
                else => break,
            }
        }

        let settled = settled
            .ok_or_else(|| StageFailure::failed(Stage::C.label(), "settlement never reported"))?;
        let fanned = fanned
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| StageFailure::failed(Stage::B.label(), "fan-out ended early"))?;
        Ok((fanned, settled))
    }

    fn spawn_fan_out(
        &self,
        input: &StepInput,
        invoker: &StepInvoker,
    ) -> JoinSet<(usize, StepResult<Value>)> {
        let mut set = JoinSet::new();
        for (index, op) in self.plan.fan_out.iter().enumerate() {
            let op = Arc::clone(op);
            let input = input.clone();
            let invoker = invoker.clone();
            let policy = self.step_retry.clone();
            let label = step_label(Stage::B, op.name());

            set.spawn(async move {
                let result = invoker.invoke(&label, &policy, |_| op.call(&input)).await;
                (index, result)
            });
        }
        set
    }

    async fn settle(
        &self,
        input: &StepInput,
        async_settlement: bool,
        invoker: &StepInvoker,
    ) -> Result<StageOutput, StageFailure> {
        if !async_settlement {
            return self
                .call_step(Stage::C, &self.plan.settlement, input, invoker)
                .await;
        }

        let gateway = &self.plan.async_settlement;
        let label = step_label(Stage::C, gateway.name());

        let initiate_label = format!("{}:initiate", label);
        let operation_id = match invoker
            .invoke(&initiate_label, &self.step_retry, |_| gateway.initiate(input))
            .await
        {
            StepResult::Success { value, .. } => value,
            StepResult::Failed { cause, .. } => {
                return Err(StageFailure::failed(initiate_label, cause))
            }
            StepResult::TimedOut => {
                return Err(StageFailure::timed_out(initiate_label, "initiation timed out"))
            }
        };
        info!(%operation_id, "Settlement initiated, polling for completion");

        // Dropped on every exit that leaves the operation unsettled,
        // including cancellation of this future.
        let mut pending = PendingOperation {
            operation: &**gateway,
            operation_id: &operation_id,
            settled: false,
        };

        let poll_label = format!("{}:poll", label);
        let poller = AsyncPoller::new(invoker.clone());
        match poller
            .poll_until_done(&poll_label, &self.polling, || {
                gateway.check_status(&operation_id)
            })
            .await
        {
            StepResult::Success { value, attempts } => {
                pending.settled = true;
                if value.is_failure() {
                    warn!(%operation_id, "Settlement finished with a business failure");
                }
                Ok(StageOutput {
                    stage: Stage::C,
                    service: gateway.name().to_string(),
                    value: value.into_payload(),
                    attempts,
                })
            }
            StepResult::Failed { cause, .. } => Err(StageFailure::failed(poll_label, cause)),
            StepResult::TimedOut => Err(StageFailure::timed_out(
                poll_label,
                format!("operation {} did not reach a terminal state", operation_id),
            )),
        }
    }
}

/// Async operation that has been started but not seen to finish
struct PendingOperation<'a> {
    operation: &'a dyn AsyncOperation,
    operation_id: &'a str,
    settled: bool,
}

impl Drop for PendingOperation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.operation.abandon(self.operation_id);
        }
    }
}

fn step_label(stage: Stage, service: &str) -> String {
    format!("{}:{}", stage.label(), service)
}

fn stage_output(
    stage: Stage,
    service: &str,
    label: &str,
    result: StepResult<Value>,
) -> Result<StageOutput, StageFailure> {
    match result {
        StepResult::Success { value, attempts } => Ok(StageOutput {
            stage,
            service: service.to_string(),
            value,
            attempts,
        }),
        StepResult::Failed { cause, .. } => Err(StageFailure::failed(label, cause)),
        StepResult::TimedOut => Err(StageFailure::timed_out(label, "step timed out")),
    }
}

fn cancel_in_flight(fan_out: &mut JoinSet<(usize, StepResult<Value>)>, failure: &StageFailure) {
    if !fan_out.is_empty() {
        warn!(
            in_flight = fan_out.len(),
            stage = %failure.stage,
            "Cancelling in-flight calls after failure"
        );
    }
    fan_out.abort_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ErrorInjector, SimulatedPaymentGateway};
    use crate::domain::{ProcessInstance, ProcessKind};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Scripted {
        name: &'static str,
        delay: Duration,
        failures: u32,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, delay_ms: u64) -> Arc<Self> {
            Self::failing(name, delay_ms, 0)
        }

        fn failing(name: &'static str, delay_ms: u64, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StepOperation for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, input: &StepInput) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if n <= self.failures {
                anyhow::bail!("{} unavailable", self.name);
            }
            Ok(json!({ "service": self.name, "upstream": input.upstream.len() }))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval_ms: 100,
            max_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            max_attempts: 3,
            timeout_ms: 10_000,
        }
    }

    fn plan(fan_out: Vec<Arc<Scripted>>, settlement: Arc<Scripted>) -> OrchestrationPlan {
        OrchestrationPlan {
            prerequisite: Scripted::new("UserService", 10),
            fan_out: fan_out
                .into_iter()
                .map(|op| op as Arc<dyn StepOperation>)
                .collect(),
            settlement,
            async_settlement: Arc::new(
                SimulatedPaymentGateway::new(ErrorInjector::new(false)).with_polls_to_settle(2),
            ),
            finalizer: Scripted::new("RecommendationService", 10),
        }
    }

    fn writer() -> ProcessWriter {
        ProcessWriter::detached(ProcessInstance::new("p1", ProcessKind::OrchestrationProcess))
    }

    #[test]
    fn test_plan_needs_two_fan_out_operations() {
        let plan = plan(vec![Scripted::new("OrderService", 0)], Scripted::new("PaymentService", 0));
        assert!(matches!(plan.validate(), Err(ProcessError::InvalidPlan(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_order_is_fixed() {
        // The second fan-out call finishes long before the first
        let plan = plan(
            vec![
                Scripted::new("OrderService", 500),
                Scripted::new("NotificationService", 10),
            ],
            Scripted::new("PaymentService", 50),
        );
        let orchestrator =
            Orchestrator::new(Arc::new(plan), policy(), PollConfig::default()).unwrap();

        let result = orchestrator
            .run(
                &OrchestrationRequest::new("user-1", 15_075),
                &StepInvoker::default(),
                &writer(),
            )
            .await
            .unwrap();

        assert_eq!(
            result.services(),
            vec![
                "UserService",
                "OrderService",
                "PaymentService",
                "NotificationService",
                "RecommendationService"
            ]
        );
        // The finalizer sees all four upstream outputs
        assert_eq!(result.stages[4].value["upstream"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_cancels_in_flight_calls() {
        let slow = Scripted::new("OrderService", 60_000);
        let plan = plan(
            vec![slow.clone(), Scripted::failing("NotificationService", 10, 10)],
            Scripted::new("PaymentService", 60_000),
        );
        let orchestrator =
            Orchestrator::new(Arc::new(plan), policy(), PollConfig::default()).unwrap();
        let start = tokio::time::Instant::now();

        let failure = orchestrator
            .run(
                &OrchestrationRequest::new("user-1", 100),
                &StepInvoker::default(),
                &writer(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.stage, "stage_b:NotificationService");
        assert!(!failure.timed_out);
        // Reported without waiting for the slow calls
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisite_retries_are_counted() {
        let mut plan = plan(
            vec![Scripted::new("OrderService", 0), Scripted::new("NotificationService", 0)],
            Scripted::new("PaymentService", 0),
        );
        plan.prerequisite = Scripted::failing("UserService", 0, 2);
        let orchestrator =
            Orchestrator::new(Arc::new(plan), policy(), PollConfig::default()).unwrap();

        let result = orchestrator
            .run(
                &OrchestrationRequest::new("user-1", 100),
                &StepInvoker::default(),
                &writer(),
            )
            .await
            .unwrap();

        assert_eq!(result.stages[0].attempts, 3);
        assert_eq!(result.total_services(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_settlement_is_polled() {
        let plan = plan(
            vec![Scripted::new("OrderService", 0), Scripted::new("NotificationService", 0)],
            Scripted::new("PaymentService", 0),
        );
        let polling = PollConfig::new(Duration::from_secs(5), 10, Duration::from_secs(600));
        let orchestrator = Orchestrator::new(Arc::new(plan), policy(), polling).unwrap();

        let result = orchestrator
            .run(
                &OrchestrationRequest::new("user-1", 15_075).with_async_settlement(true),
                &StepInvoker::default(),
                &writer(),
            )
            .await
            .unwrap();

        let settlement = &result.stages[2];
        assert_eq!(settlement.stage, Stage::C);
        // Two pending answers, then a terminal one
        assert_eq!(settlement.attempts, 3);
        assert!(result.execution_pattern.contains("AsyncPaymentService"));
    }
}
