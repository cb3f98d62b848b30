//! Orchestration Integration Tests
//!
//! Tests for the five-stage plan run through the engine: ordering,
//! retries, idempotent resubmission, cancellation and async settlement.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use conductor::adapters::{
    ErrorInjector, SimulatedApprovalDesk, SimulatedGreeter, SimulatedPaymentGateway, StepInput,
    StepOperation,
};
use conductor::core::{
    Engine, EngineSettings, OrchestrationPlan, OrchestrationRequest, PollConfig, RetryPolicy,
    Services, SignalReceipt,
};
use conductor::domain::{ProcessOutput, ProcessStatus, Stage};

/// Step that sleeps, fails a fixed number of times, then answers
struct CountingService {
    name: &'static str,
    delay: Duration,
    failures: u32,
    calls: AtomicU32,
}

impl CountingService {
    fn new(name: &'static str, delay_ms: u64) -> Arc<Self> {
        Self::flaky(name, delay_ms, 0)
    }

    fn flaky(name: &'static str, delay_ms: u64, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay: Duration::from_millis(delay_ms),
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepOperation for CountingService {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, input: &StepInput) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        if n <= self.failures {
            anyhow::bail!("{} connection refused", self.name);
        }
        let upstream: Vec<&str> = input.upstream.iter().map(|s| s.service.as_str()).collect();
        Ok(json!({ "service": self.name, "subject": input.subject, "basedOn": upstream }))
    }
}

struct Fixture {
    user: Arc<CountingService>,
    order: Arc<CountingService>,
    notification: Arc<CountingService>,
    payment: Arc<CountingService>,
    recommendation: Arc<CountingService>,
    gateway: Arc<SimulatedPaymentGateway>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            user: CountingService::new("UserService", 100),
            order: CountingService::new("OrderService", 300),
            notification: CountingService::new("NotificationService", 50),
            payment: CountingService::new("PaymentService", 200),
            recommendation: CountingService::new("RecommendationService", 100),
            gateway: Arc::new(
                SimulatedPaymentGateway::new(ErrorInjector::new(false))
                    .with_polls_to_settle(3)
                    .with_failure_rate(0),
            ),
        }
    }

    fn engine(&self) -> Engine {
        let plan = OrchestrationPlan {
            prerequisite: self.user.clone(),
            fan_out: vec![
                self.order.clone() as Arc<dyn StepOperation>,
                self.notification.clone(),
            ],
            settlement: self.payment.clone(),
            async_settlement: self.gateway.clone(),
            finalizer: self.recommendation.clone(),
        };
        let services = Services {
            plan: Arc::new(plan),
            approvals: Arc::new(SimulatedApprovalDesk::new(ErrorInjector::new(false))),
            greeter: Arc::new(SimulatedGreeter),
        };
        let settings = EngineSettings {
            retry: RetryPolicy {
                initial_interval_ms: 1_000,
                max_interval_ms: 10_000,
                backoff_coefficient: 2.0,
                max_attempts: 3,
                timeout_ms: 30_000,
            },
            polling: PollConfig::new(Duration::from_secs(10), 20, Duration::from_secs(600)),
            ..Default::default()
        };
        Engine::new(services, settings).unwrap()
    }
}

const WAIT: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn test_aggregate_order_ignores_completion_order() {
    let fixture = Fixture::new();
    let engine = fixture.engine();

    engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 15_075))
        .await
        .unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    assert_eq!(done.status, ProcessStatus::Completed);
    let aggregate = done.aggregate().unwrap();
    // NotificationService finished first but keeps its plan position
    assert_eq!(
        aggregate.services(),
        vec![
            "UserService",
            "OrderService",
            "PaymentService",
            "NotificationService",
            "RecommendationService"
        ]
    );
    let stages: Vec<Stage> = aggregate.stages.iter().map(|s| s.stage).collect();
    assert_eq!(stages, vec![Stage::A, Stage::B, Stage::C, Stage::B, Stage::D]);
    assert_eq!(
        aggregate.get("RecommendationService").unwrap().value["basedOn"],
        json!(["UserService", "OrderService", "PaymentService", "NotificationService"])
    );
}

#[tokio::test(start_paused = true)]
async fn test_prerequisite_retries_leave_output_unchanged() {
    let clean = Fixture::new();
    let engine = clean.engine();
    engine
        .submit_orchestration("p0", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    let baseline = engine.wait_for_result("p0", WAIT).await.unwrap();

    let mut flaky = Fixture::new();
    flaky.user = CountingService::flaky("UserService", 100, 2);
    let engine = flaky.engine();
    engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    let retried = engine.wait_for_result("p1", WAIT).await.unwrap();

    assert_eq!(retried.status, ProcessStatus::Completed);
    let baseline = baseline.aggregate().unwrap();
    let retried = retried.aggregate().unwrap();

    assert_eq!(retried.stages[0].attempts, 3);
    assert_eq!(baseline.stages[0].attempts, 1);
    assert_eq!(retried.services(), baseline.services());
    assert_eq!(retried.values(), baseline.values());
    assert_eq!(flaky.user.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_resubmission_does_not_execute_again() {
    let fixture = Fixture::new();
    let engine = fixture.engine();

    let first = engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    assert!(first.created);
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    let again = engine
        .submit_orchestration("p1", OrchestrationRequest::new("someone-else", 1))
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.instance, done);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fixture.user.calls(), 1);
    assert_eq!(fixture.order.calls(), 1);
    assert_eq!(fixture.recommendation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_failure_fails_process_and_skips_finalizer() {
    let mut fixture = Fixture::new();
    fixture.order = CountingService::new("OrderService", 600_000);
    fixture.notification = CountingService::flaky("NotificationService", 50, 10);
    let engine = fixture.engine();

    engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    assert_eq!(done.status, ProcessStatus::Failed);
    let failure = done.failure.unwrap();
    assert_eq!(failure.stage, "stage_b:NotificationService");
    assert!(failure.cause.contains("connection refused"));
    assert_eq!(fixture.notification.calls(), 3);
    assert_eq!(fixture.recommendation.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_step_times_out_and_fails_the_stage() {
    let mut fixture = Fixture::new();
    fixture.payment = CountingService::new("PaymentService", 120_000);
    let engine = fixture.engine();

    engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    // Every attempt exceeded its timeout, so the retry budget ran out
    assert_eq!(done.status, ProcessStatus::Failed);
    assert_eq!(done.failure.unwrap().stage, "stage_c:PaymentService");
    assert_eq!(fixture.payment.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_async_settlement_polls_until_done() {
    let fixture = Fixture::new();
    let engine = fixture.engine();

    engine
        .submit_orchestration(
            "p1",
            OrchestrationRequest::new("user-1", 15_075).with_async_settlement(true),
        )
        .await
        .unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    assert_eq!(done.status, ProcessStatus::Completed);
    let aggregate = done.aggregate().unwrap();
    let settlement = aggregate.get("AsyncPaymentService").unwrap();
    assert_eq!(settlement.stage, Stage::C);
    // Three PROCESSING answers, then COMPLETED
    assert_eq!(settlement.attempts, 4);
    assert_eq!(settlement.value["status"], "COMPLETED");
    assert_eq!(settlement.value["amount"], "150.75");
    assert_eq!(fixture.payment.calls(), 0);
    assert_eq!(fixture.gateway.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_plan_abandons_pending_settlement() {
    let mut fixture = Fixture::new();
    fixture.notification = CountingService::flaky("NotificationService", 50, 10);
    let engine = fixture.engine();

    engine
        .submit_orchestration(
            "p1",
            OrchestrationRequest::new("user-1", 15_075).with_async_settlement(true),
        )
        .await
        .unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();

    // Stage B gave up while the payment was still processing
    assert_eq!(done.status, ProcessStatus::Failed);
    assert_eq!(done.failure.unwrap().stage, "stage_b:NotificationService");
    assert_eq!(fixture.gateway.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_pending_settlement() {
    let mut fixture = Fixture::new();
    fixture.gateway = Arc::new(
        SimulatedPaymentGateway::new(ErrorInjector::new(false)).with_polls_to_settle(100),
    );
    let engine = fixture.engine();

    engine
        .submit_orchestration(
            "p1",
            OrchestrationRequest::new("user-1", 15_075).with_async_settlement(true),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(fixture.gateway.in_flight(), 1);

    engine.cancel("p1").unwrap();
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();
    assert_eq!(done.status, ProcessStatus::Cancelled);
    assert_eq!(fixture.gateway.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_a_running_plan() {
    let mut fixture = Fixture::new();
    fixture.order = CountingService::new("OrderService", 600_000);
    let engine = fixture.engine();

    engine
        .submit_orchestration("p1", OrchestrationRequest::new("user-1", 100))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(engine.cancel("p1").unwrap(), SignalReceipt::Accepted);
    let done = engine.wait_for_result("p1", WAIT).await.unwrap();
    assert_eq!(done.status, ProcessStatus::Cancelled);
    assert_eq!(done.current_stage_label, "stage_b+stage_c");
    assert!(done.result.is_none());

    // Cancelling a finished process has no effect
    assert_eq!(engine.cancel("p1").unwrap(), SignalReceipt::Ignored);
    assert_eq!(fixture.recommendation.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_simulated_services_complete_the_plan() {
    let services = Services::simulated(&Default::default(), ErrorInjector::new(false));
    let engine = Engine::new(services, EngineSettings::default()).unwrap();

    engine
        .submit_orchestration("sim", OrchestrationRequest::new("user-7", 2_500))
        .await
        .unwrap();
    let done = engine.wait_for_result("sim", WAIT).await.unwrap();

    match done.result {
        Some(ProcessOutput::Orchestration(aggregate)) => {
            assert_eq!(aggregate.total_services(), 5);
            assert_eq!(aggregate.subject, "user-7");
        }
        other => panic!("expected an aggregate, got {:?}", other),
    }
}
