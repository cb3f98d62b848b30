//! Simulated external services.
//!
//! These stand in for the remote systems a real deployment would call.
//! Each one sleeps for a random latency and can inject random transient
//! errors, so retry and polling behavior can be observed end to end.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{ApprovalRequest, Decision, PaymentState, PaymentTrackingEntry};

use super::{
    ApprovalActions, AsyncOperation, GreetingActions, PollStatus, StepInput, StepOperation,
};

const ERROR_MESSAGES: &[&str] = &[
    "Service temporarily unavailable",
    "Network timeout occurred",
    "Database connection failed",
    "Service overloaded",
    "Temporary server error",
];

/// Random transient error generator, switchable at runtime
#[derive(Debug, Clone, Default)]
pub struct ErrorInjector {
    enabled: Arc<AtomicBool>,
}

impl ErrorInjector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!("Error simulation {}", if enabled { "ENABLED" } else { "DISABLED" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Roll against `rate` percent; always false while disabled
    pub fn should_fail(&self, rate: u8) -> bool {
        if !self.is_enabled() || rate == 0 {
            return false;
        }
        if rate >= 100 {
            return true;
        }
        rand::thread_rng().gen_range(1..=100u8) <= rate
    }

    pub fn maybe_fail(&self, rate: u8, service: &str) -> Result<()> {
        if self.should_fail(rate) {
            let message = ERROR_MESSAGES[rand::thread_rng().gen_range(0..ERROR_MESSAGES.len())];
            warn!(service, message, "Simulating error");
            anyhow::bail!("{}: {}", service, message);
        }
        Ok(())
    }
}

/// Simulated network latency range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Latency {
    pub const fn none() -> Self {
        Self { min_ms: 0, max_ms: 0 }
    }

    pub const fn between(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }

    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for Latency {
    fn default() -> Self {
        Self::none()
    }
}

fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// A synchronous external service returning a JSON document
pub struct SimulatedService {
    name: String,
    latency: Latency,
    error_rate: u8,
    post_error_rate: u8,
    execution_order: &'static str,
    data: fn(&StepInput) -> Value,
    injector: ErrorInjector,
    calls: AtomicU32,
}

impl SimulatedService {
    fn new(
        name: &str,
        error_rate: u8,
        execution_order: &'static str,
        data: fn(&StepInput) -> Value,
        injector: ErrorInjector,
    ) -> Self {
        Self {
            name: name.to_string(),
            latency: Latency::none(),
            error_rate,
            post_error_rate: 0,
            execution_order,
            data,
            injector,
            calls: AtomicU32::new(0),
        }
    }

    pub fn user_service(injector: ErrorInjector) -> Self {
        let mut service = Self::new(
            "UserService",
            35,
            "1-sequential-first",
            |_| json!({"name": "John Doe", "email": "john.doe@example.com", "status": "active"}),
            injector,
        );
        service.post_error_rate = 25;
        service
    }

    pub fn order_service(injector: ErrorInjector) -> Self {
        Self::new(
            "OrderService",
            45,
            "2-parallel-with-notifications",
            |_| json!({"totalOrders": 5, "lastOrder": "2024-01-15", "totalAmount": 1250.50}),
            injector,
        )
    }

    pub fn notification_service(injector: ErrorInjector) -> Self {
        Self::new(
            "NotificationService",
            30,
            "2-parallel-with-orders",
            |_| json!({"unreadCount": 3, "preferences": {"email": true, "sms": false, "push": true}}),
            injector,
        )
    }

    pub fn payment_service(injector: ErrorInjector) -> Self {
        let mut service = Self::new(
            "PaymentService",
            50,
            "3-sequential-after-user",
            |input| {
                json!({
                    "paymentMethods": ["**** 1234", "**** 5678"],
                    "defaultMethod": "**** 1234",
                    "amountCents": input.amount_cents,
                })
            },
            injector,
        );
        service.post_error_rate = 30;
        service
    }

    pub fn recommendation_service(injector: ErrorInjector) -> Self {
        Self::new(
            "RecommendationService",
            40,
            "5-sequential-last",
            |input| {
                let based_on: Vec<&str> = input.upstream.iter().map(|s| s.service.as_str()).collect();
                json!({
                    "recommendations": ["Product A", "Product B", "Product C"],
                    "confidence": 0.85,
                    "algorithm": "collaborative-filtering",
                    "basedOn": based_on,
                })
            },
            injector,
        )
    }

    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_error_rate(mut self, error_rate: u8) -> Self {
        self.error_rate = error_rate;
        self
    }

    /// Number of calls received, including failed ones
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepOperation for SimulatedService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, input: &StepInput) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        info!(service = %self.name, subject = %input.subject, "Starting service call");

        self.injector.maybe_fail(self.error_rate, &self.name)?;
        self.latency.wait().await;
        self.injector
            .maybe_fail(self.post_error_rate, &format!("{}-PostProcessing", self.name))?;

        Ok(json!({
            "service": self.name,
            "userId": input.subject,
            "data": (self.data)(input),
            "timestamp": timestamp(),
            "executionOrder": self.execution_order,
        }))
    }
}

struct TrackedPayment {
    entry: PaymentTrackingEntry,
    /// Polls answered with PROCESSING before the payment settles
    settle_after: u32,
}

enum PollDecision {
    Processing(u32),
    Settled(PaymentTrackingEntry),
}

/// Asynchronous payment service with an in-memory tracking map
pub struct SimulatedPaymentGateway {
    tracker: DashMap<String, TrackedPayment>,
    latency: Latency,
    /// Fixed number of PROCESSING answers; random 2..=8 when unset
    polls_to_settle: Option<u32>,
    failure_rate: u8,
    injector: ErrorInjector,
}

impl SimulatedPaymentGateway {
    pub fn new(injector: ErrorInjector) -> Self {
        Self {
            tracker: DashMap::new(),
            latency: Latency::none(),
            polls_to_settle: None,
            failure_rate: 20,
            injector,
        }
    }

    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_polls_to_settle(mut self, polls: u32) -> Self {
        self.polls_to_settle = Some(polls);
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: u8) -> Self {
        self.failure_rate = failure_rate;
        self
    }

    /// Snapshot of a tracked payment, if it is still in flight
    pub fn entry(&self, payment_id: &str) -> Option<PaymentTrackingEntry> {
        self.tracker.get(payment_id).map(|p| p.entry.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[async_trait]
impl AsyncOperation for SimulatedPaymentGateway {
    fn name(&self) -> &str {
        "AsyncPaymentService"
    }

    async fn initiate(&self, input: &StepInput) -> Result<String> {
        let payment_id = format!("payment-{}", Uuid::new_v4());
        info!(
            subject = %input.subject,
            amount_cents = input.amount_cents,
            %payment_id,
            "Initiating async payment"
        );

        self.injector.maybe_fail(20, "AsyncPaymentService-Initiation")?;
        self.latency.wait().await;

        let settle_after = self
            .polls_to_settle
            .unwrap_or_else(|| rand::thread_rng().gen_range(2..=8));
        let entry = PaymentTrackingEntry::new(&payment_id, &input.subject, input.amount_cents);
        self.tracker
            .insert(payment_id.clone(), TrackedPayment { entry, settle_after });

        Ok(payment_id)
    }

    async fn check_status(&self, operation_id: &str) -> Result<PollStatus<Value>> {
        self.injector.maybe_fail(15, "AsyncPaymentService-Poll")?;
        self.latency.wait().await;

        // The shard guard must be released before the entry is removed.
        let decision = {
            let mut tracked = self
                .tracker
                .get_mut(operation_id)
                .with_context(|| format!("Payment not found: {}", operation_id))?;
            let settle_after = tracked.settle_after;
            let poll_count = tracked.entry.record_poll();
            info!(payment_id = operation_id, poll_count, state = ?tracked.entry.state, "Payment polled");

            if poll_count <= settle_after {
                tracked.entry.state = PaymentState::Processing;
                PollDecision::Processing(poll_count)
            } else {
                PollDecision::Settled(tracked.entry.clone())
            }
        };

        let mut entry = match decision {
            PollDecision::Processing(poll_count) => {
                self.injector.maybe_fail(10, "AsyncPaymentService-Processing")?;
                info!(payment_id = operation_id, poll_count, "Payment still processing");
                return Ok(PollStatus::Pending);
            }
            PollDecision::Settled(entry) => entry,
        };

        self.tracker.remove(operation_id);

        let mut payload = json!({
            "service": self.name(),
            "paymentId": entry.id,
            "userId": entry.owner_key,
            "amount": entry.amount_display(),
            "timestamp": timestamp(),
            "totalPolls": entry.poll_count,
        });

        if self.injector.should_fail(self.failure_rate) {
            entry.state = PaymentState::Failed;
            payload["status"] = json!(entry.state);
            payload["error"] = json!("Payment processing failed");
            error!(payment_id = operation_id, polls = entry.poll_count, "Payment failed");
            return Ok(PollStatus::Failed(payload));
        }

        entry.state = PaymentState::Completed;
        let processing_ms = (entry.last_updated_at - entry.initiated_at).num_milliseconds();
        payload["status"] = json!(entry.state);
        payload["processingTimeMs"] = json!(processing_ms);
        payload["transactionId"] = json!(format!("txn-{}", &Uuid::new_v4().simple().to_string()[..8]));
        info!(payment_id = operation_id, polls = entry.poll_count, "Payment completed");
        Ok(PollStatus::Succeeded(payload))
    }

    fn abandon(&self, operation_id: &str) {
        if let Some((_, tracked)) = self.tracker.remove(operation_id) {
            warn!(
                payment_id = operation_id,
                polls = tracked.entry.poll_count,
                "Payment abandoned before settling"
            );
        }
    }
}

/// Approval side effects that only log what a real system would send
#[derive(Default)]
pub struct SimulatedApprovalDesk {
    latency: Latency,
    injector: ErrorInjector,
    notifications: Mutex<Vec<String>>,
}

impl SimulatedApprovalDesk {
    pub fn new(injector: ErrorInjector) -> Self {
        Self {
            latency: Latency::none(),
            injector,
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Latency) -> Self {
        self.latency = latency;
        self
    }

    /// Every requester notification sent so far
    pub fn notifications(&self) -> Vec<String> {
        self.notifications
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalActions for SimulatedApprovalDesk {
    async fn notify_approvers(&self, request: &ApprovalRequest) -> Result<()> {
        self.latency.wait().await;
        info!(
            request_id = %request.request_id,
            request_type = request.request_type.as_deref().unwrap_or("ACCESS_REQUEST"),
            requester = %request.requester,
            "Approval notification sent"
        );
        Ok(())
    }

    async fn notify_requester(&self, requester: &str, message: &str) -> Result<()> {
        self.latency.wait().await;
        info!(requester, message, "Requester notification sent");
        if let Ok(mut sent) = self.notifications.lock() {
            sent.push(format!("{}: {}", requester, message));
        }
        Ok(())
    }

    async fn execute_approved_action(&self, request: &ApprovalRequest) -> Result<String> {
        self.injector.maybe_fail(10, "ApprovedActionExecutor")?;
        self.latency.wait().await;

        let rng_value = || rand::thread_rng().gen_range(0..100_000u32);
        let result = match request.request_type.as_deref() {
            Some("BUDGET_REQUEST") => {
                format!("Budget allocated. Reference: BUDGET-{}", Utc::now().timestamp_millis())
            }
            Some("PERSONNEL_CHANGE") => {
                format!("Personnel record updated. Employee ID: EMP-{}", rng_value() % 10_000)
            }
            Some("SYSTEM_ACCESS") => {
                format!("System access granted. Access token: TOK-{}", rng_value())
            }
            Some("PROCUREMENT") => {
                format!("Purchase order created. PO Number: PO-{}", Utc::now().timestamp_millis())
            }
            Some("POLICY_EXCEPTION") => {
                format!("Exception granted. Exception ID: EXC-{}", rng_value() % 1_000)
            }
            _ => "Action executed with generic handler".to_string(),
        };

        info!(request_id = %request.request_id, %result, "Approved action executed");
        Ok(result)
    }

    async fn log_decision(
        &self,
        request_id: &str,
        decision: Decision,
        approver: &str,
        comment: &str,
    ) -> Result<()> {
        info!(request_id, %decision, approver, comment, "Decision logged");
        Ok(())
    }
}

/// Greeting steps of the simple process
#[derive(Debug, Default)]
pub struct SimulatedGreeter;

#[async_trait]
impl GreetingActions for SimulatedGreeter {
    async fn say_hello(&self, name: &str) -> Result<String> {
        Ok(format!("Hello, {}!", name))
    }

    async fn create_greeting(&self, greeting: &str, name: &str) -> Result<String> {
        Ok(format!("{}, {}!", greeting, name))
    }
}
