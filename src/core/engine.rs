//! Submission, signalling and query surface over the registry.
//!
//! Every accepted submission gets exactly one spawned task that drives the
//! process to a terminal status. Resubmitting under an existing key returns
//! the instance already registered and starts nothing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::adapters::{
    ApprovalActions, ErrorInjector, GreetingActions, HttpServiceConfig, HttpServices,
    HttpStepOperation, SimulatedApprovalDesk, SimulatedGreeter, SimulatedPaymentGateway,
    SimulatedService, StepOperation,
};
use crate::config::SimulationConfig;
use crate::domain::{
    ApprovalRequest, EventType, ProcessEvent, ProcessInstance, ProcessKind, ProcessOutput,
    ProcessStatus, StepResult,
};

use super::approval::{
    ApprovalConfig, ApprovalGate, ApprovalSnapshot, GateHandle, SignalReceipt,
};
use super::error::{ProcessError, StageFailure};
use super::journal::{EventSink, Journal};
use super::orchestrator::{OrchestrationPlan, OrchestrationRequest, Orchestrator};
use super::poller::PollConfig;
use super::registry::{ProcessEntry, ProcessRegistry, ProcessWriter};
use super::retry::{RetryPolicy, StepInvoker};

/// Remote services the engine drives
pub struct Services {
    pub plan: Arc<OrchestrationPlan>,
    pub approvals: Arc<dyn ApprovalActions>,
    pub greeter: Arc<dyn GreetingActions>,
}

impl Services {
    /// In-process stand-ins for every remote service
    pub fn simulated(config: &SimulationConfig, injector: ErrorInjector) -> Self {
        Self::configured(config, injector, &HttpServices::default())
    }

    /// Simulated services, except for the plan slots with an HTTP endpoint
    pub fn configured(
        config: &SimulationConfig,
        injector: ErrorInjector,
        http: &HttpServices,
    ) -> Self {
        let latency = config.latency();
        let slot = |endpoint: &Option<HttpServiceConfig>,
                    service: SimulatedService|
         -> Arc<dyn StepOperation> {
            match endpoint {
                Some(endpoint) => {
                    info!(service = %endpoint.name, url = %endpoint.url, "Using HTTP service");
                    Arc::new(HttpStepOperation::from_config(endpoint.clone()))
                }
                None => Arc::new(service.with_latency(latency)),
            }
        };

        let mut gateway = SimulatedPaymentGateway::new(injector.clone())
            .with_latency(latency)
            .with_failure_rate(config.payment_failure_rate);
        if let Some(polls) = config.polls_to_settle {
            gateway = gateway.with_polls_to_settle(polls);
        }

        let plan = OrchestrationPlan {
            prerequisite: slot(&http.user, SimulatedService::user_service(injector.clone())),
            fan_out: vec![
                slot(&http.order, SimulatedService::order_service(injector.clone())),
                slot(
                    &http.notification,
                    SimulatedService::notification_service(injector.clone()),
                ),
            ],
            settlement: slot(&http.payment, SimulatedService::payment_service(injector.clone())),
            async_settlement: Arc::new(gateway),
            finalizer: slot(
                &http.recommendation,
                SimulatedService::recommendation_service(injector.clone()),
            ),
        };

        Self {
            plan: Arc::new(plan),
            approvals: Arc::new(SimulatedApprovalDesk::new(injector).with_latency(latency)),
            greeter: Arc::new(SimulatedGreeter),
        }
    }
}

/// Policies applied to every process the engine starts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub polling: PollConfig,
    pub approval: ApprovalConfig,
}

/// Answer to a submission
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub instance: ProcessInstance,

    /// False when the key was already registered
    pub created: bool,
}

/// Non-blocking result lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultQuery {
    Pending { status: ProcessStatus, stage: String },
    Ready(ProcessInstance),
}

/// How an execution task ended
enum Conclusion {
    Finished(ProcessStatus, ProcessOutput),
    Failed(StageFailure),
    Cancelled,
}

pub struct Engine {
    registry: Arc<ProcessRegistry>,
    orchestrator: Arc<Orchestrator>,
    approvals: Arc<dyn ApprovalActions>,
    greeter: Arc<dyn GreetingActions>,
    settings: EngineSettings,
    journal: Option<Arc<Journal>>,
}

impl Engine {
    pub fn new(services: Services, settings: EngineSettings) -> Result<Self, ProcessError> {
        settings.approval.validate()?;
        let orchestrator = Orchestrator::new(
            services.plan,
            settings.retry.clone(),
            settings.polling.clone(),
        )?;

        Ok(Self {
            registry: Arc::new(ProcessRegistry::new()),
            orchestrator: Arc::new(orchestrator),
            approvals: services.approvals,
            greeter: services.greeter,
            settings,
            journal: None,
        })
    }

    /// Record an audit trail of every process under the journal directory
    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    fn invoker(&self, key: &str) -> StepInvoker {
        StepInvoker::new(EventSink::new(key, self.journal.clone()))
    }

    /// Start the two-step greeting process
    pub async fn submit_simple(&self, key: &str, name: &str) -> Result<Submission, ProcessError> {
        let (entry, created) = self.registry.claim(key, ProcessKind::SimpleProcess, None)?;
        if !created {
            return Ok(self.existing(key, ProcessKind::SimpleProcess, &entry));
        }

        let invoker = self.invoker(key);
        record_submitted(&invoker, ProcessKind::SimpleProcess, name).await;

        let greeter = self.greeter.clone();
        let policy = self.settings.retry.clone();
        let name = name.to_string();
        let writer = ProcessWriter::new(entry.clone());
        let cancel = entry.cancel_requested();

        tokio::spawn(async move {
            let conclusion = until_cancelled(cancel, async {
                let hello = match greet_step(&invoker, &policy, &writer, "say_hello", || {
                    greeter.say_hello(&name)
                })
                .await
                {
                    Ok(hello) => hello,
                    Err(failure) => return Conclusion::Failed(failure),
                };
                let greeting = match greet_step(&invoker, &policy, &writer, "create_greeting", || {
                    greeter.create_greeting("Welcome", &name)
                })
                .await
                {
                    Ok(greeting) => greeting,
                    Err(failure) => return Conclusion::Failed(failure),
                };

                Conclusion::Finished(
                    ProcessStatus::Completed,
                    ProcessOutput::Simple(format!("{} {}", hello, greeting)),
                )
            })
            .await;
            conclude(&writer, &invoker, conclusion).await;
        });

        Ok(Submission {
            instance: entry.snapshot(),
            created,
        })
    }

    /// Start the five-stage orchestration
    pub async fn submit_orchestration(
        &self,
        key: &str,
        request: OrchestrationRequest,
    ) -> Result<Submission, ProcessError> {
        let (entry, created) =
            self.registry
                .claim(key, ProcessKind::OrchestrationProcess, None)?;
        if !created {
            return Ok(self.existing(key, ProcessKind::OrchestrationProcess, &entry));
        }

        let invoker = self.invoker(key);
        record_submitted(&invoker, ProcessKind::OrchestrationProcess, &request.subject).await;

        let orchestrator = self.orchestrator.clone();
        let writer = ProcessWriter::new(entry.clone());
        let cancel = entry.cancel_requested();

        tokio::spawn(async move {
            let conclusion = until_cancelled(cancel, async {
                match orchestrator.run(&request, &invoker, &writer).await {
                    Ok(aggregate) => Conclusion::Finished(
                        ProcessStatus::Completed,
                        ProcessOutput::Orchestration(aggregate),
                    ),
                    Err(failure) => Conclusion::Failed(failure),
                }
            })
            .await;
            conclude(&writer, &invoker, conclusion).await;
        });

        Ok(Submission {
            instance: entry.snapshot(),
            created,
        })
    }

    /// Start an approval gate
    pub async fn submit_approval(
        &self,
        key: &str,
        request: ApprovalRequest,
    ) -> Result<Submission, ProcessError> {
        let invoker = self.invoker(key);
        let (gate, handle) = ApprovalGate::new(
            request.clone(),
            self.settings.approval.clone(),
            self.approvals.clone(),
            invoker.clone(),
        );

        let (entry, created) =
            self.registry
                .claim(key, ProcessKind::ApprovalProcess, Some(handle))?;
        if !created {
            return Ok(self.existing(key, ProcessKind::ApprovalProcess, &entry));
        }

        record_submitted(&invoker, ProcessKind::ApprovalProcess, &request.request_id).await;
        let writer = ProcessWriter::new(entry.clone());

        tokio::spawn(async move {
            let conclusion = match gate.run(&writer).await {
                Ok(outcome) => Conclusion::Finished(
                    ApprovalGate::process_status(outcome.decision),
                    ProcessOutput::Approval(outcome),
                ),
                Err(failure) => Conclusion::Failed(failure),
            };
            conclude(&writer, &invoker, conclusion).await;
        });

        Ok(Submission {
            instance: entry.snapshot(),
            created,
        })
    }

    fn existing(&self, key: &str, kind: ProcessKind, entry: &ProcessEntry) -> Submission {
        let instance = entry.snapshot();
        if instance.kind != kind {
            warn!(
                key,
                requested = ?kind,
                registered = ?instance.kind,
                "Key already used by a process of another kind"
            );
        } else {
            info!(key, status = %instance.status, "Returning existing process");
        }
        Submission {
            instance,
            created: false,
        }
    }

    pub fn approve(
        &self,
        key: &str,
        who: &str,
        comment: Option<&str>,
    ) -> Result<SignalReceipt, ProcessError> {
        let entry = self.registry.get(key)?;
        let gate = signalable(key, &entry)?;
        Ok(gate.approve(who, comment))
    }

    pub fn reject(
        &self,
        key: &str,
        who: &str,
        reason: Option<&str>,
    ) -> Result<SignalReceipt, ProcessError> {
        let entry = self.registry.get(key)?;
        let gate = signalable(key, &entry)?;
        Ok(gate.reject(who, reason))
    }

    /// Stop a process that has not finished yet
    pub fn cancel(&self, key: &str) -> Result<SignalReceipt, ProcessError> {
        let entry = self.registry.get(key)?;
        if entry.is_terminal() {
            return Ok(SignalReceipt::Ignored);
        }

        let receipt = match entry.gate() {
            Some(gate) => {
                let receipt = gate.cancel();
                if receipt == SignalReceipt::Accepted {
                    entry.request_cancel();
                }
                receipt
            }
            None if entry.request_cancel() => SignalReceipt::Accepted,
            None => SignalReceipt::Ignored,
        };
        info!(key, ?receipt, "Cancellation requested");
        Ok(receipt)
    }

    pub fn status(&self, key: &str) -> Result<ProcessInstance, ProcessError> {
        self.registry.status(key)
    }

    pub fn approval_status(&self, key: &str) -> Result<ApprovalSnapshot, ProcessError> {
        let entry = self.registry.get(key)?;
        Ok(signalable(key, &entry)?.snapshot())
    }

    /// Result if the process is done, otherwise where it currently is
    pub fn result(&self, key: &str) -> Result<ResultQuery, ProcessError> {
        let instance = self.registry.status(key)?;
        if instance.is_terminal() {
            return Ok(ResultQuery::Ready(instance));
        }
        Ok(ResultQuery::Pending {
            status: instance.status,
            stage: instance.current_stage_label,
        })
    }

    /// Wait up to `timeout` for the process to reach a terminal status
    pub async fn wait_for_result(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<ProcessInstance, ProcessError> {
        let entry = self.registry.get(key)?;
        let mut updates = entry.subscribe();

        let finished =
            match tokio::time::timeout(timeout, updates.wait_for(ProcessInstance::is_terminal))
                .await
            {
                Ok(Ok(instance)) => Ok(instance.clone()),
                Ok(Err(_)) => Ok(entry.snapshot()),
                Err(_) => Err(ProcessError::WaitTimedOut(key.to_string())),
            };
        finished
    }

    /// Journaled events of a process
    pub async fn history(&self, key: &str) -> anyhow::Result<Vec<ProcessEvent>> {
        match &self.journal {
            Some(journal) => journal.replay(key).await,
            None => Ok(Vec::new()),
        }
    }
}

fn signalable<'a>(
    key: &str,
    entry: &'a ProcessEntry,
) -> Result<&'a GateHandle, ProcessError> {
    entry.gate().ok_or_else(|| ProcessError::NotSignalable {
        id: key.to_string(),
        kind: entry.kind(),
    })
}

async fn greet_step<F, Fut>(
    invoker: &StepInvoker,
    policy: &RetryPolicy,
    writer: &ProcessWriter,
    label: &str,
    mut step: F,
) -> Result<String, StageFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    if let Err(e) = writer.advance(ProcessStatus::Running, label) {
        warn!(error = %e, "Step started on a closed process");
    }
    match invoker.invoke(label, policy, |_| step()).await {
        StepResult::Success { value, .. } => Ok(value),
        StepResult::Failed { cause, .. } => Err(StageFailure::failed(label, cause)),
        StepResult::TimedOut => Err(StageFailure::timed_out(label, "step timed out")),
    }
}

/// Run `work` unless cancellation is requested first
async fn until_cancelled(
    mut cancel: watch::Receiver<bool>,
    work: impl Future<Output = Conclusion>,
) -> Conclusion {
    tokio::select! {
        conclusion = work => conclusion,
        _ = cancelled(&mut cancel) => Conclusion::Cancelled,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Registry entry dropped; nobody can cancel anymore
            std::future::pending::<()>().await;
        }
    }
}

async fn record_submitted(invoker: &StepInvoker, kind: ProcessKind, subject: &str) {
    let sink = invoker.sink();
    info!(process_id = sink.process_id(), ?kind, subject, "Process submitted");
    sink.record(ProcessEvent::new(
        sink.process_id(),
        None,
        EventType::ProcessSubmitted,
        format!("{:?} submitted for '{}'", kind, subject),
    ))
    .await;
}

/// Write the terminal state and its journal event
async fn conclude(writer: &ProcessWriter, invoker: &StepInvoker, conclusion: Conclusion) {
    let (written, event_type, summary, error) = match conclusion {
        Conclusion::Finished(status, output) => {
            let event_type = match status {
                ProcessStatus::Rejected => EventType::ProcessRejected,
                ProcessStatus::TimedOut => EventType::ProcessTimedOut,
                ProcessStatus::Cancelled => EventType::ProcessCancelled,
                _ => EventType::ProcessCompleted,
            };
            (
                writer.finish(status, Some(output)),
                event_type,
                format!("Process finished as {}", status),
                None,
            )
        }
        Conclusion::Failed(failure) => {
            let (status, event_type) = if failure.timed_out {
                (ProcessStatus::TimedOut, EventType::ProcessTimedOut)
            } else {
                (ProcessStatus::Failed, EventType::ProcessFailed)
            };
            warn!(stage = %failure.stage, cause = %failure.cause, %status, "Process did not complete");
            (
                writer.fail(status, &failure.stage, &failure.cause),
                event_type,
                format!("Process stopped at {}", failure.stage),
                Some(failure.cause),
            )
        }
        Conclusion::Cancelled => {
            let stage = writer.snapshot().current_stage_label;
            info!(%stage, "Process cancelled");
            (
                writer.fail(ProcessStatus::Cancelled, &stage, "cancelled on request"),
                EventType::ProcessCancelled,
                format!("Process cancelled at {}", stage),
                None,
            )
        }
    };

    if let Err(e) = written {
        warn!(error = %e, "Terminal state already recorded");
        return;
    }

    let sink = invoker.sink();
    let mut event = ProcessEvent::new(sink.process_id(), None, event_type, summary);
    if let Some(error) = error {
        event = event.with_error(error);
    }
    sink.record(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingGreeter {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl GreetingActions for CountingGreeter {
        async fn say_hello(&self, name: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                anyhow::bail!("greeter warming up");
            }
            Ok(format!("Hello, {}!", name))
        }

        async fn create_greeting(&self, greeting: &str, name: &str) -> Result<String> {
            Ok(format!("{}, {}!", greeting, name))
        }
    }

    fn engine(fail_first: u32) -> (Engine, Arc<CountingGreeter>) {
        let greeter = Arc::new(CountingGreeter {
            calls: AtomicU32::new(0),
            fail_first,
        });
        let mut services =
            Services::simulated(&SimulationConfig::default(), ErrorInjector::new(false));
        services.greeter = greeter.clone();
        let settings = EngineSettings {
            retry: RetryPolicy::fixed(Duration::from_secs(1), 3, Duration::from_secs(10)),
            ..Default::default()
        };
        (Engine::new(services, settings).unwrap(), greeter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_process_joins_both_steps() {
        let (engine, _) = engine(1);
        let submission = engine.submit_simple("hello-ada", "Ada").await.unwrap();
        assert!(submission.created);

        let done = engine
            .wait_for_result("hello-ada", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(done.status, ProcessStatus::Completed);
        assert_eq!(
            done.result,
            Some(ProcessOutput::Simple("Hello, Ada! Welcome, Ada!".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_process_fails_after_budget() {
        let (engine, greeter) = engine(10);
        engine.submit_simple("hello-bob", "Bob").await.unwrap();

        let done = engine
            .wait_for_result("hello-bob", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.failure.unwrap().stage, "say_hello");
        assert_eq!(greeter.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_http_endpoints_replace_their_slots() {
        let http = HttpServices {
            user: Some(HttpServiceConfig {
                name: "RemoteUsers".to_string(),
                url: "http://users.internal/lookup".to_string(),
                token: None,
            }),
            ..Default::default()
        };
        let services =
            Services::configured(&SimulationConfig::default(), ErrorInjector::new(false), &http);

        assert_eq!(services.plan.prerequisite.name(), "RemoteUsers");
        assert_eq!(services.plan.fan_out[0].name(), "OrderService");
        assert_eq!(services.plan.finalizer.name(), "RecommendationService");
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_query_does_not_block() {
        let (engine, _) = engine(0);
        assert!(engine.result("nope").unwrap_err().is_not_found());

        engine
            .submit_approval(
                "approval-1",
                ApprovalRequest::new("1", "Grant database access", "alice"),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;

        match engine.result("approval-1").unwrap() {
            ResultQuery::Pending { status, .. } => assert!(!status.is_terminal()),
            ResultQuery::Ready(instance) => panic!("not decided yet: {:?}", instance),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_need_an_approval_process() {
        let (engine, _) = engine(0);
        engine.submit_simple("hello-x", "X").await.unwrap();

        assert!(matches!(
            engine.approve("hello-x", "bob", None),
            Err(ProcessError::NotSignalable { .. })
        ));
        assert!(engine.approve("missing", "bob", None).unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_result_times_out() {
        let (engine, _) = engine(0);
        engine
            .submit_approval(
                "approval-2",
                ApprovalRequest::new("2", "Grant database access", "alice"),
            )
            .await
            .unwrap();

        let err = engine
            .wait_for_result("approval-2", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::WaitTimedOut(_)));
    }
}
