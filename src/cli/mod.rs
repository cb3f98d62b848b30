//! Command-line interface for conductor.
//!
//! Runs the engine in-process against simulated services, or against the
//! HTTP endpoints of the config `services` section: submit a process,
//! deliver scripted signals, and print the outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::adapters::ErrorInjector;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    derive_key, Engine, Journal, OrchestrationRequest, PollConfig, Services, SignalReceipt,
};
use crate::domain::{ApprovalRequest, ProcessInstance, ProcessKind, ProcessStatus};

/// Upper bound for waiting on a process from the CLI
const WAIT_LIMIT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// conductor - Durable task orchestration engine
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the two-step greeting process
    Hello {
        name: String,

        /// Idempotency key (defaults to hello-<name>)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Run the five-stage orchestration for a subject
    Orchestrate {
        /// Subject the plan runs for (e.g. a user id)
        subject: String,

        /// Idempotency key (defaults to orchestration-<subject>)
        #[arg(short, long)]
        key: Option<String>,

        /// Settle through initiate-then-poll
        #[arg(long)]
        async_payment: bool,

        #[arg(long, default_value = "15075")]
        amount_cents: u64,

        /// Override the polling interval
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Inject random transient failures into the simulated services
        #[arg(long)]
        simulate_errors: bool,
    },

    /// Submit an approval request and deliver a scripted decision
    Approval {
        request_id: String,

        #[arg(long)]
        details: String,

        #[arg(long, default_value = "requester@example.com")]
        requester: String,

        /// One of BUDGET_REQUEST, PERSONNEL_CHANGE, SYSTEM_ACCESS, PROCUREMENT, POLICY_EXCEPTION
        #[arg(long = "type")]
        request_type: Option<String>,

        /// Decision to deliver after the delay
        #[arg(long, value_enum, default_value = "approve")]
        decision: ScriptedDecision,

        /// Seconds to wait before delivering the decision
        #[arg(long, default_value = "2")]
        after_secs: u64,

        #[arg(long, default_value = "manager@example.com")]
        approver: String,

        #[arg(long)]
        comment: Option<String>,

        /// Override the decision timeout
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Idempotency key (defaults to approval-<request id>)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Print the journal of a process
    History { key: String },

    /// Show resolved configuration
    Config,

    /// Print the delay schedule of the configured retry policies
    Schedule,
}

/// Decision delivered by the `approval` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScriptedDecision {
    Approve,
    Reject,
    Cancel,
    /// Deliver nothing and let the gate time out
    None,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut cfg = config::load_config()?;

        match self.command {
            Commands::Hello { name, key } => {
                let key = key.unwrap_or_else(|| derive_key(ProcessKind::SimpleProcess, &name));
                let engine = build_engine(&cfg).await?;
                engine.submit_simple(&key, &name).await?;
                report(&engine, &key).await
            }
            Commands::Orchestrate {
                subject,
                key,
                async_payment,
                amount_cents,
                poll_interval_ms,
                simulate_errors,
            } => {
                if let Some(interval_ms) = poll_interval_ms {
                    cfg.polling = PollConfig {
                        interval_ms,
                        ..cfg.polling
                    };
                }
                cfg.simulation.errors_enabled |= simulate_errors;

                let key = key
                    .unwrap_or_else(|| derive_key(ProcessKind::OrchestrationProcess, &subject));
                let engine = build_engine(&cfg).await?;
                let request = OrchestrationRequest::new(subject, amount_cents)
                    .with_async_settlement(async_payment);
                engine.submit_orchestration(&key, request).await?;
                report(&engine, &key).await
            }
            Commands::Approval {
                request_id,
                details,
                requester,
                request_type,
                decision,
                after_secs,
                approver,
                comment,
                timeout_secs,
                key,
            } => {
                if let Some(secs) = timeout_secs {
                    cfg.approval = cfg.approval.with_timeout(Duration::from_secs(secs));
                }

                let key =
                    key.unwrap_or_else(|| derive_key(ProcessKind::ApprovalProcess, &request_id));
                let mut request = ApprovalRequest::new(request_id, details, requester);
                if let Some(request_type) = request_type {
                    request = request.with_type(request_type);
                }

                let engine = build_engine(&cfg).await?;
                let submission = engine.submit_approval(&key, request).await?;
                if !submission.created {
                    eprintln!("[{} already exists]", key);
                }

                if decision != ScriptedDecision::None {
                    tokio::time::sleep(Duration::from_secs(after_secs)).await;
                    let receipt = deliver(&engine, &key, decision, &approver, comment.as_deref())?;
                    eprintln!("[{:?} signal: {:?}]", decision, receipt);
                }
                report(&engine, &key).await
            }
            Commands::History { key } => show_history(&cfg, &key).await,
            Commands::Config => show_config(&cfg),
            Commands::Schedule => show_schedule(&cfg),
        }
    }
}

/// Engine over the configured services, journaling when enabled
async fn build_engine(cfg: &ResolvedConfig) -> Result<Engine> {
    cfg.validate()?;
    let injector = ErrorInjector::new(cfg.simulation.errors_enabled);
    let services = Services::configured(&cfg.simulation, injector, &cfg.services);
    let mut engine = Engine::new(services, cfg.engine_settings())?;

    if cfg.journal_enabled {
        let journal = Journal::open(cfg.journal_dir()).await?;
        engine = engine.with_journal(Arc::new(journal));
    }
    Ok(engine)
}

fn deliver(
    engine: &Engine,
    key: &str,
    decision: ScriptedDecision,
    approver: &str,
    comment: Option<&str>,
) -> Result<SignalReceipt> {
    let receipt = match decision {
        ScriptedDecision::Approve => engine.approve(key, approver, comment)?,
        ScriptedDecision::Reject => engine.reject(key, approver, comment)?,
        ScriptedDecision::Cancel => engine.cancel(key)?,
        ScriptedDecision::None => SignalReceipt::Ignored,
    };
    Ok(receipt)
}

/// Wait for the process to finish and print it
async fn report(engine: &Engine, key: &str) -> Result<()> {
    let instance = engine.wait_for_result(key, WAIT_LIMIT).await?;
    print_instance(&instance)?;

    match instance.status {
        ProcessStatus::Failed | ProcessStatus::TimedOut => {
            if let Some(failure) = &instance.failure {
                eprintln!("\n[{} stopped at {}: {}]", key, failure.stage, failure.cause);
            } else {
                eprintln!("\n[{} finished as {}]", key, instance.status);
            }
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[{} finished as {}]", key, status);
        }
    }
    Ok(())
}

fn print_instance(instance: &ProcessInstance) -> Result<()> {
    let json =
        serde_json::to_string_pretty(instance).context("Failed to serialize process")?;
    println!("{}", json);
    Ok(())
}

/// Print the journaled events of a process
async fn show_history(cfg: &ResolvedConfig, key: &str) -> Result<()> {
    let journal = Journal::open(cfg.journal_dir()).await?;
    let events = journal.replay(key).await?;

    if events.is_empty() {
        println!("No events recorded for {}", key);
        return Ok(());
    }

    println!("{:<26} {:<20} {:<40} SUMMARY", "TIME", "EVENT", "STAGE");
    println!("{}", "-".repeat(110));
    for event in events {
        println!(
            "{:<26} {:<20} {:<40} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            format!("{:?}", event.event_type),
            event.stage.as_deref().unwrap_or("-"),
            event.summary
        );
        if let Some(error) = &event.error {
            println!("{:<26} {:<20} {:<40} error: {}", "", "", "", error);
        }
    }

    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("Conductor configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!(
        "  Journal: {} ({})",
        cfg.journal_dir().display(),
        if cfg.journal_enabled { "enabled" } else { "disabled" }
    );
    println!();

    let policies = serde_yaml::to_string(&serde_json::json!({
        "retry": cfg.retry,
        "polling": cfg.polling,
        "approval": cfg.approval,
        "simulation": cfg.simulation,
    }))
    .context("Failed to render configuration")?;
    println!("{}", policies);

    let endpoints = cfg.services.configured();
    if endpoints.is_empty() {
        println!("Services: all simulated");
    } else {
        println!("Services:");
        for endpoint in endpoints {
            println!("  {}: {}", endpoint.name, endpoint.url);
        }
    }

    Ok(())
}

fn show_schedule(cfg: &ResolvedConfig) -> Result<()> {
    let print = |title: &str, delays: Vec<Duration>| {
        println!("{}:", title);
        for (i, delay) in delays.iter().enumerate() {
            println!("  after attempt {:>2}: wait {:?}", i + 1, delay);
        }
        println!();
    };

    print("Step retry", cfg.retry.schedule());
    print("Poll transport retry", cfg.polling.transport_retry.schedule());
    print("Approval step retry", cfg.approval.step_retry.schedule());
    println!(
        "Polling: every {:?}, at most {} polls, deadline {:?}",
        cfg.polling.interval(),
        cfg.polling.max_polls,
        cfg.polling.deadline()
    );
    Ok(())
}
