use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_error::{ErrorType, RelayError};
use agent_relay_worker_registry::WorkerRegistry;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::RelayConfig;
use crate::execution::BackendKind;
use crate::notifier::{LogNotifier, ThreadNotifier};
use crate::relay::Relay;
use crate::session::SessionClient;
use crate::store::{ChannelBinding, MemoryStore, ProjectConfig, QueueSettings, RelayStore};
use crate::workspace::GitWorkspace;

const CLI_CHANNEL: &str = "cli";
const CLI_PROJECT: &str = "cli";
const CLI_REQUESTER: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay", version)]
#[command(about = "Relay prompts to per-project coding-agent workers")]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    command: Command,

    /// Config file; defaults to <config dir>/agent-relay/config.json.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue prompts on a thread and follow them until the queue drains.
    Run(RunArgs),
    /// List sessions known to a running worker.
    Sessions(SessionsArgs),
    /// Wait for a worker port to answer its readiness check.
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Project directory the prompts run in.
    #[arg(long, short = 'p')]
    project: PathBuf,

    #[arg(long, default_value = "cli-thread")]
    thread: String,

    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    continue_on_failure: bool,

    #[arg(long)]
    fresh_context: bool,

    /// Run each thread in its own git worktree.
    #[arg(long)]
    auto_worktree: bool,

    #[arg(long)]
    json: bool,

    #[arg(required = true)]
    prompts: Vec<String>,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[arg(long)]
    port: u16,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[arg(long)]
    port: u16,

    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{failed} of {total} prompts failed")]
    PromptsFailed { failed: usize, total: usize },
}

impl CliError {
    pub fn error_type(&self) -> Option<ErrorType> {
        match self {
            Self::Relay(err) => Some(err.error_type()),
            _ => None,
        }
    }
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    init_logging();
    let config = RelayConfig::load(cli.config.as_deref())?;
    run_command(&cli.command, config)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command, config: RelayConfig) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match command {
        Command::Run(args) => runtime.block_on(run_prompts(config, args)),
        Command::Sessions(args) => runtime.block_on(list_sessions(args)),
        Command::Probe(args) => runtime.block_on(probe(config, args)),
    }
}

async fn run_prompts(mut config: RelayConfig, args: &RunArgs) -> Result<(), CliError> {
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.validate()?;

    let project_path = std::fs::canonicalize(&args.project)?;
    let store = Arc::new(MemoryStore::new());
    store.add_project(ProjectConfig {
        alias: CLI_PROJECT.to_string(),
        path: project_path,
        auto_worktree: args.auto_worktree,
    });
    store.bind_channel(ChannelBinding {
        channel_id: CLI_CHANNEL.to_string(),
        project_alias: CLI_PROJECT.to_string(),
        model: args.model.clone(),
    });
    store.set_queue_settings(
        &args.thread,
        QueueSettings {
            paused: false,
            continue_on_failure: args.continue_on_failure,
            fresh_context: args.fresh_context,
        },
    );

    let report = Arc::new(RunReport::default());
    let relay = Relay::new(
        store,
        WorkerRegistry::new(config.worker_registry_config()),
        Arc::new(GitWorkspace),
        report.clone(),
        config.relay_settings(),
    );

    for prompt in &args.prompts {
        let submission = relay.submit(&args.thread, CLI_CHANNEL, prompt, CLI_REQUESTER);
        tracing::debug!(thread_id = %args.thread, ?submission, "prompt submitted");
    }

    tokio::select! {
        _ = relay.wait_idle(&args.thread) => {}
        _ = tokio::signal::ctrl_c() => {
            let interrupted = relay.interrupt(&args.thread).await;
            tracing::warn!(interrupted, "interrupt requested; waiting for the execution to end");
            relay.queue().clear(&args.thread);
            relay.wait_idle(&args.thread).await;
        }
    }
    relay.shutdown().await;

    let outcomes = report.take();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            match outcome.status {
                OutcomeStatus::Completed => println!("{}\n{}\n", outcome.text, outcome.summary),
                OutcomeStatus::Failed => println!("❌ {}\n", outcome.text),
            }
        }
    }

    let failed = outcomes
        .iter()
        .filter(|outcome| outcome.status == OutcomeStatus::Failed)
        .count();
    if failed > 0 {
        return Err(CliError::PromptsFailed {
            failed,
            total: args.prompts.len(),
        });
    }
    Ok(())
}

async fn list_sessions(args: &SessionsArgs) -> Result<(), CliError> {
    let sessions = SessionClient::default().list_sessions(args.port).await?;
    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}

async fn probe(config: RelayConfig, args: &ProbeArgs) -> Result<(), CliError> {
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.readiness_timeout_ms));
    WorkerRegistry::new(config.worker_registry_config())
        .wait_for_ready(args.port, timeout)
        .await?;
    println!("worker on port {} is ready", args.port);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum OutcomeStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptOutcome {
    prompt: String,
    status: OutcomeStatus,
    text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    summary: String,
}

/// Logs like [`LogNotifier`] and keeps each prompt's outcome for the final report.
#[derive(Default)]
struct RunReport {
    current_prompt: Mutex<String>,
    outcomes: Mutex<Vec<PromptOutcome>>,
}

impl RunReport {
    fn take(&self) -> Vec<PromptOutcome> {
        std::mem::take(&mut *lock(&self.outcomes))
    }

    fn record(&self, status: OutcomeStatus, text: &str, summary: &str) {
        let prompt = lock(&self.current_prompt).clone();
        lock(&self.outcomes).push(PromptOutcome {
            prompt,
            status,
            text: text.to_string(),
            summary: summary.to_string(),
        });
    }
}

impl ThreadNotifier for RunReport {
    fn started(&self, thread_id: &str, header: &str, prompt: &str) {
        *lock(&self.current_prompt) = prompt.to_string();
        LogNotifier.started(thread_id, header, prompt);
    }

    fn progress(&self, thread_id: &str, frame: &str, text: &str) {
        LogNotifier.progress(thread_id, frame, text);
    }

    fn completed(&self, thread_id: &str, text: &str, summary: &str) {
        self.record(OutcomeStatus::Completed, text, summary);
        LogNotifier.completed(thread_id, text, summary);
    }

    fn failed(&self, thread_id: &str, message: &str) {
        self.record(OutcomeStatus::Failed, message, "");
        LogNotifier.failed(thread_id, message);
    }

    fn notice(&self, thread_id: &str, message: &str) {
        LogNotifier.notice(thread_id, message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
