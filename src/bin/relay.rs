//! relay CLI: operator interface to the job relay.

use clap::{Parser, Subcommand};
use relay_rs::config::{Config, Settings};
use relay_rs::db::Db;
use relay_rs::dead_letter::DeadLetterQueue;
use relay_rs::gateway::{ChannelTransport, Gateway, InboundMessage, ServerMessage, TransportEvent};
use relay_rs::handlers::{CHAT_JOB, CompletionHandler, CompletionTool, PLAN_JOB, PlanHandler};
use relay_rs::llm::{CompletionProvider, RigCompletion, anthropic_client};
use relay_rs::log::{DurableLog, PgLog, Retention, spawn_trimmer};
use relay_rs::model::{Action, WorkflowPlan};
use relay_rs::orchestrator::{Orchestrator, ToolRegistry};
use relay_rs::producer::Producer;
use relay_rs::results::ResultPublisher;
use relay_rs::telemetry::{TelemetryConfig, init_telemetry};
use relay_rs::worker::{HandlerRegistry, Worker, WorkerPool};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[derive(Parser)]
#[command(name = "relay", about = "Durable job relay with streamed results")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool and log trimmer
    Serve {
        /// Number of workers (defaults to the pool setting)
        #[arg(long)]
        workers: Option<u32>,
        /// Completion model
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,
    },
    /// Submit a message as a job
    Submit {
        message: String,
        /// Client the results are addressed to
        #[arg(long, default_value = "cli")]
        client_id: String,
        #[arg(long)]
        conversation: Option<String>,
        /// Run a workflow plan from this JSON file instead of a chat job
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Stream the results until the final chunk
        #[arg(long)]
        follow: bool,
    },
    /// List dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show queue depth and pending deliveries
    Status,
}

/// The three logs every command works with.
struct Logs {
    jobs: Arc<PgLog>,
    results: Arc<PgLog>,
    dead_letters: Arc<PgLog>,
}

impl Logs {
    async fn open(db: &Db, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            jobs: Arc::new(db.open_log(&settings.logs.jobs).await?),
            results: Arc::new(db.open_log(&settings.logs.results).await?),
            dead_letters: Arc::new(db.open_log(&settings.logs.dead_letters).await?),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let settings = config.settings()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "relay".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut sizing = settings.pool.sizing();
    if let Command::Serve {
        workers: Some(n), ..
    } = &cli.command
    {
        sizing.workers = *n;
    }
    let db = Db::connect(config.database_url.expose_secret(), sizing).await?;
    db.migrate().await?;
    let logs = Logs::open(&db, &settings).await?;

    let result = match cli.command {
        Command::Serve { workers, model } => {
            let workers = workers.unwrap_or(settings.pool.workers) as usize;
            cmd_serve(&config, &settings, &logs, workers, model).await
        }
        Command::Submit {
            message,
            client_id,
            conversation,
            plan,
            follow,
        } => {
            let inbound = InboundMessage {
                message,
                conversation_id: conversation,
                metadata: serde_json::Value::Null,
                plan: plan.map(read_plan).transpose()?,
            };
            cmd_submit(&settings, &logs, client_id, inbound, follow).await
        }
        Command::DeadLetters { limit } => cmd_dead_letters(&logs, limit).await,
        Command::Status => cmd_status(&settings, &logs).await,
    };

    db.close().await;
    result
}

fn read_plan(path: PathBuf) -> anyhow::Result<WorkflowPlan> {
    let content = std::fs::read_to_string(&path)?;
    Ok(WorkflowPlan::from_json(serde_json::from_str(&content)?)?)
}

async fn cmd_serve(
    config: &Config,
    settings: &Settings,
    logs: &Logs,
    workers: usize,
    model: String,
) -> anyhow::Result<()> {
    let provider: Option<Arc<dyn CompletionProvider>> = match &config.anthropic_api_key {
        Some(key) => Some(Arc::new(RigCompletion::new(anthropic_client(key)?, model))),
        None => {
            warn!("ANTHROPIC_API_KEY not set; chat jobs will be dead-lettered");
            None
        }
    };

    let mut tools = ToolRegistry::new();
    let mut handlers = HandlerRegistry::new();
    if let Some(provider) = &provider {
        tools = tools.register(Action::Complete, CompletionTool::new(provider.clone()));
        handlers = handlers.register(CHAT_JOB, CompletionHandler::new(provider.clone()));
    }
    let orchestrator = Orchestrator::new(Arc::new(tools));
    handlers = handlers.register(PLAN_JOB, PlanHandler::new(orchestrator));

    let jobs: Arc<dyn DurableLog> = logs.jobs.clone();
    let template = Worker::new(
        hostname(),
        jobs.clone(),
        ResultPublisher::new(logs.results.clone()),
        DeadLetterQueue::new(logs.dead_letters.clone()),
        Arc::new(handlers),
    )
    .with_config(settings.worker.config());
    let pool = WorkerPool::spawn(&template, workers);

    let mut retention = vec![
        Retention {
            log: logs.results.clone(),
            max_len: settings.logs.results_max_len,
        },
        Retention {
            log: logs.dead_letters.clone(),
            max_len: settings.logs.dead_letters_max_len,
        },
    ];
    if let Some(max_len) = settings.logs.jobs_max_len {
        retention.push(Retention { log: jobs, max_len });
    }
    let trimmer_shutdown = CancellationToken::new();
    let trimmer = spawn_trimmer(
        retention,
        Duration::from_secs(settings.logs.trim_interval_secs),
        trimmer_shutdown.clone(),
    );

    let shutdown = pool.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        shutdown.cancel();
        trimmer_shutdown.cancel();
    });

    let result = pool.join().await;
    trimmer.await.ok();
    Ok(result?)
}

async fn cmd_submit(
    settings: &Settings,
    logs: &Logs,
    client_id: String,
    inbound: InboundMessage,
    follow: bool,
) -> anyhow::Result<()> {
    let producer = Producer::new(logs.jobs.clone(), settings.backpressure.config());
    let gateway = Gateway::new(producer, logs.results.clone(), settings.gateway.config());
    let (transport, mut events) = ChannelTransport::new(64);
    let session = gateway.connect(client_id, Arc::new(transport));

    let job_id = session.on_message(inbound).await?;
    if job_id.is_none() || !follow {
        // Accepted or rejected is already queued on the channel.
        if let Ok(TransportEvent::Message(message)) = events.try_recv() {
            print_message(&message);
        }
        session.disconnect().await;
        return Ok(());
    }

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => {
                let done = matches!(
                    message,
                    ServerMessage::Chunk { is_final: true, .. } | ServerMessage::Error { .. }
                );
                print_message(&message);
                if done {
                    break;
                }
            }
            TransportEvent::Closed { code, reason } => {
                println!("connection closed ({}): {reason}", code.as_u16());
                break;
            }
        }
    }
    session.disconnect().await;
    Ok(())
}

fn print_message(message: &ServerMessage) {
    match message {
        ServerMessage::Accepted { job_id } => println!("Accepted: {job_id}"),
        ServerMessage::Chunk { text, is_final, .. } => {
            if *is_final {
                println!("{text}");
            } else {
                print!("{text}");
            }
        }
        ServerMessage::Error { code, message, .. } => println!("Error [{code}]: {message}"),
        ServerMessage::Rejected { code, message } => println!("Rejected [{code}]: {message}"),
    }
}

async fn cmd_dead_letters(logs: &Logs, limit: usize) -> anyhow::Result<()> {
    let dlq = DeadLetterQueue::new(logs.dead_letters.clone());
    let letters = dlq.list(limit).await?;

    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<36}  {:<8}  {:<7}  {:<16}  ERROR",
        "POS", "JOB", "TYPE", "RETRIES", "FAILED"
    );
    println!("{}", "-".repeat(100));
    for (position, letter) in &letters {
        let (id, job_type, retries) = match letter.decode_job() {
            Some(job) => (job.id.to_string(), job.job_type, job.retry_count.to_string()),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };
        println!(
            "{:<8}  {:<36}  {:<8}  {:<7}  {:<16}  {}",
            position,
            id,
            job_type,
            retries,
            letter.failed_at.format("%Y-%m-%d %H:%M"),
            letter.error
        );
    }
    println!("\n{} of {} dead letter(s)", letters.len(), dlq.len().await?);
    Ok(())
}

async fn cmd_status(settings: &Settings, logs: &Logs) -> anyhow::Result<()> {
    let group = &settings.worker.group;
    let pending = logs.jobs.pending(group).await?;

    println!("Queue depth:   {}", logs.jobs.len().await?);
    println!(
        "Ceilings:      soft {} / hard {}",
        settings.backpressure.soft_ceiling, settings.backpressure.hard_ceiling
    );
    println!("Results:       {}", logs.results.len().await?);
    println!("Dead letters:  {}", logs.dead_letters.len().await?);
    println!("Pending ({group}): {}", pending.len());
    for p in &pending {
        println!(
            "  {:<8}  {:<24}  idle {:>6}s  delivered {}x",
            p.position,
            p.consumer,
            p.idle.as_secs(),
            p.delivery_count
        );
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("relay-{}", std::process::id()))
}
