//! Operator CLI
//!
//! `justnewsctl start <service>`, `stop <service>`, `health`, `migrate`,
//! `scheduler run`, `orchestrator reclaim`, `orchestrator leases list`.
//!
//! Exit codes: 0 ok, 1 generic failure, 2 bad arguments, 3 precondition
//! failure, 4 timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use justnews_core::platform::config::PlatformConfig;
use justnews_core::services;
use serde_json::Value;
use tracing::info;

const EXIT_OK: i32 = 0;
const EXIT_GENERIC: i32 = 1;
const EXIT_BAD_ARGS: i32 = 2;
const EXIT_PRECONDITION: i32 = 3;
const EXIT_TIMEOUT: i32 = 4;

#[derive(Parser)]
#[command(name = "justnewsctl", author, version, about = "JustNews platform operator tool", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a platform service in the foreground
    Start {
        /// bus | orchestrator | scheduler | memory
        service: String,
    },
    /// Gracefully stop a running service
    Stop {
        /// bus | orchestrator | memory
        service: String,
    },
    /// Query the bus composite health
    Health,
    /// Apply pending database migrations
    Migrate,
    /// Crawl scheduler operations
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
    /// GPU orchestrator operations
    Orchestrator {
        #[command(subcommand)]
        command: OrchestratorCommand,
    },
}

#[derive(Subcommand)]
enum SchedulerCommand {
    /// Plan (and optionally execute) one scheduler pass
    Run {
        /// Plan only; print the batch without crawling
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,
        /// Execute the pass against the crawler agent
        #[arg(long)]
        live: bool,
    },
}

#[derive(Subcommand)]
enum OrchestratorCommand {
    /// Trigger one reclaim pass on the leader
    Reclaim,
    /// Lease administration
    Leases {
        #[command(subcommand)]
        command: LeasesCommand,
    },
}

#[derive(Subcommand)]
enum LeasesCommand {
    /// List active leases
    List,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match PlatformConfig::load_from_path(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    let code = match run(cli.command, &config).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("{err:#}");
            classify_exit(&err)
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, config: &PlatformConfig) -> Result<()> {
    match command {
        Command::Start { service } => start_service(&service, config).await,
        Command::Stop { service } => stop_service(&service, config).await,
        Command::Health => health(config).await,
        Command::Migrate => migrate(config).await,
        Command::Scheduler { command } => match command {
            SchedulerCommand::Run { dry_run, live } => scheduler_run(config, dry_run, live).await,
        },
        Command::Orchestrator { command } => match command {
            OrchestratorCommand::Reclaim => orchestrator_reclaim(config).await,
            OrchestratorCommand::Leases {
                command: LeasesCommand::List,
            } => orchestrator_leases_list(config).await,
        },
    }
}

async fn start_service(service: &str, config: &PlatformConfig) -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(config.observability.log_level.as_str())
        .try_init();
    info!(service, "starting");

    match service {
        "bus" => services::run_bus(config).await,
        "orchestrator" => services::run_orchestrator(config).await,
        "scheduler" => services::run_scheduler(config).await,
        "memory" => services::run_memory_agent(config).await,
        other => anyhow::bail!("unknown service `{other}` (bad arguments)"),
    }
}

async fn stop_service(service: &str, config: &PlatformConfig) -> Result<()> {
    let endpoint = match service {
        "bus" => config.bus.url.clone(),
        "orchestrator" => config.orchestrator.url.clone(),
        other => {
            let agent = config
                .agents
                .get(other)
                .with_context(|| format!("unknown service `{other}` (bad arguments)"))?;
            format!("http://localhost:{}", agent.port)
        }
    };

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/shutdown", endpoint.trim_end_matches('/')))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("stopping `{service}`"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "`{service}` refused shutdown: {}",
        response.status()
    );
    println!("{service} stopping");
    Ok(())
}

async fn health(config: &PlatformConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/health", config.bus.url.trim_end_matches('/')))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .context("querying bus health")?;
    let body: Value = response.json().await.context("parsing bus health")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    match body.get("overall_status").and_then(|s| s.as_str()) {
        Some("healthy") | Some("unknown") => Ok(()),
        Some(other) => anyhow::bail!("platform {other} (precondition failure)"),
        None => anyhow::bail!("malformed health response"),
    }
}

async fn migrate(config: &PlatformConfig) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.storage.db_url)
        .await
        .context("connecting to relational store")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn scheduler_run(config: &PlatformConfig, dry_run: bool, live: bool) -> Result<()> {
    use justnews_scheduler::{CrawlScheduler, SchedulerConfig};

    let scheduler = CrawlScheduler::from_config(SchedulerConfig::from_env())
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    if live {
        let executor: Arc<dyn justnews_scheduler::CrawlExecutor> =
            Arc::new(services::BusCrawlExecutor::new(&config.bus.url));
        let batch = scheduler
            .run_pass(&executor, chrono::Utc::now())
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        println!("{}", serde_json::to_string_pretty(&batch)?);
        return Ok(());
    }

    // Default (and --dry-run): plan without crawling.
    let _ = dry_run;
    let batch = scheduler.plan_tick(chrono::Utc::now()).await;
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}

async fn orchestrator_reclaim(config: &PlatformConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let url = config.orchestrator.url.trim_end_matches('/');
    let response = client
        .post(format!("{url}/control/reclaim"))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .context("triggering reclaim pass")?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "reclaim refused ({status}): {} (precondition failure)",
            body.get("detail").and_then(|d| d.as_str()).unwrap_or("")
        );
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn orchestrator_leases_list(config: &PlatformConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let url = config.orchestrator.url.trim_end_matches('/');
    let response = client
        .get(format!("{url}/leases"))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .context("listing leases")?;
    let body: Value = response.json().await.context("parsing lease list")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Map failures onto the documented exit codes.
fn classify_exit(err: &anyhow::Error) -> i32 {
    let message = format!("{err:#}");
    if let Some(req_err) = err.downcast_ref::<reqwest::Error>() {
        if req_err.is_timeout() {
            return EXIT_TIMEOUT;
        }
    }
    if message.contains("timed out") || message.contains("deadline") {
        return EXIT_TIMEOUT;
    }
    if message.contains("bad arguments") {
        return EXIT_BAD_ARGS;
    }
    if message.contains("precondition failure") {
        return EXIT_PRECONDITION;
    }
    EXIT_GENERIC
}
