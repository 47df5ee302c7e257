//! Service assembly
//!
//! Wires the subsystem crates into runnable processes for `justnewsctl
//! start <service>`. Every process boots through the platform runtime:
//! subsystem metric registries are handed to the telemetry server, the
//! subsystem loop runs as a registered service under the shared
//! cancellation tree, and shutdown drains cleanly on SIGINT. Stores are
//! built here and injected; nothing reaches for globals.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use justnews_bus::McpBus;
use justnews_ingest::{
    HttpEmbeddingModel, IngestConfig, IngestPipeline, PgArticleStore, StageBMetrics,
};
use justnews_orchestrator::{
    NvidiaSmiProbe, Orchestrator, OrchestratorConfig, PgStore, RedisStreams,
};
use justnews_scheduler::{
    CrawlExecutor, CrawlJob, CrawlScheduler, DomainRunStats, SchedResult, SchedulerConfig,
    SchedulerError,
};

use crate::agents::{AgentShell, ToolError, ToolHandler, ToolRequest};
use crate::platform::config::PlatformConfig;
use crate::platform::runtime::Platform;
use crate::platform::service::ServiceRegistration;

/// Dimension of the default sentence-embedding model.
const EMBEDDING_DIMENSION: usize = 384;

/// Run the MCP Bus until interrupted.
pub async fn run_bus(config: &PlatformConfig) -> Result<()> {
    let bus = Arc::new(McpBus::new(config.bus_config())?);

    let mut platform = Platform::new(config.clone());
    platform.register_metrics(bus.metrics().registry().clone());
    platform.register_service(bus_service(bus, config.bus.port));

    let runtime = platform.start().await?;
    runtime.run_until_interrupted().await
}

fn bus_service(bus: Arc<McpBus>, port: u16) -> ServiceRegistration {
    ServiceRegistration::new(
        "mcp-bus",
        Arc::new(move |_ctx, token: CancellationToken| {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                let outcome: Result<()> = async {
                    bus.start_health_monitor(token.child_token());

                    let app = justnews_bus::http::router(Arc::clone(&bus));
                    let addr = SocketAddr::from(([0, 0, 0, 0], port));
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!(%addr, "MCP bus listening");

                    let shutdown = token.clone();
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.cancelled().await;
                        })
                        .await?;
                    Ok(())
                }
                .await;

                outcome
            })
        }),
    )
}

/// Run the GPU orchestrator until interrupted.
pub async fn run_orchestrator(config: &PlatformConfig) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.storage.db_url)
        .await
        .context("connecting to relational store")?;
    let store = Arc::new(PgStore::new(pool));
    let streams = Arc::new(
        RedisStreams::connect(&config.storage.stream_url)
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorConfig::from_env(),
        store,
        streams,
        Arc::new(NvidiaSmiProbe),
    )?);

    let mut platform = Platform::new(config.clone());
    platform.register_metrics(orchestrator.metrics().registry().clone());
    platform.register_service(orchestrator_service(
        orchestrator,
        config.orchestrator.port,
    ));

    let runtime = platform.start().await?;
    runtime.run_until_interrupted().await
}

fn orchestrator_service(orchestrator: Arc<Orchestrator>, port: u16) -> ServiceRegistration {
    ServiceRegistration::new(
        "gpu-orchestrator",
        Arc::new(move |_ctx, token: CancellationToken| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let outcome: Result<()> = async {
                    orchestrator.start_background(token.child_token());

                    let app = justnews_orchestrator::http::router(Arc::clone(&orchestrator));
                    let addr = SocketAddr::from(([0, 0, 0, 0], port));
                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!(%addr, "GPU orchestrator listening");

                    let shutdown = token.clone();
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.cancelled().await;
                        })
                        .await?;
                    Ok(())
                }
                .await;

                outcome
            })
        }),
    )
}

/// Crawl executor that routes domain passes to the crawler agent through
/// the bus.
pub struct BusCrawlExecutor {
    client: reqwest::Client,
    bus_url: String,
}

impl BusCrawlExecutor {
    pub fn new(bus_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            bus_url: bus_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CrawlExecutor for BusCrawlExecutor {
    async fn crawl(&self, job: &CrawlJob) -> SchedResult<DomainRunStats> {
        let body = json!({
            "agent": "crawler",
            "tool": "crawl_domain",
            "args": [],
            "kwargs": {
                "domain": job.domain,
                "profile": job.profile,
                "max_articles": job.max_articles,
            },
        });

        let response = self
            .client
            .post(format!("{}/call", self.bus_url))
            .json(&body)
            .send()
            .await
            .map_err(|err| SchedulerError::Transient(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SchedulerError::Transient(format!(
                "crawler call failed with status {}",
                response.status()
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|err| SchedulerError::Transient(err.to_string()))?;
        let data = &reply["data"];
        Ok(DomainRunStats {
            attempted: data["attempted"].as_u64().unwrap_or(0),
            ingested: data["ingested"].as_u64().unwrap_or(0),
            duplicate: data["duplicate"].as_u64().unwrap_or(0),
            error: data["error"].as_u64().unwrap_or(0),
            adaptive: data["adaptive"].as_u64().unwrap_or(0),
        })
    }
}

/// Run the crawl scheduler loop until interrupted.
pub async fn run_scheduler(config: &PlatformConfig) -> Result<()> {
    let scheduler = Arc::new(
        CrawlScheduler::from_config(SchedulerConfig::from_env())
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );
    let executor: Arc<dyn CrawlExecutor> = Arc::new(BusCrawlExecutor::new(&config.bus.url));

    let mut platform = Platform::new(config.clone());
    platform.register_service(scheduler_service(scheduler, executor));

    let runtime = platform.start().await?;
    runtime.run_until_interrupted().await
}

fn scheduler_service(
    scheduler: Arc<CrawlScheduler>,
    executor: Arc<dyn CrawlExecutor>,
) -> ServiceRegistration {
    ServiceRegistration::new(
        "crawl-scheduler",
        Arc::new(move |_ctx, token: CancellationToken| {
            let scheduler = Arc::clone(&scheduler);
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                scheduler.run(executor, token).await;
                Ok::<(), anyhow::Error>(())
            })
        }),
    )
}

/// Tool: ingest one URL through the extraction pipeline.
pub struct IngestArticleTool {
    pipeline: Arc<IngestPipeline>,
}

#[async_trait]
impl ToolHandler for IngestArticleTool {
    fn name(&self) -> &str {
        "ingest_article"
    }

    async fn call(&self, request: ToolRequest) -> Result<Value, ToolError> {
        let url = request
            .kwargs
            .get("url")
            .and_then(|u| u.as_str())
            .or_else(|| request.args.first().and_then(|u| u.as_str()))
            .ok_or_else(|| ToolError::Validation("`url` is required".into()))?;

        let outcome = self
            .pipeline
            .ingest_url(url, chrono::Utc::now())
            .await
            .map_err(|err| match err.kind() {
                "validation_error" => ToolError::Validation(err.to_string()),
                "upstream_error" => ToolError::Upstream {
                    status: 502,
                    detail: err.to_string(),
                },
                _ => ToolError::Internal(err.to_string()),
            })?;

        serde_json::to_value(&outcome).map_err(|err| ToolError::Internal(err.to_string()))
    }
}

/// Run the memory agent (article persistence + embeddings) until
/// interrupted or asked to shut down.
pub async fn run_memory_agent(config: &PlatformConfig) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.storage.db_url)
        .await
        .context("connecting to relational store")?;
    let store = Arc::new(PgArticleStore::new(pool));

    let vectors = Arc::new(
        justnews_ingest::store::QdrantVectorStore::connect(
            &config.storage.vector_store_url,
            &config.storage.vector_collection,
        )
        .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );

    let ingest_config = IngestConfig::from_env();
    let model = Arc::new(HttpEmbeddingModel::new(
        &ingest_config.embedding_endpoint,
        &ingest_config.embedding_model,
        EMBEDDING_DIMENSION,
    ));
    let metrics = Arc::new(StageBMetrics::new()?);
    let fetcher = Arc::new(justnews_ingest::HttpFetcher::new(&ingest_config));
    let pipeline = Arc::new(IngestPipeline::new(
        ingest_config,
        fetcher,
        store,
        model,
        vectors,
        Arc::clone(&metrics),
    ));

    let port = config
        .agents
        .get("memory")
        .map(|a| a.port)
        .unwrap_or(8012);

    let mut platform = Platform::new(config.clone());
    platform.register_metrics(metrics.registry().clone());
    platform.register_service(memory_agent_service(pipeline, config.bus.url.clone(), port));

    let runtime = platform.start().await?;
    runtime.run_until_interrupted().await
}

fn memory_agent_service(
    pipeline: Arc<IngestPipeline>,
    bus_url: String,
    port: u16,
) -> ServiceRegistration {
    ServiceRegistration::new(
        "memory-agent",
        Arc::new(move |ctx, token: CancellationToken| {
            let pipeline = Arc::clone(&pipeline);
            let bus_url = bus_url.clone();
            tokio::spawn(async move {
                let shell = Arc::new(
                    AgentShell::new("memory", port)
                        .with_bus(&bus_url)
                        .with_tool(Arc::new(IngestArticleTool { pipeline }))
                        .with_rate_limiter(ctx.rate_limiter())
                        .with_audit(ctx.audit_logger()),
                );

                if let Err(err) = shell.register_with_bus().await {
                    // The bus may come up after the agent; the operator
                    // restarts registration by restarting the agent.
                    warn!(error = %err, "initial bus registration failed");
                }

                // The shell owns its own shutdown token for `/shutdown`;
                // platform cancellation feeds into it.
                let shell_token = shell.shutdown_token();
                tokio::spawn(async move {
                    token.cancelled().await;
                    shell_token.cancel();
                });

                shell.serve().await
            })
        }),
    )
}
