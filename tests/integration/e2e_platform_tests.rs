//! End-to-end platform integration tests
//!
//! Composes the real subsystem crates over their in-memory store/stream
//! implementations and live loopback HTTP: an agent shell registered on
//! the bus, calls routed through the breaker, and the orchestrator lease →
//! job → reclaim flow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use justnews_bus::{BusConfig, McpBus, RegisterRequest};
use justnews_core::agents::{AgentShell, ToolError, ToolHandler, ToolRequest};
use justnews_ingest::{
    IngestConfig, IngestOutcome, IngestPipeline, MemoryArticleStore, MemoryVectorStore,
    StageBMetrics, StaticFetcher, StubEmbeddingModel,
};
use justnews_orchestrator::{
    FixedProbe, JobStatus, LeaseMode, LeaseRequest, MemoryStore, MemoryStreams, Orchestrator,
    OrchestratorConfig, SubmitOptions,
};

struct ScoreTool;

#[async_trait]
impl ToolHandler for ScoreTool {
    fn name(&self) -> &str {
        "score_claim"
    }

    async fn call(&self, request: ToolRequest) -> Result<Value, ToolError> {
        let claim = request
            .kwargs
            .get("claim")
            .and_then(|c| c.as_str())
            .ok_or_else(|| ToolError::Validation("`claim` is required".into()))?;
        Ok(json!({ "claim": claim, "score": 0.87 }))
    }
}

async fn spawn_agent(shell: Arc<AgentShell>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = shell
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn article_page() -> String {
    let paragraph = "The committee published its long awaited findings on the energy \
                     transition, noting that grid capacity remains the main constraint \
                     for the coming decade and beyond across most member states.";
    let body: String = (0..10).map(|_| format!("<p>{paragraph}</p>")).collect();
    format!("<html><head><title>Findings</title></head><body><article>{body}</article></body></html>")
}

#[tokio::test]
async fn test_agent_registration_and_routed_call() {
    let shell = Arc::new(AgentShell::new("analyst", 0).with_tool(Arc::new(ScoreTool)));
    let addr = spawn_agent(shell).await;

    let bus = McpBus::new(BusConfig::default()).unwrap();
    bus.register(&RegisterRequest {
        agent_name: "analyst".to_string(),
        endpoint: format!("http://{addr}"),
        capabilities: vec!["score_claim".to_string()],
    })
    .await
    .unwrap();

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("claim".to_string(), json!("the grid is at capacity"));
    let reply = bus
        .router()
        .call("analyst", "score_claim", vec![], kwargs)
        .await
        .unwrap();
    assert_eq!(reply["data"]["score"], json!(0.87));

    // Health aggregation sees the live agent.
    bus.health().probe_cycle().await;
    let health = bus.health().latest().await;
    assert!(health.agents.contains_key("analyst"));
    assert!(health.issues.is_empty());
}

#[tokio::test]
async fn test_lease_job_and_reclaim_cycle() {
    let store = MemoryStore::new();
    let streams = MemoryStreams::new();
    let orch = Orchestrator::new(
        OrchestratorConfig::default(),
        store,
        streams.clone(),
        Arc::new(FixedProbe::new(vec![22_000])),
    )
    .unwrap();

    // Become leader before any write.
    orch.elector().try_elect().await.unwrap();
    assert!(orch.require_leader().is_ok());

    let t0 = Utc::now();
    let lease = orch
        .leases()
        .lease_gpu(
            &LeaseRequest {
                agent: "analyst".into(),
                mode: LeaseMode::Exclusive,
                ttl_seconds: Some(300),
                metadata: json!({}),
            },
            t0,
        )
        .await
        .unwrap();

    let pool = orch
        .pools()
        .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
        .await
        .unwrap();
    orch.pools().heartbeat(pool.pool_id, 1, t0).await.unwrap();

    let job_id = orch
        .jobs()
        .submit("inference", json!({"prompt": "summarize"}), SubmitOptions::default())
        .await
        .unwrap();

    // Worker claims, runs and completes the job.
    let pool = orch.pools().get(pool.pool_id).await.unwrap();
    let mut claimed = orch.jobs().claim_next(&pool).await.unwrap().unwrap();
    orch.jobs().start(&mut claimed).await.unwrap();
    orch.jobs()
        .finish(&claimed, JobStatus::Succeeded, None)
        .await
        .unwrap();
    assert_eq!(
        orch.jobs().get(job_id).await.unwrap().status,
        JobStatus::Succeeded
    );

    // The released lease leaves no trace for the reclaimer.
    orch.leases().release(lease.token).await.unwrap();
    let report = orch
        .reclaimer()
        .run_pass(t0 + Duration::seconds(3600))
        .await
        .unwrap();
    assert_eq!(report.reclaimed_leases, 0);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(orch.metrics().lease_expired_total.get(), 0);
}

#[tokio::test]
async fn test_abandoned_work_is_dead_lettered() {
    let store = MemoryStore::new();
    let streams = MemoryStreams::new();
    let orch = Orchestrator::new(
        OrchestratorConfig::default(),
        store,
        streams.clone(),
        Arc::new(FixedProbe::new(vec![22_000])),
    )
    .unwrap();

    let t0 = Utc::now();
    let pool = orch
        .pools()
        .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
        .await
        .unwrap();
    orch.pools().heartbeat(pool.pool_id, 1, t0).await.unwrap();

    let job_id = orch
        .jobs()
        .submit("inference", json!({"prompt": "x"}), SubmitOptions::default())
        .await
        .unwrap();
    let pool = orch.pools().get(pool.pool_id).await.unwrap();
    let claimed = orch.jobs().claim_next(&pool).await.unwrap().unwrap();

    // The pool dies; passes age the pending entry until the attempt budget
    // is gone.
    for pass in 1..=6i64 {
        streams
            .age_pending(&claimed.stream, &pool.consumer_group(), StdDuration::from_secs(300))
            .await;
        orch.reclaimer()
            .run_pass(t0 + Duration::seconds(300 * pass))
            .await
            .unwrap();
        if orch.jobs().get(job_id).await.unwrap().status == JobStatus::Dead {
            break;
        }
    }

    let job = orch.jobs().get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.last_error.as_deref(), Some("max_attempts_exceeded"));

    use justnews_orchestrator::JobStream;
    assert_eq!(
        streams
            .depth("stream:orchestrator:inference:dlq")
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_memory_agent_ingests_over_http() {
    // Assemble the memory agent's pipeline over in-memory stores.
    let fetcher = StaticFetcher::new().with_page("https://example.com/story", &article_page());
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig {
        raw_html_dir: dir.path().to_path_buf(),
        ..IngestConfig::default()
    };
    let article_store = MemoryArticleStore::new();
    let pipeline = Arc::new(IngestPipeline::new(
        config,
        Arc::new(fetcher),
        article_store.clone(),
        Arc::new(StubEmbeddingModel::new("all-MiniLM-L6-v2", 16)),
        MemoryVectorStore::new(),
        Arc::new(StageBMetrics::new().unwrap()),
    ));

    struct IngestTool {
        pipeline: Arc<IngestPipeline>,
    }

    #[async_trait]
    impl ToolHandler for IngestTool {
        fn name(&self) -> &str {
            "ingest_article"
        }

        async fn call(&self, request: ToolRequest) -> Result<Value, ToolError> {
            let url = request
                .kwargs
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| ToolError::Validation("`url` is required".into()))?;
            let outcome = self
                .pipeline
                .ingest_url(url, Utc::now())
                .await
                .map_err(|err| ToolError::Internal(err.to_string()))?;
            assert!(matches!(outcome, IngestOutcome::Ingested { .. }));
            serde_json::to_value(&outcome).map_err(|err| ToolError::Internal(err.to_string()))
        }
    }

    let shell = Arc::new(
        AgentShell::new("memory", 0).with_tool(Arc::new(IngestTool { pipeline })),
    );
    let addr = spawn_agent(shell).await;

    // Route the ingest through the bus like any other tool call.
    let bus = McpBus::new(BusConfig::default()).unwrap();
    bus.register(&RegisterRequest {
        agent_name: "memory".to_string(),
        endpoint: format!("http://{addr}"),
        capabilities: vec!["ingest_article".to_string()],
    })
    .await
    .unwrap();

    let mut kwargs = serde_json::Map::new();
    kwargs.insert("url".to_string(), json!("https://example.com/story"));
    let reply = bus
        .router()
        .call("memory", "ingest_article", vec![], kwargs)
        .await
        .unwrap();
    assert_eq!(reply["data"]["outcome"], json!("ingested"));
    assert_eq!(article_store.article_count().await, 1);
}
