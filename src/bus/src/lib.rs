//! MCP Bus - Service Registry and Call Routing Hub
//!
//! The bus is the coordination point for every agent in the platform. It
//! keeps an in-memory registry of live agents, forwards
//! `call(agent, tool, args, kwargs)` invocations to the owning agent's HTTP
//! endpoint, aggregates `/health` probes, and protects each downstream with
//! an independent circuit breaker.
//!
//! ## Key Components
//!
//! - **Registry**: idempotent, last-writer-wins agent registration
//! - **Router**: typed call forwarding with hard deadlines
//! - **Circuit breakers**: per-agent `{closed, open, half_open}` machines
//! - **Health monitor**: best-effort probe cycles feeding `/health`
//!
//! Calls carry no cross-call ordering guarantees; each one is independent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod circuit;
pub mod health;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod types;

pub use circuit::{BreakerState, CircuitBreakers};
pub use health::HealthMonitor;
pub use metrics::BusMetrics;
pub use registry::AgentRegistry;
pub use router::CallRouter;
pub use types::*;

/// Version of the bus crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The assembled bus: registry + router + breakers + health monitor.
pub struct McpBus {
    config: BusConfig,
    registry: AgentRegistry,
    breakers: Arc<CircuitBreakers>,
    metrics: Arc<BusMetrics>,
    router: CallRouter,
    health: Arc<HealthMonitor>,
    probe_client: reqwest::Client,
}

impl McpBus {
    pub fn new(config: BusConfig) -> anyhow::Result<Self> {
        let registry = AgentRegistry::new();
        let breakers = Arc::new(CircuitBreakers::new(&config));
        let metrics = Arc::new(BusMetrics::new()?);
        let router = CallRouter::new(
            registry.clone(),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            &config,
        );
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::clone(&breakers),
            Arc::clone(&metrics),
            &config,
        ));

        Ok(Self {
            config,
            registry,
            breakers,
            metrics,
            router,
            health,
            probe_client: reqwest::Client::new(),
        })
    }

    /// Register an agent, probing its endpoint best-effort first.
    pub async fn register(&self, req: &RegisterRequest) -> BusResult<RegisteredAgent> {
        self.registry
            .probe_endpoint(
                &self.probe_client,
                &req.endpoint,
                http::REGISTRATION_PROBE_TIMEOUT,
            )
            .await?;
        let agent = self
            .registry
            .register(&req.agent_name, &req.endpoint, req.capabilities.clone())
            .await?;
        self.metrics
            .registered_agents
            .set(self.registry.len().await as i64);
        Ok(agent)
    }

    /// Spawn the background health prober; returns immediately.
    pub fn start_health_monitor(&self, token: CancellationToken) {
        let monitor = Arc::clone(&self.health);
        tokio::spawn(monitor.run(token));
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn router(&self) -> &CallRouter {
        &self.router
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}
