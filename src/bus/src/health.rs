//! Health aggregation
//!
//! A background prober hits every registered agent's `/health` with a 1 s
//! deadline each cycle and keeps the latest composite view. Probes are
//! best-effort and never fail the bus itself. Readiness flips true after
//! the first completed cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::circuit::CircuitBreakers;
use crate::metrics::BusMetrics;
use crate::registry::AgentRegistry;
use crate::types::{AgentHealth, BusConfig, CompositeHealth, ProbeStatus};

pub struct HealthMonitor {
    registry: AgentRegistry,
    breakers: Arc<CircuitBreakers>,
    metrics: Arc<BusMetrics>,
    client: reqwest::Client,
    probe_timeout: Duration,
    probe_interval: Duration,
    latest: RwLock<CompositeHealth>,
    first_cycle_done: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        registry: AgentRegistry,
        breakers: Arc<CircuitBreakers>,
        metrics: Arc<BusMetrics>,
        config: &BusConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            metrics,
            client: reqwest::Client::new(),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            latest: RwLock::new(CompositeHealth {
                overall_status: ProbeStatus::Unknown,
                agents: HashMap::new(),
                circuit_breaker_active: false,
                checked_at: Utc::now(),
                issues: Vec::new(),
            }),
            first_cycle_done: AtomicBool::new(false),
        }
    }

    /// True once at least one probe cycle has completed.
    pub fn ready(&self) -> bool {
        self.first_cycle_done.load(Ordering::Acquire)
    }

    pub async fn latest(&self) -> CompositeHealth {
        self.latest.read().await.clone()
    }

    /// Run probe cycles until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.probe_interval);
        info!(
            interval_secs = self.probe_interval.as_secs(),
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_cycle().await;
                }
                _ = token.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
            }
        }
    }

    /// Probe every registered agent once and refresh the composite view.
    pub async fn probe_cycle(&self) {
        let agents = self.registry.list().await;
        let probes = agents.iter().map(|agent| {
            let client = self.client.clone();
            let timeout = self.probe_timeout;
            let name = agent.name.clone();
            let endpoint = agent.endpoint.clone();
            async move { (name, probe_one(&client, &endpoint, timeout).await) }
        });

        let results: Vec<(String, AgentHealth)> = futures::future::join_all(probes).await;

        let mut issues = Vec::new();
        let mut map = HashMap::new();
        for (name, health) in results {
            if health.status != ProbeStatus::Healthy {
                issues.push(format!(
                    "{name}: {:?}{}",
                    health.status,
                    health
                        .error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                ));
            }
            map.insert(name, health);
        }

        let overall = if map.is_empty() {
            ProbeStatus::Unknown
        } else if map.values().all(|h| h.status == ProbeStatus::Healthy) {
            ProbeStatus::Healthy
        } else if map.values().any(|h| {
            matches!(h.status, ProbeStatus::Unhealthy | ProbeStatus::Unreachable)
        }) {
            ProbeStatus::Unhealthy
        } else {
            ProbeStatus::Degraded
        };

        let composite = CompositeHealth {
            overall_status: overall,
            agents: map,
            circuit_breaker_active: self.breakers.any_active().await,
            checked_at: Utc::now(),
            issues,
        };

        debug!(overall = ?composite.overall_status, agents = composite.agents.len(), "probe cycle complete");
        self.metrics.record_probe_cycle();
        *self.latest.write().await = composite;
        self.first_cycle_done.store(true, Ordering::Release);
    }
}

async fn probe_one(client: &reqwest::Client, endpoint: &str, timeout: Duration) -> AgentHealth {
    let url = format!("{}/health", endpoint);
    let started = Instant::now();
    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => {
            let elapsed = started.elapsed().as_millis() as u64;
            let code = resp.status().as_u16();
            let status = if resp.status().is_success() {
                // Trust the agent's self-reported status when parseable.
                match resp.json::<serde_json::Value>().await {
                    Ok(body) => match body.get("status").and_then(|s| s.as_str()) {
                        Some("healthy") | None => ProbeStatus::Healthy,
                        Some("degraded") => ProbeStatus::Degraded,
                        Some(_) => ProbeStatus::Unhealthy,
                    },
                    Err(_) => ProbeStatus::Healthy,
                }
            } else {
                ProbeStatus::Unhealthy
            };
            AgentHealth {
                status,
                response_time_ms: Some(elapsed),
                status_code: Some(code),
                error: None,
            }
        }
        Err(err) => AgentHealth {
            status: ProbeStatus::Unreachable,
            response_time_ms: None,
            status_code: None,
            error: Some(err.to_string()),
        },
    }
}
