//! Call routing
//!
//! Forwards `call(agent, tool, args, kwargs)` to `<endpoint>/<tool>` as a
//! typed POST with a hard deadline. Failures are reported to the caller and
//! counted against the agent's breaker; the bus never retries on its own.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::circuit::{CallDecision, CircuitBreakers};
use crate::metrics::BusMetrics;
use crate::registry::AgentRegistry;
use crate::types::{BusConfig, BusError, BusResult, ToolRequest};

pub struct CallRouter {
    registry: AgentRegistry,
    breakers: std::sync::Arc<CircuitBreakers>,
    metrics: std::sync::Arc<BusMetrics>,
    client: reqwest::Client,
    call_timeout: Duration,
}

impl CallRouter {
    pub fn new(
        registry: AgentRegistry,
        breakers: std::sync::Arc<CircuitBreakers>,
        metrics: std::sync::Arc<BusMetrics>,
        config: &BusConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            metrics,
            client: reqwest::Client::new(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Route one call. Every call is independent; no ordering guarantees.
    pub async fn call(
        &self,
        agent: &str,
        tool: &str,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> BusResult<Value> {
        let registered = self
            .registry
            .get(agent)
            .await
            .ok_or_else(|| BusError::AgentUnknown(agent.to_string()))?;

        let now = Instant::now();
        match self.breakers.check(agent, now).await {
            CallDecision::Allow | CallDecision::AllowProbe => {}
            CallDecision::Reject(_) => {
                self.metrics.record_call(agent, "circuit_open");
                return Err(BusError::CircuitOpen(agent.to_string()));
            }
        }

        let url = format!("{}/{}", registered.endpoint, tool);
        debug!(agent, tool, %url, "routing call");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .timeout(self.call_timeout)
            .json(&ToolRequest { args, kwargs })
            .send()
            .await;

        let elapsed = started.elapsed();
        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    self.breakers.record_success(agent).await;
                    self.metrics.record_call(agent, "ok");
                    self.metrics.observe_latency(agent, elapsed);
                    resp.json::<Value>().await.map_err(|err| BusError::Transport {
                        agent: agent.to_string(),
                        detail: format!("invalid JSON response: {err}"),
                    })
                } else {
                    let detail = resp.text().await.unwrap_or_default();
                    warn!(agent, tool, status = status.as_u16(), "upstream error");
                    self.breakers.record_failure(agent, Instant::now()).await;
                    self.metrics.record_call(agent, "upstream_error");
                    Err(BusError::Upstream {
                        agent: agent.to_string(),
                        status: status.as_u16(),
                        detail,
                    })
                }
            }
            Err(err) if err.is_timeout() => {
                warn!(agent, tool, "call deadline exceeded");
                self.breakers.record_failure(agent, Instant::now()).await;
                self.metrics.record_call(agent, "timeout");
                Err(BusError::Timeout {
                    agent: agent.to_string(),
                    tool: tool.to_string(),
                    timeout_secs: self.call_timeout.as_secs(),
                })
            }
            Err(err) => {
                warn!(agent, tool, error = %err, "transport failure");
                self.breakers.record_failure(agent, Instant::now()).await;
                self.metrics.record_call(agent, "transport_error");
                Err(BusError::Transport {
                    agent: agent.to_string(),
                    detail: err.to_string(),
                })
            }
        }
    }
}
