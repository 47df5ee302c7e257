//! In-memory agent registry
//!
//! Registration is an idempotent, last-writer-wins upsert. An optional
//! best-effort reachability probe runs at registration time; a probe
//! failure rejects the registration but is never retried by the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::types::{BusError, BusResult, RegisteredAgent};

#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, RegisteredAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Upsert an agent. The newest registration always wins.
    pub async fn register(
        &self,
        name: &str,
        endpoint: &str,
        capabilities: Vec<String>,
    ) -> BusResult<RegisteredAgent> {
        if name.is_empty() {
            return Err(BusError::Validation("agent_name must not be empty".into()));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(BusError::Validation(format!(
                "endpoint `{endpoint}` must be an http(s) URL"
            )));
        }

        let agent = RegisteredAgent {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            capabilities,
            registered_at: Utc::now(),
        };

        let mut agents = self.agents.write().await;
        let replaced = agents.insert(name.to_string(), agent.clone());
        match replaced {
            Some(old) if old.endpoint != agent.endpoint => {
                info!(agent = name, old = %old.endpoint, new = %agent.endpoint, "agent re-registered at new endpoint");
            }
            Some(_) => debug!(agent = name, "agent registration refreshed"),
            None => info!(agent = name, endpoint = %agent.endpoint, "agent registered"),
        }

        Ok(agent)
    }

    /// Best-effort reachability probe used during registration.
    pub async fn probe_endpoint(
        &self,
        client: &reqwest::Client,
        endpoint: &str,
        timeout: Duration,
    ) -> BusResult<()> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match client.get(&url).timeout(timeout).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(endpoint, error = %err, "registration probe failed");
                Err(BusError::Validation(format!(
                    "endpoint `{endpoint}` unreachable: {err}"
                )))
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<RegisteredAgent> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<RegisteredAgent> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Best-effort removal; unknown names are fine.
    pub async fn deregister(&self, name: &str) {
        if self.agents.write().await.remove(name).is_some() {
            info!(agent = name, "agent deregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_last_writer_wins() {
        let registry = AgentRegistry::new();
        registry
            .register("analyst", "http://a:1", vec!["score".into()])
            .await
            .unwrap();
        registry
            .register("analyst", "http://b:2/", vec!["score".into()])
            .await
            .unwrap();

        let agent = registry.get("analyst").await.unwrap();
        assert_eq!(agent.endpoint, "http://b:2");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_endpoint() {
        let registry = AgentRegistry::new();
        let err = registry
            .register("analyst", "ftp://nope", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_noop() {
        let registry = AgentRegistry::new();
        registry.deregister("ghost").await;
        assert!(registry.is_empty().await);
    }
}
