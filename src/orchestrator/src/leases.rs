//! Lease lifecycle
//!
//! Leases are durable rows. Headroom accounting for concurrent lease
//! requests is serialized on a per-GPU logical lock so that two requests
//! cannot both see the same free memory. Tokens are persisted before they
//! are returned to the caller.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gpu::DeviceProbe;
use crate::metrics::OrchestratorMetrics;
use crate::policy::PolicyTable;
use crate::store::OrchestratorStore;
use crate::types::{
    Lease, LeaseMode, LeaseRequest, OrchResult, OrchestratorConfig, OrchestratorError,
};

/// Upper bound on per-GPU serialization locks; indexes wrap into this set.
const GPU_LOCK_SLOTS: usize = 16;

pub struct LeaseManager {
    store: Arc<dyn OrchestratorStore>,
    probe: Arc<dyn DeviceProbe>,
    policy: PolicyTable,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
    gpu_locks: Vec<Mutex<()>>,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        probe: Arc<dyn DeviceProbe>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        let policy = PolicyTable::new(config.agent_model_map.clone());
        Self {
            store,
            probe,
            policy,
            config,
            metrics,
            gpu_locks: (0..GPU_LOCK_SLOTS).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Grant a lease at `now`. The row is durably persisted before the
    /// token leaves this function.
    pub async fn lease_gpu(&self, req: &LeaseRequest, now: DateTime<Utc>) -> OrchResult<Lease> {
        if req.agent.is_empty() {
            return Err(OrchestratorError::Validation("agent must not be empty".into()));
        }

        let model = req.metadata.get("model").and_then(|m| m.as_str());
        let budget_mb = self.policy.check(&req.agent, model)?;
        let ttl = Duration::seconds(req.ttl_seconds.unwrap_or(self.config.lease_ttl_secs) as i64);

        let gpu_index = match req.mode {
            LeaseMode::Cpu => None,
            LeaseMode::Exclusive | LeaseMode::Shared => {
                Some(self.select_gpu(req, budget_mb, now).await?)
            }
        };

        let lease = Lease {
            token: Uuid::new_v4(),
            agent_name: req.agent.clone(),
            gpu_index,
            mode: req.mode,
            created_at: now,
            expires_at: now + ttl,
            last_heartbeat: now,
            metadata: req.metadata.clone(),
        };

        self.store.insert_lease(&lease).await?;
        info!(
            agent = %lease.agent_name,
            token = %lease.token,
            gpu = ?lease.gpu_index,
            ttl_secs = ttl.num_seconds(),
            "lease granted"
        );
        Ok(lease)
    }

    /// Pick the first device with enough headroom, serializing accounting
    /// per GPU.
    async fn select_gpu(
        &self,
        req: &LeaseRequest,
        budget_mb: u64,
        now: DateTime<Utc>,
    ) -> OrchResult<u32> {
        let device_count = match self.probe.device_count().await {
            Ok(count) => count,
            Err(err) => {
                if self.config.allow_unprobed_gpu {
                    warn!(error = %err, "device probe failed, unprobed override active");
                    return Ok(0);
                }
                return Err(OrchestratorError::HeadroomUnknown(err.to_string()));
            }
        };
        if device_count == 0 {
            return Err(OrchestratorError::HeadroomUnknown("no GPU devices visible".into()));
        }

        let mut last_shortfall: Option<(u32, u64)> = None;
        for gpu_index in 0..device_count {
            let _slot = self.gpu_locks[gpu_index as usize % GPU_LOCK_SLOTS]
                .lock()
                .await;

            if req.mode == LeaseMode::Exclusive
                && self.has_live_conflict(&req.agent, gpu_index, now).await?
            {
                continue;
            }

            let free_mb = match self.probe.free_memory_mb(gpu_index).await {
                Ok(free) => free,
                Err(err) => {
                    if self.config.allow_unprobed_gpu {
                        warn!(gpu_index, error = %err, "probe failed, unprobed override active");
                        return Ok(gpu_index);
                    }
                    return Err(OrchestratorError::HeadroomUnknown(err.to_string()));
                }
            };

            if free_mb >= budget_mb + self.config.headroom_min_free_mb {
                return Ok(gpu_index);
            }
            last_shortfall = Some((gpu_index, free_mb));
        }

        let (gpu_index, free_mb) = last_shortfall.unwrap_or((0, 0));
        Err(OrchestratorError::InsufficientHeadroom {
            gpu_index,
            free_mb,
            required_mb: budget_mb + self.config.headroom_min_free_mb,
        })
    }

    /// At most one live exclusive lease per (agent, gpu).
    async fn has_live_conflict(
        &self,
        agent: &str,
        gpu_index: u32,
        now: DateTime<Utc>,
    ) -> OrchResult<bool> {
        let stale = Duration::seconds(self.config.lease_stale_secs as i64);
        Ok(self.store.list_leases().await?.iter().any(|lease| {
            lease.agent_name == agent
                && lease.gpu_index == Some(gpu_index)
                && lease.mode == LeaseMode::Exclusive
                && lease.is_live(now, stale)
        }))
    }

    /// Extend a lease by its TTL. Extension never shortens the expiry, and
    /// a heartbeat landing exactly at `expires_at` still succeeds.
    pub async fn heartbeat(&self, token: Uuid, now: DateTime<Utc>) -> OrchResult<Lease> {
        let lease = self
            .store
            .get_lease(token)
            .await?
            .ok_or(OrchestratorError::UnknownLease(token))?;

        if lease.is_expired(now) {
            return Err(OrchestratorError::ExpiredLease(token));
        }

        let ttl = Duration::seconds(self.config.lease_ttl_secs as i64);
        let new_expiry = std::cmp::max(lease.expires_at, now + ttl);
        self.store
            .update_lease_times(token, new_expiry, now)
            .await?
            .ok_or(OrchestratorError::UnknownLease(token))
    }

    /// Idempotent release: unknown or already-released tokens succeed
    /// silently.
    pub async fn release(&self, token: Uuid) -> OrchResult<()> {
        if self.store.delete_lease(token).await? {
            info!(token = %token, "lease released");
        }
        Ok(())
    }

    pub async fn list(&self) -> OrchResult<Vec<Lease>> {
        self.store.list_leases().await
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{FailingProbe, FixedProbe};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn manager_with(
        free_mb: Vec<u64>,
        config: OrchestratorConfig,
    ) -> (LeaseManager, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let manager = LeaseManager::new(
            store.clone(),
            Arc::new(FixedProbe::new(free_mb)),
            config,
            metrics,
        );
        (manager, store)
    }

    fn request(agent: &str) -> LeaseRequest {
        LeaseRequest {
            agent: agent.to_string(),
            mode: LeaseMode::Exclusive,
            ttl_seconds: Some(300),
            metadata: json!({"model": "mistral-7b"}),
        }
    }

    fn policy_config() -> OrchestratorConfig {
        let mut map = HashMap::new();
        map.insert(
            "analyst".to_string(),
            crate::types::AgentPolicy {
                allowed_models: vec!["mistral-7b".to_string()],
                vram_budget_mb: 18_000,
            },
        );
        OrchestratorConfig {
            agent_model_map: map,
            headroom_min_free_mb: 1024,
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_lease_heartbeat_release() {
        let (manager, store) = manager_with(vec![22_000], policy_config());
        let t0 = Utc::now();

        let lease = manager.lease_gpu(&request("analyst"), t0).await.unwrap();
        assert_eq!(lease.gpu_index, Some(0));
        assert_eq!(lease.expires_at, t0 + Duration::seconds(300));

        let t1 = t0 + Duration::seconds(250);
        let extended = manager.heartbeat(lease.token, t1).await.unwrap();
        assert_eq!(extended.expires_at, t1 + Duration::seconds(300));

        manager.release(lease.token).await.unwrap();
        assert!(store.get_lease(lease.token).await.unwrap().is_none());
        // Second release is a no-op.
        manager.release(lease.token).await.unwrap();
    }

    #[tokio::test]
    async fn test_insufficient_headroom() {
        // 10 GB free < 18 GB budget + 1 GB floor.
        let (manager, _) = manager_with(vec![10_000], policy_config());
        let err = manager
            .lease_gpu(&request("analyst"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InsufficientHeadroom { .. }));
    }

    #[tokio::test]
    async fn test_denied_by_policy() {
        let (manager, _) = manager_with(vec![22_000], policy_config());
        let mut req = request("analyst");
        req.metadata = json!({"model": "llama-70b"});
        let err = manager.lease_gpu(&req, Utc::now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeniedByPolicy { .. }));
    }

    #[tokio::test]
    async fn test_probe_failure_yields_headroom_unknown() {
        let store = MemoryStore::new();
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let manager = LeaseManager::new(
            store,
            Arc::new(FailingProbe),
            policy_config(),
            metrics,
        );
        let err = manager
            .lease_gpu(&request("analyst"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "headroom_unknown");
    }

    #[tokio::test]
    async fn test_unprobed_override_allows_lease() {
        let store = MemoryStore::new();
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let config = OrchestratorConfig {
            allow_unprobed_gpu: true,
            ..policy_config()
        };
        let manager = LeaseManager::new(store, Arc::new(FailingProbe), config, metrics);
        let lease = manager
            .lease_gpu(&request("analyst"), Utc::now())
            .await
            .unwrap();
        assert_eq!(lease.gpu_index, Some(0));
    }

    #[tokio::test]
    async fn test_heartbeat_boundary() {
        let (manager, _) = manager_with(vec![22_000], policy_config());
        let t0 = Utc::now();
        let lease = manager.lease_gpu(&request("analyst"), t0).await.unwrap();

        // Exactly at expires_at: extends.
        let at_expiry = lease.expires_at;
        assert!(manager.heartbeat(lease.token, at_expiry).await.is_ok());

        // Past expires_at: expired_lease.
        let past = lease.expires_at + Duration::seconds(301) + Duration::nanoseconds(1);
        let err = manager.heartbeat(lease.token, past).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ExpiredLease(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_never_shortens() {
        let (manager, _) = manager_with(vec![22_000], policy_config());
        let t0 = Utc::now();
        let mut req = request("analyst");
        req.ttl_seconds = Some(3600);
        let lease = manager.lease_gpu(&req, t0).await.unwrap();

        // Default TTL heartbeat soon after grant must not pull expiry in.
        let t1 = t0 + Duration::seconds(1);
        let extended = manager.heartbeat(lease.token, t1).await.unwrap();
        assert_eq!(extended.expires_at, lease.expires_at);
    }

    #[tokio::test]
    async fn test_exclusive_conflict_skips_gpu() {
        let (manager, _) = manager_with(vec![22_000, 22_000], policy_config());
        let t0 = Utc::now();
        let first = manager.lease_gpu(&request("analyst"), t0).await.unwrap();
        assert_eq!(first.gpu_index, Some(0));

        let second = manager.lease_gpu(&request("analyst"), t0).await.unwrap();
        assert_eq!(second.gpu_index, Some(1));
    }
}
