//! Worker-pool lifecycle
//!
//! Pools move through the state machine documented on `PoolStatus`; every
//! transition is validated. OOM detection consumes worker log lines looking
//! for out-of-memory markers and drives bounded restarts with exponential
//! backoff. After the restart budget is exhausted the pool degrades and an
//! event is emitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::store::OrchestratorStore;
use crate::streams::JobStream;
use crate::types::{
    stream_name, OrchResult, OrchestratorConfig, OrchestratorError, OrchestratorEvent, PoolStatus,
    WorkerPool,
};

/// Log markers treated as an OOM signal.
const OOM_MARKERS: &[&str] = &[
    "CUDA out of memory",
    "torch.OutOfMemoryError",
    "cudaErrorMemoryAllocation",
];

#[derive(Debug, Default, Clone)]
struct RestartState {
    attempts: u32,
    last_oom: Option<DateTime<Utc>>,
}

pub struct PoolManager {
    store: Arc<dyn OrchestratorStore>,
    streams: Arc<dyn JobStream>,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
    events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    restarts: Mutex<HashMap<Uuid, RestartState>>,
}

impl PoolManager {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        streams: Arc<dyn JobStream>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
        events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            store,
            streams,
            config,
            metrics,
            events,
            restarts: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pool in `starting` and pre-create its consumer group.
    pub async fn pool_start(
        &self,
        agent_name: &str,
        model_id: &str,
        adapter: Option<String>,
        desired_workers: u32,
        hold_seconds: u64,
        now: DateTime<Utc>,
    ) -> OrchResult<WorkerPool> {
        if desired_workers == 0 {
            return Err(OrchestratorError::Validation(
                "desired_workers must be at least 1".into(),
            ));
        }

        let pool = WorkerPool {
            pool_id: Uuid::new_v4(),
            agent_name: agent_name.to_string(),
            model_id: model_id.to_string(),
            adapter,
            desired_workers,
            spawned_workers: 0,
            started_at: now,
            last_heartbeat: now,
            status: PoolStatus::Starting,
            hold_seconds,
            metadata: serde_json::json!({"job_type": "inference"}),
        };

        // The group must exist before any submit lands so the wake-up entry
        // is not skipped.
        self.streams
            .ensure_group(&stream_name("inference"), &pool.consumer_group())
            .await?;

        self.store.insert_pool(&pool).await?;
        info!(pool = %pool.pool_id, model = model_id, workers = desired_workers, "🚀 pool starting");
        self.set_status_gauge(&pool);
        Ok(pool)
    }

    /// Worker heartbeat. First healthy heartbeat moves `starting → running`;
    /// a heartbeat after degradation moves `degraded → running` once no
    /// further OOM occurred within the backoff window.
    pub async fn heartbeat(
        &self,
        pool_id: Uuid,
        spawned_workers: u32,
        now: DateTime<Utc>,
    ) -> OrchResult<WorkerPool> {
        let mut pool = self.get(pool_id).await?;
        pool.spawned_workers = spawned_workers.min(pool.desired_workers);
        pool.last_heartbeat = now;

        match pool.status {
            PoolStatus::Starting if spawned_workers > 0 => {
                self.transition(&mut pool, PoolStatus::Running)?;
            }
            PoolStatus::Degraded => {
                let oom_quiet = {
                    let restarts = self.restarts.lock().await;
                    restarts
                        .get(&pool_id)
                        .and_then(|s| s.last_oom)
                        .map(|last| now - last > Duration::seconds(self.config.restart_cap_secs as i64))
                        .unwrap_or(true)
                };
                if spawned_workers > 0 && oom_quiet {
                    self.transition(&mut pool, PoolStatus::Running)?;
                    self.restarts.lock().await.remove(&pool_id);
                }
            }
            _ => {}
        }

        self.store.update_pool(&pool).await?;
        self.set_status_gauge(&pool);
        Ok(pool)
    }

    /// Explicit drain: stop accepting new work, finish in-flight.
    pub async fn drain(&self, pool_id: Uuid) -> OrchResult<WorkerPool> {
        let mut pool = self.get(pool_id).await?;
        self.transition(&mut pool, PoolStatus::Draining)?;
        self.store.update_pool(&pool).await?;
        self.set_status_gauge(&pool);
        info!(pool = %pool_id, "pool draining");
        Ok(pool)
    }

    /// Complete a drain once the pool's consumer group has no pending
    /// entries left, or force-stop a degraded pool (operator intervention).
    pub async fn stop(&self, pool_id: Uuid) -> OrchResult<WorkerPool> {
        let mut pool = self.get(pool_id).await?;
        if pool.status == PoolStatus::Draining {
            let job_type = pool
                .metadata
                .get("job_type")
                .and_then(|t| t.as_str())
                .unwrap_or("inference");
            let pending = self
                .streams
                .pending(&stream_name(job_type), &pool.consumer_group())
                .await?;
            let in_flight = pending
                .iter()
                .filter(|p| p.consumer == pool_id.to_string())
                .count();
            if in_flight > 0 {
                return Err(OrchestratorError::Validation(format!(
                    "pool {pool_id} still has {in_flight} in-flight jobs"
                )));
            }
        }
        self.transition(&mut pool, PoolStatus::Stopped)?;
        self.store.update_pool(&pool).await?;
        self.set_status_gauge(&pool);
        info!(pool = %pool_id, "🛑 pool stopped");
        Ok(pool)
    }

    /// Mark a pool degraded, recording the reason and emitting an event.
    pub async fn degrade(&self, pool_id: Uuid, reason: &str) -> OrchResult<WorkerPool> {
        let mut pool = self.get(pool_id).await?;
        if pool.status == PoolStatus::Degraded {
            return Ok(pool);
        }
        self.transition(&mut pool, PoolStatus::Degraded)?;
        self.store.update_pool(&pool).await?;
        self.set_status_gauge(&pool);
        warn!(pool = %pool_id, reason, "pool degraded");
        let _ = self.events.send(OrchestratorEvent::PoolDegraded {
            pool_id,
            reason: reason.to_string(),
        });
        Ok(pool)
    }

    /// Scan one worker log line for OOM markers; drives the restart budget
    /// on detection. Returns whether an OOM was observed.
    pub async fn scan_worker_log(
        &self,
        pool_id: Uuid,
        line: &str,
        now: DateTime<Utc>,
    ) -> OrchResult<bool> {
        if !OOM_MARKERS.iter().any(|marker| line.contains(marker)) {
            return Ok(false);
        }

        self.metrics.vllm_ooms_total.inc();
        let attempt = {
            let mut restarts = self.restarts.lock().await;
            let state = restarts.entry(pool_id).or_default();
            state.attempts += 1;
            state.last_oom = Some(now);
            state.attempts
        };

        if attempt > self.config.restart_max_attempts {
            error!(pool = %pool_id, attempt, "OOM restart budget exhausted");
            self.degrade(pool_id, "oom_restart_budget_exhausted").await?;
            return Ok(true);
        }

        let delay = self.restart_backoff(attempt);
        warn!(pool = %pool_id, attempt, delay_secs = delay.as_secs(), "OOM detected, restarting workers");
        self.metrics.vllm_restarts_total.inc();
        let _ = self.events.send(OrchestratorEvent::PoolRestarting {
            pool_id,
            attempt,
        });
        Ok(true)
    }

    /// Exponential backoff for OOM restarts: base 5 s, factor 2, cap 5 min.
    pub fn restart_backoff(&self, attempt: u32) -> StdDuration {
        let base = self.config.restart_base_secs as f64;
        let delay = base * self.config.restart_factor.powi(attempt.saturating_sub(1) as i32);
        StdDuration::from_secs(delay.min(self.config.restart_cap_secs as f64) as u64)
    }

    /// Pool start timeout: `starting → degraded` when no worker came up in
    /// time. Called from the leader loop.
    pub async fn expire_stuck_starts(&self, now: DateTime<Utc>) -> OrchResult<u32> {
        let timeout = Duration::seconds(self.config.pool_start_timeout_secs as i64);
        let mut degraded = 0;
        for pool in self.store.list_pools().await? {
            if pool.status == PoolStatus::Starting && now - pool.started_at > timeout {
                self.degrade(pool.pool_id, "start_timeout_exceeded").await?;
                degraded += 1;
            }
        }
        Ok(degraded)
    }

    pub async fn get(&self, pool_id: Uuid) -> OrchResult<WorkerPool> {
        self.store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("pool {pool_id}")))
    }

    pub async fn list(&self) -> OrchResult<Vec<WorkerPool>> {
        self.store.list_pools().await
    }

    fn transition(&self, pool: &mut WorkerPool, to: PoolStatus) -> OrchResult<()> {
        if !pool.status.can_transition(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: pool.status,
                to,
            });
        }
        pool.status = to;
        Ok(())
    }

    fn set_status_gauge(&self, pool: &WorkerPool) {
        let value = if pool.status == PoolStatus::Running { 1 } else { 0 };
        self.metrics
            .vllm_status
            .with_label_values(&[&pool.pool_id.to_string()])
            .set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::streams::MemoryStreams;

    fn manager() -> (PoolManager, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let streams = MemoryStreams::new();
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let (events, _) = tokio::sync::broadcast::channel(16);
        let manager = PoolManager::new(
            store.clone(),
            streams,
            OrchestratorConfig::default(),
            metrics,
            events,
        );
        (manager, store)
    }

    #[tokio::test]
    async fn test_lifecycle_start_run_drain_stop() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 2, 60, t0)
            .await
            .unwrap();
        assert_eq!(pool.status, PoolStatus::Starting);

        let pool = manager.heartbeat(pool.pool_id, 2, t0).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Running);

        let pool = manager.drain(pool.pool_id).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Draining);

        let pool = manager.stop(pool.pool_id).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_is_terminal() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
            .await
            .unwrap();
        manager.heartbeat(pool.pool_id, 1, t0).await.unwrap();
        manager.drain(pool.pool_id).await.unwrap();
        manager.stop(pool.pool_id).await.unwrap();

        let err = manager.drain(pool.pool_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_oom_exhaustion_degrades() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
            .await
            .unwrap();
        manager.heartbeat(pool.pool_id, 1, t0).await.unwrap();

        for _ in 0..6 {
            let hit = manager
                .scan_worker_log(pool.pool_id, "CUDA out of memory: tried to allocate", t0)
                .await
                .unwrap();
            assert!(hit);
            assert_eq!(manager.get(pool.pool_id).await.unwrap().status, PoolStatus::Running);
        }

        // Seventh OOM exceeds the budget of 6 restarts.
        manager
            .scan_worker_log(pool.pool_id, "CUDA out of memory again", t0)
            .await
            .unwrap();
        assert_eq!(
            manager.get(pool.pool_id).await.unwrap().status,
            PoolStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_degraded_recovers_after_quiet_window() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
            .await
            .unwrap();
        manager.heartbeat(pool.pool_id, 1, t0).await.unwrap();
        manager.degrade(pool.pool_id, "heartbeat_stale").await.unwrap();

        // Recovery heartbeat with no recorded OOM re-runs the pool.
        let pool = manager.heartbeat(pool.pool_id, 1, t0).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Running);
    }

    #[tokio::test]
    async fn test_restart_backoff_schedule() {
        let (manager, _) = manager();
        assert_eq!(manager.restart_backoff(1).as_secs(), 5);
        assert_eq!(manager.restart_backoff(2).as_secs(), 10);
        assert_eq!(manager.restart_backoff(3).as_secs(), 20);
        // Capped at 5 minutes.
        assert_eq!(manager.restart_backoff(10).as_secs(), 300);
    }

    #[tokio::test]
    async fn test_start_timeout_degrades() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
            .await
            .unwrap();

        let later = t0 + Duration::seconds(300);
        let degraded = manager.expire_stuck_starts(later).await.unwrap();
        assert_eq!(degraded, 1);
        assert_eq!(
            manager.get(pool.pool_id).await.unwrap().status,
            PoolStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_non_oom_lines_ignored() {
        let (manager, _) = manager();
        let t0 = Utc::now();
        let pool = manager
            .pool_start("analyst", "mistral-7b", None, 1, 0, t0)
            .await
            .unwrap();
        let hit = manager
            .scan_worker_log(pool.pool_id, "INFO loading weights shard 3/8", t0)
            .await
            .unwrap();
        assert!(!hit);
    }
}
