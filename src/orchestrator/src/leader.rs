//! Leader election
//!
//! Replicated orchestrators contend for a named advisory lock on the
//! relational store. Exactly one replica observes itself as leader at any
//! instant (modulo a bounded step-down gap); the leader runs the reclaimer
//! and pool-management loops, followers serve reads and answer writes with
//! 503 plus a leader hint. Stepdown releases the lock cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::store::OrchestratorStore;
use crate::types::{OrchResult, OrchestratorEvent};

/// How often a follower re-checks lock availability.
const ELECTION_INTERVAL_SECS: u64 = 5;

pub struct LeaderElector {
    store: Arc<dyn OrchestratorStore>,
    lock_name: String,
    holder_id: String,
    is_leader: Arc<AtomicBool>,
    metrics: Arc<OrchestratorMetrics>,
    events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        lock_name: &str,
        metrics: Arc<OrchestratorMetrics>,
        events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            store,
            lock_name: lock_name.to_string(),
            holder_id: format!("orchestrator-{}", Uuid::new_v4()),
            is_leader: Arc::new(AtomicBool::new(false)),
            metrics,
            events,
        }
    }

    /// Shared flag the reclaimer and pool loops gate on.
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// One election attempt; used by the loop and directly by tests.
    pub async fn try_elect(&self) -> OrchResult<bool> {
        let acquired = self
            .store
            .try_acquire_leader(&self.lock_name, &self.holder_id)
            .await?;
        let was_leader = self.is_leader.swap(acquired, Ordering::AcqRel);
        self.metrics.leader.set(if acquired { 1 } else { 0 });

        if acquired && !was_leader {
            info!(holder = %self.holder_id, lock = %self.lock_name, "elected leader");
            let _ = self.events.send(OrchestratorEvent::LeaderElected {
                holder: self.holder_id.clone(),
            });
        } else if !acquired && was_leader {
            warn!(holder = %self.holder_id, "lost leadership");
            let _ = self.events.send(OrchestratorEvent::LeaderSteppedDown {
                holder: self.holder_id.clone(),
            });
        }
        Ok(acquired)
    }

    /// Release the lock and clear the flag.
    pub async fn step_down(&self) -> OrchResult<()> {
        if self.is_leader.swap(false, Ordering::AcqRel) {
            self.store
                .release_leader(&self.lock_name, &self.holder_id)
                .await?;
            self.metrics.leader.set(0);
            info!(holder = %self.holder_id, "stepped down");
            let _ = self.events.send(OrchestratorEvent::LeaderSteppedDown {
                holder: self.holder_id.clone(),
            });
        }
        Ok(())
    }

    /// Contend for the lock until cancelled, then step down cleanly.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(ELECTION_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.try_elect().await {
                        warn!(error = %err, "leader election attempt failed");
                    }
                }
                _ = token.cancelled() => {
                    if let Err(err) = self.step_down().await {
                        warn!(error = %err, "stepdown failed");
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn elector(store: Arc<MemoryStore>) -> LeaderElector {
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let (events, _) = tokio::sync::broadcast::channel(16);
        LeaderElector::new(store, "orchestrator_leader", metrics, events)
    }

    #[tokio::test]
    async fn test_single_leader_among_replicas() {
        let store = MemoryStore::new();
        let a = elector(store.clone());
        let b = elector(store.clone());

        assert!(a.try_elect().await.unwrap());
        assert!(!b.try_elect().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());

        // Leadership is sticky across re-election attempts.
        assert!(a.try_elect().await.unwrap());

        // After stepdown the other replica wins.
        a.step_down().await.unwrap();
        assert!(b.try_elect().await.unwrap());
        assert!(!a.is_leader());
        assert!(b.is_leader());
    }
}
