//! Stale-work reclamation
//!
//! Leader-only background loop. One pass walks every active stream's
//! consumer groups looking for pending entries older than the claim
//! staleness whose owning pool is no longer live, reassigns them to another
//! live pool of the same (model, adapter) tuple or dead-letters them past
//! the attempt budget, then sweeps expired leases and refreshes the queue
//! depth gauges. The relational row is always the source of truth.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::pools::PoolManager;
use crate::store::OrchestratorStore;
use crate::streams::JobStream;
use crate::types::{
    dlq_name, stream_name, DeadLetter, JobStatus, OrchResult, OrchestratorConfig,
    OrchestratorEvent, ReclaimReport, WorkerPool,
};

/// Consumer name used when no live pool can take a reclaimed entry yet.
const ORPHAN_CONSUMER: &str = "reclaimer";

pub struct Reclaimer {
    store: Arc<dyn OrchestratorStore>,
    streams: Arc<dyn JobStream>,
    pools: Arc<PoolManager>,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
    events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
}

impl Reclaimer {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        streams: Arc<dyn JobStream>,
        pools: Arc<PoolManager>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
        events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            store,
            streams,
            pools,
            config,
            metrics,
            events,
        }
    }

    /// Run passes at the configured interval while `is_leader` holds.
    pub async fn run(
        self: Arc<Self>,
        is_leader: Arc<std::sync::atomic::AtomicBool>,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.reclaim_interval_secs,
        ));
        info!(
            interval_secs = self.config.reclaim_interval_secs,
            "reclaimer started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !is_leader.load(std::sync::atomic::Ordering::Acquire) {
                        continue;
                    }
                    if let Err(err) = self.run_pass(Utc::now()).await {
                        warn!(error = %err, "reclaim pass failed");
                    }
                }
                _ = token.cancelled() => {
                    info!("reclaimer stopping");
                    return;
                }
            }
        }
    }

    /// One full reclamation pass at `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> OrchResult<ReclaimReport> {
        let mut report = ReclaimReport::default();
        let pools = self.store.list_pools().await?;

        self.reclaim_stale_jobs(now, &pools, &mut report).await?;
        self.republish_lost_wakeups(now).await?;
        self.sweep_expired_leases(now, &pools, &mut report).await?;
        self.refresh_depth_gauges().await?;

        if report.reclaimed_leases + report.reclaimed_jobs + report.dead_lettered > 0 {
            info!(
                leases = report.reclaimed_leases,
                jobs = report.reclaimed_jobs,
                dead_lettered = report.dead_lettered,
                "reclaim pass complete"
            );
        }
        Ok(report)
    }

    async fn reclaim_stale_jobs(
        &self,
        now: DateTime<Utc>,
        pools: &[WorkerPool],
        report: &mut ReclaimReport,
    ) -> OrchResult<()> {
        let staleness_ms = self.config.claim_staleness_secs * 1000;
        let pool_stale = Duration::seconds(self.config.claim_staleness_secs as i64);

        // Group topology: one consumer group per (model, adapter) tuple.
        let mut groups: HashMap<String, Vec<&WorkerPool>> = HashMap::new();
        for pool in pools {
            groups.entry(pool.consumer_group()).or_default().push(pool);
        }

        for job_type in self.store.active_job_types().await? {
            let stream = stream_name(&job_type);
            for (group, members) in &groups {
                let pending = match self.streams.pending(&stream, group).await {
                    Ok(pending) => pending,
                    // Group may not exist on this stream yet.
                    Err(_) => continue,
                };

                for entry in pending {
                    if entry.idle_ms < staleness_ms {
                        continue;
                    }
                    let owner_live = members.iter().any(|pool| {
                        pool.pool_id.to_string() == entry.consumer
                            && pool.is_live(now, pool_stale)
                    });
                    if owner_live {
                        continue;
                    }

                    let target = members
                        .iter()
                        .find(|pool| {
                            pool.status == crate::types::PoolStatus::Running
                                && pool.is_live(now, pool_stale)
                        })
                        .map(|pool| pool.pool_id);

                    self.reclaim_entry(&stream, group, &entry.id, target, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Handle one stale pending entry: bump attempts, then reassign or
    /// dead-letter.
    async fn reclaim_entry(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
        target: Option<Uuid>,
        report: &mut ReclaimReport,
    ) -> OrchResult<()> {
        // Claim first so the payload (and thus the job id) is in hand.
        let consumer = target
            .map(|id| id.to_string())
            .unwrap_or_else(|| ORPHAN_CONSUMER.to_string());
        let Some(entry) = self.streams.claim(stream, group, &consumer, entry_id).await? else {
            return Ok(());
        };

        let Some(job_id) = entry
            .payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            // Quarantine: ack the malformed entry so it stops recycling,
            // count the violation, keep running.
            warn!(stream, entry = entry_id, "pending entry without job id quarantined");
            self.metrics.invariant_violations_total.inc();
            self.streams.ack(stream, group, entry_id).await?;
            return Ok(());
        };

        let Some(mut job) = self.store.get_job(job_id).await? else {
            warn!(%job_id, "pending entry for unknown job quarantined");
            self.metrics.invariant_violations_total.inc();
            self.streams.ack(stream, group, entry_id).await?;
            return Ok(());
        };

        if job.status.is_terminal() {
            // Terminal rows must leave the pending set within one pass.
            self.streams.ack(stream, group, entry_id).await?;
            return Ok(());
        }

        job.attempts += 1;
        job.updated_at = Utc::now();

        if job.attempts >= self.config.max_job_attempts {
            let dead_letter = DeadLetter {
                job_id,
                original_stream: stream.to_string(),
                failure_reason: "max_attempts_exceeded".to_string(),
                attempts: job.attempts,
                payload: job.payload.clone(),
            };
            self.streams
                .publish(&dlq_name(stream), &json!(dead_letter))
                .await?;
            self.streams.ack(stream, group, entry_id).await?;

            job.status = JobStatus::Dead;
            job.owner_pool = None;
            job.last_error = Some("max_attempts_exceeded".to_string());
            self.store.update_job(&job).await?;

            self.metrics.job_dead_lettered_total.inc();
            report.dead_lettered += 1;
            warn!(%job_id, attempts = job.attempts, "job dead-lettered");
            let _ = self.events.send(OrchestratorEvent::JobDeadLettered {
                job_id,
                attempts: job.attempts,
            });
        } else {
            job.status = JobStatus::Pending;
            job.owner_pool = target;
            self.store.update_job(&job).await?;

            self.metrics.job_reclaimed_total.inc();
            report.reclaimed_jobs += 1;
            info!(%job_id, to_pool = ?target, attempts = job.attempts, "job reclaimed");
            let _ = self.events.send(OrchestratorEvent::JobReclaimed {
                job_id,
                to_pool: target,
            });
        }
        Ok(())
    }

    /// DB is truth: pending rows whose wake-up entry was lost (publish
    /// failed after commit) get re-published once they look stuck.
    async fn republish_lost_wakeups(&self, now: DateTime<Utc>) -> OrchResult<()> {
        let staleness = Duration::seconds(self.config.claim_staleness_secs as i64);
        for job in self.store.list_open_jobs().await? {
            if job.status != JobStatus::Pending || now - job.updated_at <= staleness {
                continue;
            }
            let stream = stream_name(&job.job_type);
            if self.streams.depth(&stream).await.unwrap_or(0) > 0 {
                // Wake-up entries exist; the pool will get there.
                continue;
            }
            warn!(job_id = %job.job_id, stream, "re-publishing lost wake-up entry");
            self.streams
                .publish(&stream, &json!({ "job_id": job.job_id }))
                .await?;
        }
        Ok(())
    }

    async fn sweep_expired_leases(
        &self,
        now: DateTime<Utc>,
        pools: &[WorkerPool],
        report: &mut ReclaimReport,
    ) -> OrchResult<()> {
        let grace = Duration::seconds(self.config.lease_grace_secs as i64);
        let pool_stale = Duration::seconds(self.config.claim_staleness_secs as i64);

        for lease in self.store.list_leases().await? {
            if lease.expires_at > now - grace {
                continue;
            }
            if self.store.delete_lease(lease.token).await? {
                self.metrics.lease_expired_total.inc();
                report.reclaimed_leases += 1;
                info!(token = %lease.token, agent = %lease.agent_name, "lease expired");
                let _ = self
                    .events
                    .send(OrchestratorEvent::LeaseExpired { token: lease.token });
            }

            // A lease tied to a pool whose workers are gone degrades it.
            if let Some(pool_id) = lease
                .metadata
                .get("pool_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                let workers_gone = pools.iter().any(|pool| {
                    pool.pool_id == pool_id
                        && (pool.spawned_workers == 0 || !pool.is_live(now, pool_stale))
                        && pool.status != crate::types::PoolStatus::Stopped
                        && pool.status != crate::types::PoolStatus::Degraded
                });
                if workers_gone {
                    self.pools.degrade(pool_id, "lease_expired_workers_gone").await?;
                }
            }
        }
        Ok(())
    }

    async fn refresh_depth_gauges(&self) -> OrchResult<()> {
        for job_type in self.store.active_job_types().await? {
            let stream = stream_name(&job_type);
            let depth = self.streams.depth(&stream).await.unwrap_or(0);
            self.metrics
                .job_queue_depth
                .with_label_values(&[&stream])
                .set(depth as i64);
        }
        Ok(())
    }
}
