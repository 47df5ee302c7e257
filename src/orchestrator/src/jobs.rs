//! Durable job queue
//!
//! The relational row is the source of truth; the per-type stream is the
//! wake-up channel (at-least-once). Submission persists the row first and
//! then publishes; a publish failure after commit is left for the reclaimer
//! to repair. Backpressure fails fast with `queue_full` and never drops.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::store::OrchestratorStore;
use crate::streams::JobStream;
use crate::types::{
    stream_name, Job, JobStatus, OrchResult, OrchestratorConfig, OrchestratorError, WorkerPool,
};

/// Options accepted at submission.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct SubmitOptions {
    /// Overrides the configured per-stream pending ceiling, mostly for
    /// tests.
    pub depth_ceiling: Option<u64>,
}

/// A job handed to a worker, carrying the stream coordinates needed to ack
/// after the row reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub stream: String,
    pub entry_id: String,
}

pub struct JobQueue {
    store: Arc<dyn OrchestratorStore>,
    streams: Arc<dyn JobStream>,
    config: OrchestratorConfig,
    metrics: Arc<OrchestratorMetrics>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn OrchestratorStore>,
        streams: Arc<dyn JobStream>,
        config: OrchestratorConfig,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            store,
            streams,
            config,
            metrics,
        }
    }

    /// Durably persist a job and publish its wake-up entry. Returns the id
    /// immediately; delivery is at-least-once.
    pub async fn submit(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> OrchResult<Uuid> {
        if job_type.is_empty() {
            return Err(OrchestratorError::Validation("job type must not be empty".into()));
        }

        let stream = stream_name(job_type);
        let ceiling = options.depth_ceiling.unwrap_or(self.config.queue_depth_ceiling);
        let depth = self.streams.depth(&stream).await?;
        if depth >= ceiling {
            return Err(OrchestratorError::QueueFull {
                stream,
                depth,
                ceiling,
            });
        }

        let now = Utc::now();
        let job = Job {
            job_id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            owner_pool: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        self.store.insert_job(&job).await?;

        // DB is truth; if the publish fails the reclaimer re-publishes on
        // its next pass.
        let wakeup = json!({ "job_id": job.job_id });
        if let Err(err) = self.streams.publish(&stream, &wakeup).await {
            warn!(job_id = %job.job_id, stream, error = %err, "stream publish failed after commit");
        }

        self.metrics
            .job_queue_depth
            .with_label_values(&[&stream])
            .set(self.streams.depth(&stream).await.unwrap_or(depth + 1) as i64);

        info!(job_id = %job.job_id, job_type, "job submitted");
        Ok(job.job_id)
    }

    pub async fn get(&self, job_id: Uuid) -> OrchResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))
    }

    /// Claim the next unit of work for a pool. Only `running` pools may be
    /// assigned new work.
    ///
    /// Entries the reclaimer reassigned to this pool sit in its pending
    /// set rather than on the new-entry path, so the pending set is
    /// drained first, then new entries are read.
    pub async fn claim_next(&self, pool: &WorkerPool) -> OrchResult<Option<ClaimedJob>> {
        if pool.status != crate::types::PoolStatus::Running {
            return Ok(None);
        }

        // One stream per job type; pools consume the type named in their
        // metadata, defaulting to inference.
        let job_type = pool
            .metadata
            .get("job_type")
            .and_then(|t| t.as_str())
            .unwrap_or("inference");
        let stream = stream_name(job_type);
        let group = pool.consumer_group();
        self.streams.ensure_group(&stream, &group).await?;
        let consumer = pool.pool_id.to_string();

        for pending in self.streams.pending(&stream, &group).await? {
            if pending.consumer != consumer {
                continue;
            }
            let Some(entry) = self
                .streams
                .claim(&stream, &group, &consumer, &pending.id)
                .await?
            else {
                continue;
            };
            let Some(job_id) = entry
                .payload
                .get("job_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                // Malformed entries are the reclaimer's to quarantine.
                continue;
            };
            let Some(job) = self.store.get_job(job_id).await? else {
                continue;
            };
            // Only rows the reclaimer reset to pending are re-claimed;
            // this pool's in-flight work stays untouched.
            if job.status != JobStatus::Pending {
                continue;
            }
            return Ok(Some(self.mark_claimed(job, &stream, entry.id, pool).await?));
        }

        let entries = self.streams.read_group(&stream, &group, &consumer, 1).await?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };

        let job_id = entry
            .payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                OrchestratorError::FatalInvariant(format!(
                    "stream entry {} carries no job id",
                    entry.id
                ))
            })?;

        let job = self.get(job_id).await?;
        Ok(Some(self.mark_claimed(job, &stream, entry.id, pool).await?))
    }

    async fn mark_claimed(
        &self,
        mut job: Job,
        stream: &str,
        entry_id: String,
        pool: &WorkerPool,
    ) -> OrchResult<ClaimedJob> {
        job.status = JobStatus::Claimed;
        job.owner_pool = Some(pool.pool_id);
        job.attempts += 1;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;

        Ok(ClaimedJob {
            job,
            stream: stream.to_string(),
            entry_id,
        })
    }

    /// Move a claimed job to `running`.
    pub async fn start(&self, claimed: &mut ClaimedJob) -> OrchResult<()> {
        claimed.job.status = JobStatus::Running;
        claimed.job.updated_at = Utc::now();
        self.store.update_job(&claimed.job).await
    }

    /// Finalize a job; the stream entry is acked only after the row is in a
    /// terminal state.
    pub async fn finish(
        &self,
        claimed: &ClaimedJob,
        status: JobStatus,
        error: Option<String>,
    ) -> OrchResult<()> {
        if !status.is_terminal() {
            return Err(OrchestratorError::Validation(format!(
                "finish requires a terminal status, got {status:?}"
            )));
        }
        let mut job = claimed.job.clone();
        job.status = status;
        job.last_error = error;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;

        let group = self
            .store
            .get_pool(claimed.job.owner_pool.unwrap_or_default())
            .await?
            .map(|p| p.consumer_group());
        if let Some(group) = group {
            self.streams
                .ack(&claimed.stream, &group, &claimed.entry_id)
                .await?;
        }
        Ok(())
    }
}
