//! Durable state access
//!
//! `OrchestratorStore` is the single seam between the control loops and the
//! relational store. The Postgres implementation uses single-statement
//! transactions with row-level locking; the in-memory implementation backs
//! tests and CLI dry runs. Both are injected at process startup.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{
    Job, JobStatus, Lease, LeaseMode, OrchResult, OrchestratorError, PoolStatus, WorkerPool,
};

/// Storage seam for leases, pools, jobs and the leader lock.
#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn insert_lease(&self, lease: &Lease) -> OrchResult<()>;
    async fn get_lease(&self, token: Uuid) -> OrchResult<Option<Lease>>;
    /// Single-row update; last write wins on `expires_at`.
    async fn update_lease_times(
        &self,
        token: Uuid,
        expires_at: DateTime<Utc>,
        heartbeat_at: DateTime<Utc>,
    ) -> OrchResult<Option<Lease>>;
    /// Returns whether a row was actually removed.
    async fn delete_lease(&self, token: Uuid) -> OrchResult<bool>;
    async fn list_leases(&self) -> OrchResult<Vec<Lease>>;

    async fn insert_pool(&self, pool: &WorkerPool) -> OrchResult<()>;
    async fn get_pool(&self, pool_id: Uuid) -> OrchResult<Option<WorkerPool>>;
    async fn update_pool(&self, pool: &WorkerPool) -> OrchResult<()>;
    async fn list_pools(&self) -> OrchResult<Vec<WorkerPool>>;

    async fn insert_job(&self, job: &Job) -> OrchResult<()>;
    async fn get_job(&self, job_id: Uuid) -> OrchResult<Option<Job>>;
    async fn update_job(&self, job: &Job) -> OrchResult<()>;
    /// Non-terminal job rows, oldest first.
    async fn list_open_jobs(&self) -> OrchResult<Vec<Job>>;
    /// Distinct job types with non-terminal rows; drives the reclaimer scan.
    async fn active_job_types(&self) -> OrchResult<Vec<String>>;

    /// Advisory leader lock. `holder` identifies the replica.
    async fn try_acquire_leader(&self, lock_name: &str, holder: &str) -> OrchResult<bool>;
    async fn release_leader(&self, lock_name: &str, holder: &str) -> OrchResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory store for tests and dry runs. Shared via `Arc` so several
/// replicas in one process can contend for the same leader lock.
#[derive(Default)]
pub struct MemoryStore {
    leases: Mutex<HashMap<Uuid, Lease>>,
    pools: Mutex<HashMap<Uuid, WorkerPool>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
    leader: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl OrchestratorStore for MemoryStore {
    async fn insert_lease(&self, lease: &Lease) -> OrchResult<()> {
        self.leases.lock().await.insert(lease.token, lease.clone());
        Ok(())
    }

    async fn get_lease(&self, token: Uuid) -> OrchResult<Option<Lease>> {
        Ok(self.leases.lock().await.get(&token).cloned())
    }

    async fn update_lease_times(
        &self,
        token: Uuid,
        expires_at: DateTime<Utc>,
        heartbeat_at: DateTime<Utc>,
    ) -> OrchResult<Option<Lease>> {
        let mut leases = self.leases.lock().await;
        Ok(leases.get_mut(&token).map(|lease| {
            lease.expires_at = expires_at;
            lease.last_heartbeat = heartbeat_at;
            lease.clone()
        }))
    }

    async fn delete_lease(&self, token: Uuid) -> OrchResult<bool> {
        Ok(self.leases.lock().await.remove(&token).is_some())
    }

    async fn list_leases(&self) -> OrchResult<Vec<Lease>> {
        Ok(self.leases.lock().await.values().cloned().collect())
    }

    async fn insert_pool(&self, pool: &WorkerPool) -> OrchResult<()> {
        self.pools.lock().await.insert(pool.pool_id, pool.clone());
        Ok(())
    }

    async fn get_pool(&self, pool_id: Uuid) -> OrchResult<Option<WorkerPool>> {
        Ok(self.pools.lock().await.get(&pool_id).cloned())
    }

    async fn update_pool(&self, pool: &WorkerPool) -> OrchResult<()> {
        self.pools.lock().await.insert(pool.pool_id, pool.clone());
        Ok(())
    }

    async fn list_pools(&self) -> OrchResult<Vec<WorkerPool>> {
        Ok(self.pools.lock().await.values().cloned().collect())
    }

    async fn insert_job(&self, job: &Job) -> OrchResult<()> {
        self.jobs.lock().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> OrchResult<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn update_job(&self, job: &Job) -> OrchResult<()> {
        self.jobs.lock().await.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn list_open_jobs(&self) -> OrchResult<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut open: Vec<Job> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|j| j.created_at);
        Ok(open)
    }

    async fn active_job_types(&self) -> OrchResult<Vec<String>> {
        let jobs = self.jobs.lock().await;
        let mut types: Vec<String> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.job_type.clone())
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    async fn try_acquire_leader(&self, lock_name: &str, holder: &str) -> OrchResult<bool> {
        let mut leader = self.leader.lock().await;
        match leader.get(lock_name) {
            Some(current) => Ok(current == holder),
            None => {
                leader.insert(lock_name.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    async fn release_leader(&self, lock_name: &str, holder: &str) -> OrchResult<()> {
        let mut leader = self.leader.lock().await;
        if leader.get(lock_name).map(|h| h.as_str()) == Some(holder) {
            leader.remove(lock_name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// Postgres-backed store. The advisory leader lock is session-scoped, so it
/// is taken on a dedicated connection held for the leadership term.
pub struct PgStore {
    pool: PgPool,
    leader_conn: Mutex<Option<sqlx::pool::PoolConnection<sqlx::Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            leader_conn: Mutex::new(None),
        }
    }

    /// Stable 64-bit key for a named advisory lock; must agree across
    /// replicas and processes, so it hashes the name with SHA-256.
    fn advisory_key(lock_name: &str) -> i64 {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(lock_name.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

fn transient(err: sqlx::Error) -> OrchestratorError {
    OrchestratorError::Transient(err.to_string())
}

fn lease_from_row(row: &sqlx::postgres::PgRow) -> OrchResult<Lease> {
    let mode: String = row.try_get("mode").map_err(transient)?;
    Ok(Lease {
        token: row.try_get("token").map_err(transient)?,
        agent_name: row.try_get("agent_name").map_err(transient)?,
        gpu_index: row
            .try_get::<Option<i32>, _>("gpu_index")
            .map_err(transient)?
            .map(|i| i as u32),
        mode: LeaseMode::from_str(&mode).map_err(OrchestratorError::FatalInvariant)?,
        created_at: row.try_get("created_at").map_err(transient)?,
        expires_at: row.try_get("expires_at").map_err(transient)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(transient)?,
        metadata: row.try_get("metadata").map_err(transient)?,
    })
}

fn pool_from_row(row: &sqlx::postgres::PgRow) -> OrchResult<WorkerPool> {
    let status: String = row.try_get("status").map_err(transient)?;
    Ok(WorkerPool {
        pool_id: row.try_get("pool_id").map_err(transient)?,
        agent_name: row.try_get("agent_name").map_err(transient)?,
        model_id: row.try_get("model_id").map_err(transient)?,
        adapter: row.try_get("adapter").map_err(transient)?,
        desired_workers: row.try_get::<i32, _>("desired_workers").map_err(transient)? as u32,
        spawned_workers: row.try_get::<i32, _>("spawned_workers").map_err(transient)? as u32,
        started_at: row.try_get("started_at").map_err(transient)?,
        last_heartbeat: row.try_get("last_heartbeat").map_err(transient)?,
        status: PoolStatus::from_str(&status).map_err(OrchestratorError::FatalInvariant)?,
        hold_seconds: row.try_get::<i64, _>("hold_seconds").map_err(transient)? as u64,
        metadata: row.try_get("metadata").map_err(transient)?,
    })
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> OrchResult<Job> {
    let status: String = row.try_get("status").map_err(transient)?;
    Ok(Job {
        job_id: row.try_get("job_id").map_err(transient)?,
        job_type: row.try_get("type").map_err(transient)?,
        payload: row.try_get("payload").map_err(transient)?,
        status: JobStatus::from_str(&status).map_err(OrchestratorError::FatalInvariant)?,
        owner_pool: row.try_get("owner_pool").map_err(transient)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(transient)? as u32,
        created_at: row.try_get("created_at").map_err(transient)?,
        updated_at: row.try_get("updated_at").map_err(transient)?,
        last_error: row.try_get("last_error").map_err(transient)?,
    })
}

#[async_trait]
impl OrchestratorStore for PgStore {
    async fn insert_lease(&self, lease: &Lease) -> OrchResult<()> {
        sqlx::query(
            "INSERT INTO orchestrator_leases \
             (token, agent_name, gpu_index, mode, created_at, expires_at, last_heartbeat, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(lease.token)
        .bind(&lease.agent_name)
        .bind(lease.gpu_index.map(|i| i as i32))
        .bind(lease.mode.to_string())
        .bind(lease.created_at)
        .bind(lease.expires_at)
        .bind(lease.last_heartbeat)
        .bind(&lease.metadata)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn get_lease(&self, token: Uuid) -> OrchResult<Option<Lease>> {
        crate::retry::with_backoff("get_lease", || async move {
            let row = sqlx::query("SELECT * FROM orchestrator_leases WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(transient)?;
            row.as_ref().map(lease_from_row).transpose()
        })
        .await
    }

    async fn update_lease_times(
        &self,
        token: Uuid,
        expires_at: DateTime<Utc>,
        heartbeat_at: DateTime<Utc>,
    ) -> OrchResult<Option<Lease>> {
        let row = sqlx::query(
            "UPDATE orchestrator_leases SET expires_at = $2, last_heartbeat = $3 \
             WHERE token = $1 RETURNING *",
        )
        .bind(token)
        .bind(expires_at)
        .bind(heartbeat_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn delete_lease(&self, token: Uuid) -> OrchResult<bool> {
        let result = sqlx::query("DELETE FROM orchestrator_leases WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_leases(&self) -> OrchResult<Vec<Lease>> {
        crate::retry::with_backoff("list_leases", || async {
            let rows = sqlx::query("SELECT * FROM orchestrator_leases ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .map_err(transient)?;
            rows.iter().map(lease_from_row).collect()
        })
        .await
    }

    async fn insert_pool(&self, pool: &WorkerPool) -> OrchResult<()> {
        sqlx::query(
            "INSERT INTO worker_pools \
             (pool_id, agent_name, model_id, adapter, desired_workers, spawned_workers, \
              started_at, last_heartbeat, status, hold_seconds, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(pool.pool_id)
        .bind(&pool.agent_name)
        .bind(&pool.model_id)
        .bind(&pool.adapter)
        .bind(pool.desired_workers as i32)
        .bind(pool.spawned_workers as i32)
        .bind(pool.started_at)
        .bind(pool.last_heartbeat)
        .bind(pool.status.as_str())
        .bind(pool.hold_seconds as i64)
        .bind(&pool.metadata)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn get_pool(&self, pool_id: Uuid) -> OrchResult<Option<WorkerPool>> {
        let row = sqlx::query("SELECT * FROM worker_pools WHERE pool_id = $1")
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        row.as_ref().map(pool_from_row).transpose()
    }

    async fn update_pool(&self, pool: &WorkerPool) -> OrchResult<()> {
        sqlx::query(
            "UPDATE worker_pools SET spawned_workers = $2, last_heartbeat = $3, status = $4, \
             metadata = $5 WHERE pool_id = $1",
        )
        .bind(pool.pool_id)
        .bind(pool.spawned_workers as i32)
        .bind(pool.last_heartbeat)
        .bind(pool.status.as_str())
        .bind(&pool.metadata)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn list_pools(&self) -> OrchResult<Vec<WorkerPool>> {
        crate::retry::with_backoff("list_pools", || async {
            let rows = sqlx::query("SELECT * FROM worker_pools ORDER BY started_at")
                .fetch_all(&self.pool)
                .await
                .map_err(transient)?;
            rows.iter().map(pool_from_row).collect()
        })
        .await
    }

    async fn insert_job(&self, job: &Job) -> OrchResult<()> {
        sqlx::query(
            "INSERT INTO orchestrator_jobs \
             (job_id, type, payload, status, owner_pool, attempts, created_at, updated_at, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(job.job_id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.owner_pool)
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> OrchResult<Option<Job>> {
        crate::retry::with_backoff("get_job", || async move {
            let row = sqlx::query("SELECT * FROM orchestrator_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(transient)?;
            row.as_ref().map(job_from_row).transpose()
        })
        .await
    }

    async fn update_job(&self, job: &Job) -> OrchResult<()> {
        sqlx::query(
            "UPDATE orchestrator_jobs SET status = $2, owner_pool = $3, attempts = $4, \
             updated_at = $5, last_error = $6 WHERE job_id = $1",
        )
        .bind(job.job_id)
        .bind(job.status.as_str())
        .bind(job.owner_pool)
        .bind(job.attempts as i32)
        .bind(job.updated_at)
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(())
    }

    async fn list_open_jobs(&self) -> OrchResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM orchestrator_jobs \
             WHERE status NOT IN ('succeeded', 'failed', 'dead') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn active_job_types(&self) -> OrchResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT type FROM orchestrator_jobs \
             WHERE status NOT IN ('succeeded', 'failed', 'dead')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("type").map_err(transient))
            .collect()
    }

    async fn try_acquire_leader(&self, lock_name: &str, _holder: &str) -> OrchResult<bool> {
        let key = Self::advisory_key(lock_name);
        let mut guard = self.leader_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.pool.acquire().await.map_err(transient)?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| OrchestratorError::Transient("leader connection lost".into()))?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await
            .map_err(transient)?;
        let acquired: bool = row.try_get("acquired").map_err(transient)?;
        if !acquired {
            // Return the connection to the pool while following.
            *guard = None;
        }
        Ok(acquired)
    }

    async fn release_leader(&self, lock_name: &str, _holder: &str) -> OrchResult<()> {
        let key = Self::advisory_key(lock_name);
        let mut guard = self.leader_conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .execute(conn.as_mut())
                .await
                .map_err(transient)?;
        }
        *guard = None;
        Ok(())
    }
}
