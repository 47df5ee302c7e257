//! Core type definitions for the GPU Orchestrator
//!
//! Leases, worker pools, durable jobs, the pool state machine, stream
//! payloads, configuration and the orchestrator error taxonomy. Rows are
//! persisted relationally (source of truth) and mirrored onto streams as a
//! wake-up channel, so every type here serializes with serde.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lease acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
    /// Exclusive use of one GPU slot by one agent.
    Exclusive,
    /// Multiple leases on the same GPU are permitted.
    Shared,
    /// CPU-only work, no GPU index assigned.
    Cpu,
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseMode::Exclusive => write!(f, "exclusive"),
            LeaseMode::Shared => write!(f, "shared"),
            LeaseMode::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for LeaseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclusive" => Ok(LeaseMode::Exclusive),
            "shared" => Ok(LeaseMode::Shared),
            "cpu" => Ok(LeaseMode::Cpu),
            other => Err(format!("unknown lease mode `{other}`")),
        }
    }
}

/// A durable GPU reservation.
///
/// A lease is **live** iff `expires_at > now` and the heartbeat is not
/// stale. Expired leases are removed by the reclaimer; release is always
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub agent_name: String,
    /// None in CPU mode.
    pub gpu_index: Option<u32>,
    pub mode: LeaseMode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Lease {
    /// Expired once strictly past `expires_at`; a heartbeat landing exactly
    /// at `expires_at` still extends.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_live(&self, now: DateTime<Utc>, stale_threshold: Duration) -> bool {
        !self.is_expired(now) && self.last_heartbeat > now - stale_threshold
    }
}

/// Request body for `POST /leases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub agent: String,
    pub mode: LeaseMode,
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Worker pool lifecycle states.
///
/// ```text
/// starting → running      (first healthy heartbeat)
/// starting → degraded     (start timeout exceeded)
/// running  → draining     (explicit drain / idle past hold)
/// running  → degraded     (stale heartbeat or OOM)
/// degraded → running      (heartbeat resumed, no further OOM)
/// draining → stopped      (in-flight work finalized)
/// degraded → stopped      (operator intervention)
/// stopped  → (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
    Degraded,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Starting => "starting",
            PoolStatus::Running => "running",
            PoolStatus::Draining => "draining",
            PoolStatus::Stopped => "stopped",
            PoolStatus::Degraded => "degraded",
        }
    }

    /// Whether `self → to` is a permitted transition.
    pub fn can_transition(&self, to: PoolStatus) -> bool {
        use PoolStatus::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Degraded)
                | (Running, Draining)
                | (Running, Degraded)
                | (Degraded, Running)
                | (Draining, Stopped)
                | (Degraded, Stopped)
        )
    }
}

impl FromStr for PoolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(PoolStatus::Starting),
            "running" => Ok(PoolStatus::Running),
            "draining" => Ok(PoolStatus::Draining),
            "stopped" => Ok(PoolStatus::Stopped),
            "degraded" => Ok(PoolStatus::Degraded),
            other => Err(format!("unknown pool status `{other}`")),
        }
    }
}

/// A set of workers bound to one (model, adapter) tuple, consuming from a
/// single stream consumer-group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPool {
    pub pool_id: Uuid,
    pub agent_name: String,
    pub model_id: String,
    pub adapter: Option<String>,
    pub desired_workers: u32,
    pub spawned_workers: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: PoolStatus,
    /// Linger after going idle before the pool drains itself.
    pub hold_seconds: u64,
    pub metadata: serde_json::Value,
}

impl WorkerPool {
    /// Consumer-group name encoding the (model, adapter) tuple.
    pub fn consumer_group(&self) -> String {
        consumer_group(&self.model_id, self.adapter.as_deref())
    }

    /// A pool is live for scheduling purposes while its heartbeat is fresh
    /// and it is `running` or `draining`.
    pub fn is_live(&self, now: DateTime<Utc>, stale_threshold: Duration) -> bool {
        matches!(self.status, PoolStatus::Running | PoolStatus::Draining)
            && self.last_heartbeat > now - stale_threshold
    }
}

pub fn consumer_group(model_id: &str, adapter: Option<&str>) -> String {
    match adapter {
        Some(adapter) => format!("pool:{model_id}:{adapter}"),
        None => format!("pool:{model_id}"),
    }
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    /// Terminal: exhausted its attempts and was dead-lettered.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Dead)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// A durable unit of orchestrator work. The relational row is the source of
/// truth; the stream entry is only the wake-up signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub owner_pool: Option<Uuid>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Stream name for live work of one job type.
pub fn stream_name(job_type: &str) -> String {
    format!("stream:orchestrator:{job_type}")
}

/// Dead-letter variant of a stream.
pub fn dlq_name(stream: &str) -> String {
    format!("{stream}:dlq")
}

/// Payload shape appended to a dead-letter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job_id: Uuid,
    pub original_stream: String,
    pub failure_reason: String,
    pub attempts: u32,
    pub payload: serde_json::Value,
}

/// Events emitted by the orchestrator control loops.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    LeaseExpired { token: Uuid },
    PoolDegraded { pool_id: Uuid, reason: String },
    PoolRestarting { pool_id: Uuid, attempt: u32 },
    JobReclaimed { job_id: Uuid, to_pool: Option<Uuid> },
    JobDeadLettered { job_id: Uuid, attempts: u32 },
    LeaderElected { holder: String },
    LeaderSteppedDown { holder: String },
}

/// Summary of one reclaimer pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub reclaimed_leases: u64,
    pub reclaimed_jobs: u64,
    pub dead_lettered: u64,
}

/// Per-agent policy entry consulted before granting a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub allowed_models: Vec<String>,
    pub vram_budget_mb: u64,
}

/// Orchestrator configuration, environment-sourced.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lease_ttl_secs: u64,
    /// Heartbeat staleness beyond which a lease stops counting as live.
    pub lease_stale_secs: u64,
    /// Grace past expiry before the reclaimer deletes a lease row.
    pub lease_grace_secs: u64,
    pub claim_staleness_secs: u64,
    pub max_job_attempts: u32,
    pub reclaim_interval_secs: u64,
    pub leader_lock_name: String,
    /// Pending-depth ceiling per stream before `queue_full`.
    pub queue_depth_ceiling: u64,
    /// Free memory that must remain after granting a lease.
    pub headroom_min_free_mb: u64,
    pub allow_unprobed_gpu: bool,
    /// Worker restart backoff after an OOM.
    pub restart_base_secs: u64,
    pub restart_factor: f64,
    pub restart_cap_secs: u64,
    pub restart_max_attempts: u32,
    /// Pool start timeout before `starting → degraded`.
    pub pool_start_timeout_secs: u64,
    pub agent_model_map: HashMap<String, AgentPolicy>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            lease_stale_secs: 600,
            lease_grace_secs: 30,
            claim_staleness_secs: 120,
            max_job_attempts: 5,
            reclaim_interval_secs: 30,
            leader_lock_name: "orchestrator_leader".to_string(),
            queue_depth_ceiling: 1000,
            headroom_min_free_mb: 1024,
            allow_unprobed_gpu: false,
            restart_base_secs: 5,
            restart_factor: 2.0,
            restart_cap_secs: 300,
            restart_max_attempts: 6,
            pool_start_timeout_secs: 120,
            agent_model_map: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Build from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("ORCH_LEASE_TTL_SECONDS") {
            config.lease_ttl_secs = v;
        }
        if let Some(v) = env_u64("ORCH_CLAIM_STALENESS_SECONDS") {
            config.claim_staleness_secs = v;
        }
        if let Some(v) = env_u64("ORCH_MAX_JOB_ATTEMPTS") {
            config.max_job_attempts = v as u32;
        }
        if let Some(v) = env_u64("ORCH_RECLAIM_INTERVAL_SECONDS") {
            config.reclaim_interval_secs = v;
        }
        if let Ok(v) = std::env::var("ORCH_LEADER_LOCK_NAME") {
            if !v.is_empty() {
                config.leader_lock_name = v;
            }
        }
        if let Some(v) = env_u64("ORCH_QUEUE_DEPTH_CEILING") {
            config.queue_depth_ceiling = v;
        }
        if let Ok(v) = std::env::var("ORCH_ALLOW_UNPROBED_GPU") {
            config.allow_unprobed_gpu = matches!(v.as_str(), "true" | "1" | "yes");
        }
        if let Ok(raw) = std::env::var("AGENT_MODEL_MAP") {
            if let Ok(map) = serde_json::from_str::<HashMap<String, AgentPolicy>>(&raw) {
                config.agent_model_map = map;
            }
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("insufficient GPU headroom on gpu {gpu_index}: {free_mb} MB free, {required_mb} MB required")]
    InsufficientHeadroom {
        gpu_index: u32,
        free_mb: u64,
        required_mb: u64,
    },

    #[error("agent `{agent}` is not permitted to run model `{model}`")]
    DeniedByPolicy { agent: String, model: String },

    #[error("GPU headroom unknown: {0}")]
    HeadroomUnknown(String),

    #[error("unknown lease {0}")]
    UnknownLease(Uuid),

    #[error("lease {0} has expired")]
    ExpiredLease(Uuid),

    #[error("stream `{stream}` pending depth {depth} at ceiling {ceiling}")]
    QueueFull {
        stream: String,
        depth: u64,
        ceiling: u64,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("not the leader{}", leader_hint.as_deref().map(|h| format!(", leader at {h}")).unwrap_or_default())]
    NotLeader { leader_hint: Option<String> },

    #[error("invalid pool transition {from:?} → {to:?}")]
    InvalidTransition { from: PoolStatus, to: PoolStatus },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),

    #[error("invariant violation: {0}")]
    FatalInvariant(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InsufficientHeadroom { .. } => "precondition_failed",
            OrchestratorError::DeniedByPolicy { .. } => "precondition_failed",
            OrchestratorError::HeadroomUnknown(_) => "headroom_unknown",
            OrchestratorError::UnknownLease(_) => "not_found",
            OrchestratorError::ExpiredLease(_) => "expired_lease",
            OrchestratorError::QueueFull { .. } => "queue_full",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::NotLeader { .. } => "precondition_failed",
            OrchestratorError::InvalidTransition { .. } => "conflict",
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::Transient(_) => "transient_infra_error",
            OrchestratorError::DeadlineExceeded(_) => "deadline_exceeded",
            OrchestratorError::FatalInvariant(_) => "fatal_invariant_violation",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::InsufficientHeadroom { .. }
            | OrchestratorError::DeniedByPolicy { .. }
            | OrchestratorError::HeadroomUnknown(_)
            | OrchestratorError::QueueFull { .. } => 409,
            OrchestratorError::UnknownLease(_) | OrchestratorError::NotFound(_) => 404,
            OrchestratorError::ExpiredLease(_) => 410,
            OrchestratorError::NotLeader { .. } => 503,
            OrchestratorError::InvalidTransition { .. } => 409,
            OrchestratorError::Validation(_) => 400,
            OrchestratorError::Transient(_) => 503,
            OrchestratorError::DeadlineExceeded(_) => 504,
            OrchestratorError::FatalInvariant(_) => 500,
        }
    }
}

pub type OrchResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_transitions() {
        assert!(PoolStatus::Starting.can_transition(PoolStatus::Running));
        assert!(PoolStatus::Running.can_transition(PoolStatus::Degraded));
        assert!(PoolStatus::Degraded.can_transition(PoolStatus::Running));
        assert!(PoolStatus::Draining.can_transition(PoolStatus::Stopped));
        assert!(!PoolStatus::Stopped.can_transition(PoolStatus::Running));
        assert!(!PoolStatus::Starting.can_transition(PoolStatus::Draining));
    }

    #[test]
    fn test_stream_naming() {
        assert_eq!(stream_name("inference"), "stream:orchestrator:inference");
        assert_eq!(
            dlq_name(&stream_name("inference")),
            "stream:orchestrator:inference:dlq"
        );
        assert_eq!(consumer_group("mistral-7b", None), "pool:mistral-7b");
        assert_eq!(
            consumer_group("mistral-7b", Some("headline")),
            "pool:mistral-7b:headline"
        );
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let now = Utc::now();
        let lease = Lease {
            token: Uuid::new_v4(),
            agent_name: "analyst".into(),
            gpu_index: Some(0),
            mode: LeaseMode::Exclusive,
            created_at: now,
            expires_at: now,
            last_heartbeat: now,
            metadata: serde_json::Value::Null,
        };
        // Exactly at expires_at the lease is not yet expired.
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + Duration::nanoseconds(1)));
    }

    #[test]
    fn test_config_env_overrides() {
        std::env::set_var("ORCH_MAX_JOB_ATTEMPTS", "7");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.max_job_attempts, 7);
        std::env::remove_var("ORCH_MAX_JOB_ATTEMPTS");
    }
}
