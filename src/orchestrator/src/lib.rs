//! GPU Orchestrator - Leases, Worker Pools and Durable Jobs
//!
//! The orchestrator is the platform's correctness-critical subsystem. It
//! survives process restarts (every lease, pool and job is a relational
//! row), never assigns GPU capacity beyond headroom, never loses an
//! acknowledged job (DB row is truth, the stream is only a wake-up
//! channel), reclaims work from crashed pools, and elects a single active
//! leader when replicated.
//!
//! ## Key Components
//!
//! - **LeaseManager**: headroom-checked, policy-gated, heartbeated leases
//! - **PoolManager**: worker-pool state machine with OOM restart budgets
//! - **JobQueue**: durable at-least-once job submission and claiming
//! - **Reclaimer**: leader-only stale-work and expired-lease sweeps
//! - **LeaderElector**: advisory-lock election on the relational store

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

pub mod gpu;
pub mod http;
pub mod jobs;
pub mod leader;
pub mod leases;
pub mod metrics;
pub mod policy;
pub mod pools;
pub mod reclaimer;
pub mod retry;
pub mod store;
pub mod streams;
pub mod types;

pub use gpu::{DeviceProbe, FixedProbe, NvidiaSmiProbe};
pub use jobs::{ClaimedJob, JobQueue, SubmitOptions};
pub use leader::LeaderElector;
pub use leases::LeaseManager;
pub use metrics::OrchestratorMetrics;
pub use pools::PoolManager;
pub use reclaimer::Reclaimer;
pub use store::{MemoryStore, OrchestratorStore, PgStore};
pub use streams::{JobStream, MemoryStreams, RedisStreams};
pub use types::*;

/// Version of the orchestrator crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The assembled orchestrator. Construct with injected store, stream and
/// probe implementations; call [`Orchestrator::start_background`] on the
/// instance that should contend for leadership.
pub struct Orchestrator {
    config: OrchestratorConfig,
    leases: LeaseManager,
    pools: Arc<PoolManager>,
    jobs: JobQueue,
    reclaimer: Arc<Reclaimer>,
    elector: Arc<LeaderElector>,
    metrics: Arc<OrchestratorMetrics>,
    events: tokio::sync::broadcast::Sender<OrchestratorEvent>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn OrchestratorStore>,
        streams: Arc<dyn JobStream>,
        probe: Arc<dyn DeviceProbe>,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(OrchestratorMetrics::new()?);
        let (events, _) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let leases = LeaseManager::new(
            Arc::clone(&store),
            probe,
            config.clone(),
            Arc::clone(&metrics),
        );
        let pools = Arc::new(PoolManager::new(
            Arc::clone(&store),
            Arc::clone(&streams),
            config.clone(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let jobs = JobQueue::new(
            Arc::clone(&store),
            Arc::clone(&streams),
            config.clone(),
            Arc::clone(&metrics),
        );
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&store),
            streams,
            Arc::clone(&pools),
            config.clone(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let elector = Arc::new(LeaderElector::new(
            store,
            &config.leader_lock_name,
            Arc::clone(&metrics),
            events.clone(),
        ));

        Ok(Self {
            config,
            leases,
            pools,
            jobs,
            reclaimer,
            elector,
            metrics,
            events,
            started_at: Instant::now(),
        })
    }

    /// Spawn the election and reclaimer loops.
    pub fn start_background(&self, token: CancellationToken) {
        tokio::spawn(Arc::clone(&self.elector).run(token.child_token()));
        tokio::spawn(
            Arc::clone(&self.reclaimer).run(self.elector.leader_flag(), token.child_token()),
        );
    }

    /// Writes are leader-only; followers answer with a hint.
    pub fn require_leader(&self) -> OrchResult<()> {
        if self.elector.is_leader() {
            Ok(())
        } else {
            Err(OrchestratorError::NotLeader { leader_hint: None })
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn elector(&self) -> &LeaderElector {
        &self.elector
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.metrics
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
