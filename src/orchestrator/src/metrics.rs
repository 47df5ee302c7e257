//! Orchestrator metrics
//!
//! Counters and gauges for lease expiry, job reclamation, queue depth and
//! worker-pool health, registered against an orchestrator-owned registry
//! gathered by the platform telemetry server.

use prometheus::{opts, IntCounter, IntGauge, IntGaugeVec, Registry};

#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    pub lease_expired_total: IntCounter,
    pub job_reclaimed_total: IntCounter,
    pub job_dead_lettered_total: IntCounter,
    pub job_queue_depth: IntGaugeVec,
    pub vllm_restarts_total: IntCounter,
    pub vllm_ooms_total: IntCounter,
    /// 1 = running, 0 = anything else, labelled by pool.
    pub vllm_status: IntGaugeVec,
    /// Alert counter for quarantined records.
    pub invariant_violations_total: IntCounter,
    pub leader: IntGauge,
}

impl OrchestratorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let lease_expired_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_lease_expired_total",
            "Leases removed after expiry"
        ))?;
        let job_reclaimed_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_job_reclaimed_total",
            "Jobs reassigned from dead pools"
        ))?;
        let job_dead_lettered_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_job_dead_lettered_total",
            "Jobs moved to a dead-letter stream"
        ))?;
        let job_queue_depth = IntGaugeVec::new(
            opts!(
                "gpu_orchestrator_job_queue_depth",
                "Unacked depth per stream"
            ),
            &["stream"],
        )?;
        let vllm_restarts_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_vllm_restarts_total",
            "Worker restarts after OOM"
        ))?;
        let vllm_ooms_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_vllm_ooms_total",
            "Out-of-memory events observed in worker logs"
        ))?;
        let vllm_status = IntGaugeVec::new(
            opts!(
                "gpu_orchestrator_vllm_status",
                "Pool status (1 = running, 0 = otherwise)"
            ),
            &["pool"],
        )?;
        let invariant_violations_total = IntCounter::with_opts(opts!(
            "gpu_orchestrator_invariant_violations_total",
            "Quarantined records"
        ))?;
        let leader = IntGauge::with_opts(opts!(
            "gpu_orchestrator_leader",
            "1 when this replica is the elected leader"
        ))?;

        registry.register(Box::new(lease_expired_total.clone()))?;
        registry.register(Box::new(job_reclaimed_total.clone()))?;
        registry.register(Box::new(job_dead_lettered_total.clone()))?;
        registry.register(Box::new(job_queue_depth.clone()))?;
        registry.register(Box::new(vllm_restarts_total.clone()))?;
        registry.register(Box::new(vllm_ooms_total.clone()))?;
        registry.register(Box::new(vllm_status.clone()))?;
        registry.register(Box::new(invariant_violations_total.clone()))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            lease_expired_total,
            job_reclaimed_total,
            job_dead_lettered_total,
            job_queue_depth,
            vllm_restarts_total,
            vllm_ooms_total,
            vllm_status,
            invariant_violations_total,
            leader,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let metrics = OrchestratorMetrics::new().unwrap();
        metrics.lease_expired_total.inc();
        metrics
            .job_queue_depth
            .with_label_values(&["stream:orchestrator:inference"])
            .set(3);
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "gpu_orchestrator_lease_expired_total"));
    }
}
