//! Bus metrics
//!
//! Prometheus counters and histograms for routed calls, breaker activity
//! and probe cycles, registered against a bus-owned registry that the
//! platform telemetry server gathers.

use std::time::Duration;

use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};

#[derive(Clone)]
pub struct BusMetrics {
    registry: Registry,
    /// Calls routed, labelled by agent and outcome.
    pub calls_total: IntCounterVec,
    /// Routed call latency for successful calls.
    pub call_latency_seconds: HistogramVec,
    /// Completed health probe cycles.
    pub probe_cycles_total: IntCounter,
    /// Registered agent count.
    pub registered_agents: IntGauge,
}

impl BusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let calls_total = IntCounterVec::new(
            opts!("mcp_bus_calls_total", "Calls routed through the bus"),
            &["agent", "outcome"],
        )?;
        let call_latency_seconds = HistogramVec::new(
            histogram_opts!(
                "mcp_bus_call_latency_seconds",
                "Latency of successful routed calls"
            ),
            &["agent"],
        )?;
        let probe_cycles_total = IntCounter::with_opts(opts!(
            "mcp_bus_probe_cycles_total",
            "Completed health probe cycles"
        ))?;
        let registered_agents = IntGauge::with_opts(opts!(
            "mcp_bus_registered_agents",
            "Agents currently registered"
        ))?;

        registry.register(Box::new(calls_total.clone()))?;
        registry.register(Box::new(call_latency_seconds.clone()))?;
        registry.register(Box::new(probe_cycles_total.clone()))?;
        registry.register(Box::new(registered_agents.clone()))?;

        Ok(Self {
            registry,
            calls_total,
            call_latency_seconds,
            probe_cycles_total,
            registered_agents,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_call(&self, agent: &str, outcome: &str) {
        self.calls_total.with_label_values(&[agent, outcome]).inc();
    }

    pub fn observe_latency(&self, agent: &str, elapsed: Duration) {
        self.call_latency_seconds
            .with_label_values(&[agent])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_probe_cycle(&self) {
        self.probe_cycles_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let metrics = BusMetrics::new().unwrap();
        metrics.record_call("analyst", "ok");
        metrics.record_call("analyst", "timeout");
        metrics.observe_latency("analyst", Duration::from_millis(25));

        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "mcp_bus_calls_total"));
    }
}
