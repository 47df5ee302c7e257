//! Stage-B ingestion metrics
//!
//! Embedding counters and latency histograms labelled by outcome and cache
//! disposition, registered against an ingest-owned registry that the
//! platform telemetry server gathers.

use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, Registry};

#[derive(Clone)]
pub struct StageBMetrics {
    registry: Registry,
    /// Outcomes: `ok`, `model_unavailable`, `error`.
    pub embedding_total: IntCounterVec,
    /// Labelled `cache` ∈ {hit, miss}.
    pub embedding_latency_seconds: HistogramVec,
    /// Outcomes: `ingested`, `duplicate`, `needs_review`, `failed`.
    pub articles_total: IntCounterVec,
}

impl StageBMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let embedding_total = IntCounterVec::new(
            opts!(
                "justnews_stage_b_embedding_total",
                "Embedding computations by outcome"
            ),
            &["status"],
        )?;
        let embedding_latency_seconds = HistogramVec::new(
            histogram_opts!(
                "justnews_stage_b_embedding_latency_seconds",
                "Embedding latency by cache disposition"
            ),
            &["cache"],
        )?;
        let articles_total = IntCounterVec::new(
            opts!(
                "justnews_stage_b_articles_total",
                "Pipeline outcomes per article"
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(embedding_total.clone()))?;
        registry.register(Box::new(embedding_latency_seconds.clone()))?;
        registry.register(Box::new(articles_total.clone()))?;

        Ok(Self {
            registry,
            embedding_total,
            embedding_latency_seconds,
            articles_total,
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
        let metrics = StageBMetrics::new().unwrap();
        metrics
            .embedding_total
            .with_label_values(&["model_unavailable"])
            .inc();
        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "justnews_stage_b_embedding_total"));
    }
}
