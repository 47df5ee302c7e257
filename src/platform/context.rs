use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit_logging::AuditLogger;
use crate::platform::config::PlatformConfig;
use crate::rate_limiting::RateLimiter;

/// Shared handle threaded into every platform service. Stores are built by
/// the services that own them; the context carries only cross-cutting
/// state.
#[derive(Clone)]
pub struct PlatformContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: PlatformConfig,
    audit_logger: Arc<AuditLogger>,
    rate_limiter: Arc<RateLimiter>,
    /// Per-subsystem metric registries gathered by the telemetry server.
    registries: Vec<prometheus::Registry>,
}

impl PlatformContext {
    pub(crate) fn new(
        config: PlatformConfig,
        audit_logger: Arc<AuditLogger>,
        rate_limiter: Arc<RateLimiter>,
        registries: Vec<prometheus::Registry>,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            audit_logger,
            rate_limiter,
            registries,
        };

        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.shared.config
    }

    pub fn audit_logger(&self) -> Arc<AuditLogger> {
        Arc::clone(&self.shared.audit_logger)
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.shared.rate_limiter)
    }

    pub fn registries(&self) -> &[prometheus::Registry] {
        &self.shared.registries
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
