use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit_logging::AuditLogger;
use crate::platform::config::{AuditSettings, PlatformConfig};
use crate::platform::context::PlatformContext;
use crate::platform::service::ServiceRegistration;
use crate::platform::telemetry::telemetry_service;
use crate::rate_limiting::RateLimiter;

/// Platform assembly: collects service registrations and subsystem metric
/// registries, then boots everything with one shared cancellation tree.
pub struct Platform {
    config: PlatformConfig,
    services: Vec<ServiceRegistration>,
    registries: Vec<prometheus::Registry>,
}

impl Platform {
    pub fn new(config: PlatformConfig) -> Self {
        let mut services = Vec::new();
        services.push(telemetry_service(config.observability.clone()));

        Self {
            config,
            services,
            registries: Vec::new(),
        }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.services.push(service);
    }

    /// Expose a subsystem's metric registry through the telemetry server.
    pub fn register_metrics(&mut self, registry: prometheus::Registry) {
        self.registries.push(registry);
    }

    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let audit_logger = Arc::new(init_audit_logger(&self.config.audit)?);
        let rate_limiter = Arc::new(RateLimiter::from_settings(&self.config.rate_limiting));

        let root_token = CancellationToken::new();
        let context = PlatformContext::new(
            self.config.clone(),
            audit_logger,
            rate_limiter,
            self.registries,
            root_token.child_token(),
        );

        let mut tasks = Vec::new();
        for service in self.services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!("platform boot completed");

        Ok(PlatformRuntime {
            context,
            cancel_token: root_token,
            tasks,
        })
    }
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    /// Cancel every service and await clean exits.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => {
                    return Err(err);
                }
                Err(err) => {
                    return Err(err.into());
                }
            }
        }

        Ok(())
    }

    /// Block until SIGINT, then shut down.
    pub async fn run_until_interrupted(self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received, shutting down");
        self.shutdown().await
    }
}

fn initialize_logging(config: &PlatformConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter.as_str())
        .try_init();
}

fn init_audit_logger(settings: &AuditSettings) -> Result<AuditLogger> {
    AuditLogger::new(&settings.log_path, settings.retention_days)
        .map_err(|err| anyhow::anyhow!(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{opts, IntCounter, Registry};
    use std::time::Duration;

    #[tokio::test]
    async fn test_boot_serves_registered_metrics_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PlatformConfig::default();
        config.observability.metrics_port = 19309;
        config.audit.log_path = dir
            .path()
            .join("audit.log")
            .to_string_lossy()
            .to_string();

        let registry = Registry::new();
        let counter =
            IntCounter::with_opts(opts!("platform_boot_test_total", "boot test counter")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let mut platform = Platform::new(config);
        platform.register_metrics(registry);
        platform.register_service(ServiceRegistration::new(
            "idle-probe",
            Arc::new(|_ctx, token: CancellationToken| {
                tokio::spawn(async move {
                    token.cancelled().await;
                    Ok::<(), anyhow::Error>(())
                })
            }),
        ));

        let runtime = platform.start().await.unwrap();

        // The telemetry server binds asynchronously; poll until it
        // answers with the registered counter.
        let mut body = String::new();
        for _ in 0..20 {
            if let Ok(resp) = reqwest::get("http://127.0.0.1:19309/metrics").await {
                body = resp.text().await.unwrap_or_default();
                if !body.is_empty() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(
            body.contains("platform_boot_test_total 1"),
            "telemetry server did not expose the registered registry: {body}"
        );

        runtime.shutdown().await.unwrap();
    }
}
