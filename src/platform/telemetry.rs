use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::config::ObservabilitySettings;
use crate::platform::service::ServiceRegistration;

/// Metrics server gathering every subsystem registry handed to the
/// platform context.
pub fn telemetry_service(settings: ObservabilitySettings) -> ServiceRegistration {
    ServiceRegistration::new(
        "telemetry",
        Arc::new(move |ctx, token: CancellationToken| {
            let settings = settings.clone();
            tokio::spawn(async move {
                let outcome: Result<()> = async {
                    if !settings.enable_metrics {
                        return Ok(());
                    }

                    let registries: Vec<prometheus::Registry> = ctx.registries().to_vec();
                    let app = Router::new()
                        .route("/metrics", get(metrics_handler))
                        .with_state(Arc::new(registries));
                    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
                    let shutdown = token.clone();

                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!(port = settings.metrics_port, "telemetry server started");

                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.cancelled().await;
                            info!("shutting down telemetry server");
                        })
                        .await?;

                    Ok(())
                }
                .await;

                outcome
            })
        }),
    )
}

async fn metrics_handler(State(registries): State<Arc<Vec<prometheus::Registry>>>) -> String {
    let encoder = TextEncoder::new();
    let mut out = Vec::new();
    for registry in registries.iter() {
        let families = registry.gather();
        if encoder.encode(&families, &mut out).is_err() {
            return "# metrics encoding failed\n".to_string();
        }
    }
    String::from_utf8(out).unwrap_or_else(|_| "# metrics encoding failed\n".to_string())
}
