//! # MCP Bus Unit Tests
//!
//! Exercises the bus against in-process stub agents bound to ephemeral
//! ports, covering registration, call routing, breaker trips and health
//! aggregation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use justnews_bus::types::{BusConfig, RegisterRequest};
use justnews_bus::McpBus;

/// Spawn a stub agent whose `/echo` tool returns its kwargs and whose
/// `/fail` tool always returns 500.
async fn spawn_stub_agent() -> SocketAddr {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "healthy"})) }))
        .route(
            "/echo",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(json!({"status": "ok", "data": body["kwargs"]}))
            }),
        )
        .route(
            "/fail",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": "boom"})),
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn register_request(addr: SocketAddr) -> RegisterRequest {
    RegisterRequest {
        agent_name: "stub".to_string(),
        endpoint: format!("http://{addr}"),
        capabilities: vec!["echo".to_string(), "fail".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_call_round_trip() {
        let addr = spawn_stub_agent().await;
        let bus = McpBus::new(BusConfig::default()).unwrap();

        bus.register(&register_request(addr)).await.unwrap();

        let mut kwargs = serde_json::Map::new();
        kwargs.insert("q".to_string(), json!("climate"));
        let result = bus
            .router()
            .call("stub", "echo", vec![], kwargs)
            .await
            .unwrap();
        assert_eq!(result["data"]["q"], json!("climate"));
    }

    #[tokio::test]
    async fn test_call_unknown_agent() {
        let bus = McpBus::new(BusConfig::default()).unwrap();
        let err = bus
            .router()
            .call("ghost", "echo", vec![], serde_json::Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_register_unreachable_endpoint_rejected() {
        let bus = McpBus::new(BusConfig::default()).unwrap();
        let err = bus
            .register(&RegisterRequest {
                agent_name: "nowhere".to_string(),
                // Reserved TEST-NET address, nothing listens there.
                endpoint: "http://192.0.2.1:9".to_string(),
                capabilities: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn test_breaker_opens_after_consecutive_failures() {
        let addr = spawn_stub_agent().await;
        let config = BusConfig {
            breaker_failure_threshold: 3,
            ..BusConfig::default()
        };
        let bus = McpBus::new(config).unwrap();
        bus.register(&register_request(addr)).await.unwrap();

        for _ in 0..3 {
            let err = bus
                .router()
                .call("stub", "fail", vec![], serde_json::Map::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "upstream_error");
        }

        // Fourth call fails fast without touching the agent.
        let err = bus
            .router()
            .call("stub", "fail", vec![], serde_json::Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");
    }

    #[tokio::test]
    async fn test_health_cycle_marks_ready() {
        let addr = spawn_stub_agent().await;
        let bus = Arc::new(McpBus::new(BusConfig::default()).unwrap());
        bus.register(&register_request(addr)).await.unwrap();

        assert!(!bus.health().ready());
        bus.health().probe_cycle().await;
        assert!(bus.health().ready());

        let composite = bus.health().latest().await;
        assert_eq!(composite.agents.len(), 1);
        assert!(composite.issues.is_empty());
    }
}
