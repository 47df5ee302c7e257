//! HTTP surface of the bus
//!
//! Routes: `POST /register`, `POST /call`, `GET /health`, `GET /ready`,
//! `GET /agents`, `GET /circuit_breakers`. Error bodies follow the platform
//! convention: `{detail, kind}` with the mapped status code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use crate::types::{BusError, CallRequest, RegisterRequest};
use crate::McpBus;

impl IntoResponse for BusError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "detail": self.to_string(),
            "kind": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(bus: Arc<McpBus>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/deregister", post(deregister))
        .route("/call", post(call))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/agents", get(agents))
        .route("/circuit_breakers", get(circuit_breakers))
        .with_state(bus)
}

async fn register(
    State(bus): State<Arc<McpBus>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, BusError> {
    let agent = bus.register(&req).await?;
    Ok(Json(json!({
        "status": "ok",
        "data": agent,
        "timestamp": Utc::now(),
    })))
}

#[derive(serde::Deserialize)]
struct DeregisterRequest {
    agent_name: String,
}

async fn deregister(
    State(bus): State<Arc<McpBus>>,
    Json(req): Json<DeregisterRequest>,
) -> Json<serde_json::Value> {
    bus.registry().deregister(&req.agent_name).await;
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn call(
    State(bus): State<Arc<McpBus>>,
    Json(req): Json<CallRequest>,
) -> Result<Json<serde_json::Value>, BusError> {
    let result = bus
        .router()
        .call(&req.agent, &req.tool, req.args, req.kwargs)
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "data": result,
        "timestamp": Utc::now(),
    })))
}

async fn health(State(bus): State<Arc<McpBus>>) -> Json<serde_json::Value> {
    let composite = bus.health().latest().await;
    Json(serde_json::to_value(composite).unwrap_or_else(|_| json!({"status": "error"})))
}

async fn ready(State(bus): State<Arc<McpBus>>) -> Json<serde_json::Value> {
    Json(json!({ "ready": bus.health().ready() }))
}

async fn agents(State(bus): State<Arc<McpBus>>) -> Json<serde_json::Value> {
    let agents = bus.registry().list().await;
    Json(json!({ "agents": agents }))
}

async fn circuit_breakers(State(bus): State<Arc<McpBus>>) -> Json<serde_json::Value> {
    let status = bus.breakers().status(Instant::now()).await;
    Json(serde_json::to_value(status).unwrap_or_default())
}

/// Registration probe deadline; generous compared to health probes since it
/// only runs once per registration.
pub(crate) const REGISTRATION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
