//! Orchestrator HTTP surface
//!
//! `POST /leases`, `POST /leases/{token}/heartbeat`,
//! `POST /leases/{token}/release`, `POST /jobs/submit`, `GET /jobs/{id}`,
//! `POST /control/reclaim`, `POST /pools`, `POST /pools/{id}/drain`,
//! `POST /pools/{id}/stop`, plus `/health` and `/ready`. Followers answer
//! writes with 503 and a leader hint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::jobs::SubmitOptions;
use crate::types::{LeaseRequest, OrchestratorError};
use crate::Orchestrator;

impl IntoResponse for OrchestratorError {
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

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/leases", post(lease_gpu).get(list_leases))
        .route("/leases/:token/heartbeat", post(heartbeat_lease))
        .route("/leases/:token/release", post(release_lease))
        .route("/jobs/submit", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/control/reclaim", post(reclaim))
        .route("/pools", post(pool_start))
        .route("/pools/:id/drain", post(pool_drain))
        .route("/pools/:id/stop", post(pool_stop))
        .route("/pools/:id/heartbeat", post(pool_heartbeat))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(orchestrator)
}

type OrchState = State<Arc<Orchestrator>>;

fn ok_body(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "data": data,
        "timestamp": Utc::now(),
    }))
}

async fn lease_gpu(
    State(orch): OrchState,
    Json(req): Json<LeaseRequest>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let lease = orch.leases().lease_gpu(&req, Utc::now()).await?;
    Ok(ok_body(json!({
        "token": lease.token,
        "gpu_index": lease.gpu_index,
        "expires_at": lease.expires_at,
    })))
}

async fn heartbeat_lease(
    State(orch): OrchState,
    Path(token): Path<Uuid>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let lease = orch.leases().heartbeat(token, Utc::now()).await?;
    Ok(ok_body(json!({ "expires_at": lease.expires_at })))
}

async fn release_lease(
    State(orch): OrchState,
    Path(token): Path<Uuid>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    orch.leases().release(token).await?;
    Ok(ok_body(json!({ "released": token })))
}

async fn list_leases(
    State(orch): OrchState,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    let leases = orch.leases().list().await?;
    Ok(ok_body(json!({ "leases": leases })))
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    #[serde(rename = "type")]
    job_type: String,
    payload: serde_json::Value,
    #[serde(default)]
    options: SubmitOptions,
}

async fn submit_job(
    State(orch): OrchState,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let job_id = orch
        .jobs()
        .submit(&req.job_type, req.payload, req.options)
        .await?;
    Ok(ok_body(json!({ "job_id": job_id })))
}

async fn get_job(
    State(orch): OrchState,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    let job = orch.jobs().get(id).await?;
    Ok(ok_body(json!({
        "status": job.status,
        "attempts": job.attempts,
        "last_error": job.last_error,
    })))
}

async fn reclaim(
    State(orch): OrchState,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let report = orch.reclaimer().run_pass(Utc::now()).await?;
    Ok(ok_body(json!(report)))
}

#[derive(Debug, Deserialize)]
struct PoolStartRequest {
    agent_name: String,
    model_id: String,
    adapter: Option<String>,
    desired_workers: u32,
    #[serde(default)]
    hold_seconds: u64,
}

async fn pool_start(
    State(orch): OrchState,
    Json(req): Json<PoolStartRequest>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let pool = orch
        .pools()
        .pool_start(
            &req.agent_name,
            &req.model_id,
            req.adapter,
            req.desired_workers,
            req.hold_seconds,
            Utc::now(),
        )
        .await?;
    Ok(ok_body(json!({ "pool_id": pool.pool_id })))
}

async fn pool_drain(
    State(orch): OrchState,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let pool = orch.pools().drain(id).await?;
    Ok(ok_body(json!({ "pool_id": pool.pool_id, "status": pool.status })))
}

async fn pool_stop(
    State(orch): OrchState,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    orch.require_leader()?;
    let pool = orch.pools().stop(id).await?;
    Ok(ok_body(json!({ "pool_id": pool.pool_id, "status": pool.status })))
}

#[derive(Debug, Deserialize)]
struct PoolHeartbeatRequest {
    spawned_workers: u32,
}

async fn pool_heartbeat(
    State(orch): OrchState,
    Path(id): Path<Uuid>,
    Json(req): Json<PoolHeartbeatRequest>,
) -> Result<Json<serde_json::Value>, OrchestratorError> {
    let pool = orch
        .pools()
        .heartbeat(id, req.spawned_workers, Utc::now())
        .await?;
    Ok(ok_body(json!({ "pool_id": pool.pool_id, "status": pool.status })))
}

async fn health(State(orch): OrchState) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": crate::VERSION,
        "uptime": orch.uptime_secs(),
        "leader": orch.elector().is_leader(),
    }))
}

async fn ready(State(_orch): OrchState) -> Json<serde_json::Value> {
    Json(json!({ "ready": true }))
}
