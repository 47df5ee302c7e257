//! Agent runtime shell
//!
//! Common lifecycle for every agent in the mesh: expose `GET /health`,
//! `GET /ready`, one `POST /<tool>` endpoint per registered tool and
//! `POST /shutdown`; register with the MCP Bus at startup; deregister
//! best-effort and release any held GPU lease on the way down.
//!
//! Tool handlers are cooperative async functions taking the standard
//! `{args, kwargs}` body and returning `{status, data, timestamp}` or a
//! `{detail, kind}` error.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit_logging::AuditLogger;
use crate::rate_limiting::RateLimiter;

/// Standard tool-call body.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("upstream failure ({status}): {detail}")]
    Upstream { status: u16, detail: String },
    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation_error",
            ToolError::NotFound(_) => "not_found",
            ToolError::Upstream { .. } => "upstream_error",
            ToolError::Internal(_) => "transient_infra_error",
        }
    }

    fn http_status(&self) -> StatusCode {
        match self {
            ToolError::Validation(_) => StatusCode::BAD_REQUEST,
            ToolError::NotFound(_) => StatusCode::NOT_FOUND,
            ToolError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ToolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ToolError {
    fn into_response(self) -> Response {
        let body = json!({ "detail": self.to_string(), "kind": self.kind() });
        (self.http_status(), Json(body)).into_response()
    }
}

/// One callable tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, request: ToolRequest) -> Result<Value, ToolError>;
}

/// A GPU lease the agent holds, released on the way down.
#[derive(Debug, Clone)]
pub struct HeldLease {
    pub orchestrator_url: String,
    pub token: uuid::Uuid,
}

/// The shell wrapping one agent process.
pub struct AgentShell {
    name: String,
    version: String,
    port: u16,
    bus_url: Option<String>,
    capabilities: Vec<String>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    audit: Option<Arc<AuditLogger>>,
    held_lease: tokio::sync::Mutex<Option<HeldLease>>,
    ready: AtomicBool,
    started_at: Instant,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl AgentShell {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            port,
            bus_url: None,
            capabilities: Vec::new(),
            tools: HashMap::new(),
            rate_limiter: None,
            audit: None,
            held_lease: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_bus(mut self, bus_url: &str) -> Self {
        self.bus_url = Some(bus_url.trim_end_matches('/').to_string());
        self
    }

    pub fn with_tool(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.capabilities.push(handler.name().to_string());
        self.tools.insert(handler.name().to_string(), handler);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", local_host(), self.port)
    }

    /// Register with the bus; a rejection is surfaced to the caller so a
    /// misconfigured endpoint fails fast at startup.
    pub async fn register_with_bus(&self) -> anyhow::Result<()> {
        let Some(bus_url) = &self.bus_url else {
            return Ok(());
        };
        let body = json!({
            "agent_name": self.name,
            "endpoint": self.endpoint(),
            "capabilities": self.capabilities,
        });
        let response = self
            .client
            .post(format!("{bus_url}/register"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "bus rejected registration for `{}`: {}",
                self.name,
                response.status()
            );
        }
        if let Some(audit) = &self.audit {
            let _ = audit.log_registration(&self.name, &self.endpoint(), true);
        }
        info!(agent = %self.name, "registered with bus");
        Ok(())
    }

    /// Record a lease the shell must release at shutdown.
    pub async fn hold_lease(&self, lease: HeldLease) {
        if let Some(audit) = &self.audit {
            let _ = audit.log_lease(&self.name, &lease.token.to_string(), "acquired");
        }
        *self.held_lease.lock().await = Some(lease);
    }

    /// Release the held GPU lease, if any. Release is idempotent on the
    /// orchestrator side, so a double call is harmless.
    pub async fn release_held_lease(&self) {
        let Some(lease) = self.held_lease.lock().await.take() else {
            return;
        };
        let url = format!(
            "{}/leases/{}/release",
            lease.orchestrator_url.trim_end_matches('/'),
            lease.token
        );
        match self.client.post(&url).send().await {
            Ok(_) => {
                if let Some(audit) = &self.audit {
                    let _ = audit.log_lease(&self.name, &lease.token.to_string(), "released");
                }
                info!(agent = %self.name, token = %lease.token, "held lease released");
            }
            Err(err) => {
                // The reclaimer expires it if this never lands.
                warn!(agent = %self.name, token = %lease.token, error = %err, "lease release failed");
            }
        }
    }

    /// Best-effort deregistration on the way down.
    pub async fn deregister_from_bus(&self) {
        let Some(bus_url) = &self.bus_url else {
            return;
        };
        let result = self
            .client
            .post(format!("{bus_url}/deregister"))
            .json(&json!({ "agent_name": self.name }))
            .send()
            .await;
        if let Err(err) = result {
            warn!(agent = %self.name, error = %err, "deregistration failed");
        }
        if let Some(audit) = &self.audit {
            let _ = audit.log_registration(&self.name, &self.endpoint(), false);
        }
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/shutdown", post(shutdown))
            .route("/:tool", post(call_tool))
            .with_state(Arc::clone(self))
    }

    /// Serve until `/shutdown` or external cancellation. Marks the agent
    /// ready once the listener is bound.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        self.ready.store(true, Ordering::Release);
        info!(agent = %self.name, %addr, "agent listening");

        let token = self.shutdown.clone();
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
            })
            .await?;

        self.deregister_from_bus().await;
        self.release_held_lease().await;
        info!(agent = %self.name, "agent shut down");
        Ok(())
    }
}

fn local_host() -> String {
    std::env::var("AGENT_HOST").unwrap_or_else(|_| "localhost".to_string())
}

type ShellState = State<Arc<AgentShell>>;

async fn health(State(shell): ShellState) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": shell.version,
        "uptime": shell.started_at.elapsed().as_secs(),
    }))
}

async fn ready(State(shell): ShellState) -> Json<Value> {
    Json(json!({ "ready": shell.ready.load(Ordering::Acquire) }))
}

async fn shutdown(State(shell): ShellState) -> Json<Value> {
    info!(agent = %shell.name, "shutdown requested");
    shell.ready.store(false, Ordering::Release);
    // In-flight requests finish; the serve loop exits after this response.
    shell.shutdown.cancel();
    Json(json!({ "status": "ok", "detail": "shutting down" }))
}

async fn call_tool(
    State(shell): ShellState,
    Path(tool): Path<String>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    Json(request): Json<ToolRequest>,
) -> Result<Json<Value>, ToolError> {
    if let Some(limiter) = &shell.rate_limiter {
        if let Err(err) = limiter.check(client_ip(client), &tool) {
            if let Some(audit) = &shell.audit {
                let _ = audit.log_tool_call(&shell.name, &tool, 429, Some(client.to_string()));
            }
            return Err(ToolError::Upstream {
                status: 429,
                detail: err.to_string(),
            });
        }
    }

    let handler = shell
        .tools
        .get(&tool)
        .ok_or_else(|| ToolError::NotFound(format!("tool `{tool}`")))?;

    let result = handler.call(request).await;
    let status = match &result {
        Ok(_) => 200,
        Err(err) => err.http_status().as_u16(),
    };
    if let Some(audit) = &shell.audit {
        let _ = audit.log_tool_call(&shell.name, &tool, status, Some(client.to_string()));
    }

    let data = result?;
    Ok(Json(json!({
        "status": "ok",
        "data": data,
        "timestamp": Utc::now(),
    })))
}

fn client_ip(addr: SocketAddr) -> IpAddr {
    addr.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(&self, request: ToolRequest) -> Result<Value, ToolError> {
            Ok(json!({ "kwargs": request.kwargs }))
        }
    }

    #[tokio::test]
    async fn test_shell_routes_tools() {
        let shell = Arc::new(AgentShell::new("echo-agent", 0).with_tool(Arc::new(EchoTool)));
        let app = shell
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{addr}/echo"))
            .json(&json!({"args": [], "kwargs": {"q": 1}}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["data"]["kwargs"]["q"], json!(1));

        // Unknown tool is a 404 with the platform error shape.
        let response = client
            .post(format!("http://{addr}/no_such_tool"))
            .json(&json!({"args": [], "kwargs": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], json!("not_found"));
    }

    #[tokio::test]
    async fn test_health_and_shutdown_endpoints() {
        let shell = Arc::new(AgentShell::new("probe-agent", 0));
        let token = shell.shutdown_token();
        let app = shell
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let health: Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], json!("healthy"));

        assert!(!token.is_cancelled());
        client
            .post(format!("http://{addr}/shutdown"))
            .send()
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
