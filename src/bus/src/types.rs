//! Core type definitions for the MCP Bus
//!
//! Wire types for registration and call routing, health aggregation
//! structures, and the bus error taxonomy. All wire types serialize with
//! serde for the HTTP surface.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A live agent known to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredAgent {
    /// Unique agent name (e.g. `analyst`, `synthesizer`).
    pub name: String,
    /// Base HTTP endpoint, no trailing slash (e.g. `http://analyst:8013`).
    pub endpoint: String,
    /// Tool names the agent advertises.
    pub capabilities: Vec<String>,
    /// When the current registration was accepted.
    pub registered_at: DateTime<Utc>,
}

/// Registration request body for `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_name: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Call routing request body for `POST /call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub agent: String,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Body forwarded to the agent's tool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Per-agent probe outcome as reported by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unreachable,
    Unknown,
}

/// One agent's most recent health observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub status: ProbeStatus,
    /// Probe round-trip in milliseconds, absent when unreachable.
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Aggregated view returned by the bus `/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeHealth {
    pub overall_status: ProbeStatus,
    pub agents: HashMap<String, AgentHealth>,
    /// True when at least one agent's breaker is open.
    pub circuit_breaker_active: bool,
    pub checked_at: DateTime<Utc>,
    /// Human-readable problems for the dashboard.
    pub issues: Vec<String>,
}

/// Bus configuration knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deadline for routed calls.
    pub call_timeout_secs: u64,
    /// Deadline for individual health probes.
    pub probe_timeout_ms: u64,
    /// Interval between probe cycles.
    pub probe_interval_secs: u64,
    /// Failures within the rolling window before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// Rolling failure window.
    pub breaker_window_secs: u64,
    /// How long an open breaker stays open before a half-open probe.
    pub breaker_open_duration_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            probe_timeout_ms: 1000,
            probe_interval_secs: 15,
            breaker_failure_threshold: 3,
            breaker_window_secs: 60,
            breaker_open_duration_secs: 30,
        }
    }
}

/// Errors surfaced by bus operations.
///
/// Each variant maps onto one semantic kind (`kind()`) and one HTTP status
/// so that callers and the CLI can react uniformly.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("agent `{0}` is not registered")]
    AgentUnknown(String),

    #[error("circuit breaker open for agent `{0}`")]
    CircuitOpen(String),

    #[error("agent `{agent}` returned status {status}: {detail}")]
    Upstream {
        agent: String,
        status: u16,
        detail: String,
    },

    #[error("call to `{agent}/{tool}` exceeded {timeout_secs}s deadline")]
    Timeout {
        agent: String,
        tool: String,
        timeout_secs: u64,
    },

    #[error("invalid registration: {0}")]
    Validation(String),

    #[error("transport failure talking to `{agent}`: {detail}")]
    Transport { agent: String, detail: String },
}

impl BusError {
    /// Semantic error kind per the platform taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            BusError::AgentUnknown(_) => "not_found",
            BusError::CircuitOpen(_) => "precondition_failed",
            BusError::Upstream { .. } => "upstream_error",
            BusError::Timeout { .. } => "deadline_exceeded",
            BusError::Validation(_) => "validation_error",
            BusError::Transport { .. } => "transient_infra_error",
        }
    }

    /// HTTP status the bus returns for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            BusError::AgentUnknown(_) => 404,
            BusError::CircuitOpen(_) => 503,
            BusError::Upstream { status, .. } => *status,
            BusError::Timeout { .. } => 504,
            BusError::Validation(_) => 400,
            BusError::Transport { .. } => 502,
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(BusError::AgentUnknown("x".into()).kind(), "not_found");
        assert_eq!(
            BusError::CircuitOpen("x".into()).kind(),
            "precondition_failed"
        );
        assert_eq!(
            BusError::Timeout {
                agent: "a".into(),
                tool: "t".into(),
                timeout_secs: 30
            }
            .http_status(),
            504
        );
    }

    #[test]
    fn test_call_request_defaults() {
        let req: CallRequest =
            serde_json::from_str(r#"{"agent":"analyst","tool":"score"}"#).unwrap();
        assert!(req.args.is_empty());
        assert!(req.kwargs.is_empty());
    }
}
