//! Operational audit log
//!
//! Append-only JSONL of security-relevant platform events: agent
//! registrations, tool invocations, lease grants and shutdowns. Distinct
//! from the transparency archive, which records published editorial
//! artifacts; this log records who did what to the platform.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: u64,
    pub event_type: String,
    pub agent: Option<String>,
    pub resource: String,
    pub action: String,
    pub result: String,
    pub client_addr: Option<String>,
    pub metadata: std::collections::HashMap<String, String>,
    pub severity: AuditSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone)]
pub struct AuditLogger {
    log_file: Arc<Mutex<BufWriter<File>>>,
    _retention_days: u32,
}

impl AuditLogger {
    pub fn new(log_path: &str, retention_days: u32) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(parent) = Path::new(log_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            log_file: Arc::new(Mutex::new(BufWriter::new(file))),
            _retention_days: retention_days,
        })
    }

    pub fn log_event(&self, mut event: AuditEvent) -> Result<(), Box<dyn std::error::Error>> {
        if event.timestamp == 0 {
            event.timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }

        let event_json = serde_json::to_string(&event)? + "\n";
        let mut writer = match self.log_file.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.write_all(event_json.as_bytes())?;
        writer.flush()?;

        if matches!(event.severity, AuditSeverity::Critical | AuditSeverity::High) {
            eprintln!(
                "AUDIT [{:?}]: {} - {}",
                event.severity, event.event_type, event.action
            );
        }

        Ok(())
    }

    /// One routed or direct tool invocation.
    pub fn log_tool_call(
        &self,
        agent: &str,
        tool: &str,
        status_code: u16,
        client_addr: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let event = AuditEvent {
            id: String::new(),
            timestamp: 0,
            event_type: "tool_call".to_string(),
            agent: Some(agent.to_string()),
            resource: tool.to_string(),
            action: "POST".to_string(),
            result: status_code.to_string(),
            client_addr,
            metadata: std::collections::HashMap::new(),
            severity: match status_code {
                200..=299 => AuditSeverity::Low,
                400..=499 => AuditSeverity::Medium,
                _ => AuditSeverity::High,
            },
        };
        self.log_event(event)
    }

    /// Agent registration / deregistration against the bus.
    pub fn log_registration(
        &self,
        agent: &str,
        endpoint: &str,
        registered: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let event = AuditEvent {
            id: String::new(),
            timestamp: 0,
            event_type: "registration".to_string(),
            agent: Some(agent.to_string()),
            resource: endpoint.to_string(),
            action: if registered { "register" } else { "deregister" }.to_string(),
            result: "success".to_string(),
            client_addr: None,
            metadata: std::collections::HashMap::new(),
            severity: AuditSeverity::Low,
        };
        self.log_event(event)
    }

    /// GPU lease lifecycle events.
    pub fn log_lease(
        &self,
        agent: &str,
        token: &str,
        action: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let event = AuditEvent {
            id: String::new(),
            timestamp: 0,
            event_type: "gpu_lease".to_string(),
            agent: Some(agent.to_string()),
            resource: token.to_string(),
            action: action.to_string(),
            result: "success".to_string(),
            client_addr: None,
            metadata: std::collections::HashMap::new(),
            severity: AuditSeverity::Medium,
        };
        self.log_event(event)
    }

    /// Operator-initiated actions from the CLI.
    pub fn log_operator_action(
        &self,
        action: &str,
        target: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let event = AuditEvent {
            id: String::new(),
            timestamp: 0,
            event_type: "operator_action".to_string(),
            agent: None,
            resource: target.to_string(),
            action: action.to_string(),
            result: "success".to_string(),
            client_addr: None,
            metadata: std::collections::HashMap::new(),
            severity: AuditSeverity::High,
        };
        self.log_event(event)
    }
}
