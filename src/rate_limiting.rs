//! Per-client rate limiting for agent tool endpoints
//!
//! Sliding-window limiter keyed by (client address, tool) with per-tool
//! overrides. Agents apply it before dispatching a tool call; the bus
//! itself is not rate limited.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::platform::config::RateLimitingSettings;

#[derive(Debug, Clone)]
pub struct ToolLimit {
    pub requests: u32,
    pub window: Duration,
}

#[derive(Debug)]
struct ClientWindow {
    requests: Vec<Instant>,
    last_burst_reset: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    LimitExceeded { tool: String },
    BurstExceeded { tool: String },
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitError::LimitExceeded { tool } => {
                write!(f, "rate limit exceeded for tool `{tool}`")
            }
            RateLimitError::BurstExceeded { tool } => {
                write!(f, "burst limit exceeded for tool `{tool}`")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

pub struct RateLimiter {
    default: ToolLimit,
    tools: HashMap<String, ToolLimit>,
    burst_limit: u32,
    clients: Mutex<HashMap<(IpAddr, String), ClientWindow>>,
}

impl RateLimiter {
    pub fn from_settings(settings: &RateLimitingSettings) -> Self {
        let default = ToolLimit {
            requests: settings.default.requests,
            window: Duration::from_secs(settings.default.window_seconds),
        };
        let tools = settings
            .tools
            .iter()
            .map(|(tool, rule)| {
                (
                    tool.clone(),
                    ToolLimit {
                        requests: rule.requests,
                        window: Duration::from_secs(rule.window_seconds),
                    },
                )
            })
            .collect();

        Self {
            default,
            tools,
            burst_limit: settings.default.burst,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one call from `client` to `tool`.
    pub fn check(&self, client: IpAddr, tool: &str) -> Result<(), RateLimitError> {
        let limit = self.tools.get(tool).unwrap_or(&self.default);
        let now = Instant::now();

        let mut clients = match self.clients.lock() {
            Ok(clients) => clients,
            // Fail open on a poisoned map; rejecting everything after a
            // panic elsewhere would take the whole agent down.
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = clients
            .entry((client, tool.to_string()))
            .or_insert_with(|| ClientWindow {
                requests: Vec::new(),
                last_burst_reset: now,
            });

        let window_start = now.checked_sub(limit.window).unwrap_or(now);
        window.requests.retain(|&t| t > window_start);

        if window.requests.len() >= self.burst_limit as usize {
            if now.duration_since(window.last_burst_reset) < Duration::from_secs(1) {
                return Err(RateLimitError::BurstExceeded {
                    tool: tool.to_string(),
                });
            }
            window.last_burst_reset = now;
        }

        if window.requests.len() >= limit.requests as usize {
            return Err(RateLimitError::LimitExceeded {
                tool: tool.to_string(),
            });
        }

        window.requests.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::config::RateLimitRule;

    fn limiter(requests: u32) -> RateLimiter {
        RateLimiter::from_settings(&RateLimitingSettings {
            default: RateLimitRule {
                requests,
                window_seconds: 60,
                burst: 1000,
            },
            tools: HashMap::new(),
        })
    }

    #[test]
    fn test_limit_enforced_per_tool() {
        let limiter = limiter(5);
        let client = IpAddr::from([127, 0, 0, 1]);

        for _ in 0..5 {
            assert!(limiter.check(client, "ingest_article").is_ok());
        }
        assert!(matches!(
            limiter.check(client, "ingest_article"),
            Err(RateLimitError::LimitExceeded { .. })
        ));
        // A different tool has its own window.
        assert!(limiter.check(client, "get_article").is_ok());
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1);
        let a = IpAddr::from([10, 0, 0, 1]);
        let b = IpAddr::from([10, 0, 0, 2]);
        assert!(limiter.check(a, "t").is_ok());
        assert!(limiter.check(b, "t").is_ok());
        assert!(limiter.check(a, "t").is_err());
    }
}
