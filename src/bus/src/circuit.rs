//! Per-agent circuit breakers
//!
//! Each agent gets an independent `{closed, open, half_open}` state machine
//! driven by the failure count inside a rolling window. While open, routed
//! calls fail fast with `circuit_open`. After the open duration one probe
//! call is let through; its outcome decides re-close vs re-open.
//!
//! All transitions take an explicit `now` so tests can drive the clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::BusConfig;

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Routing decision for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    /// Breaker closed, call proceeds.
    Allow,
    /// Breaker half-open, this call is the probe.
    AllowProbe,
    /// Breaker open, fail fast. Carries remaining open time.
    Reject(Duration),
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct AgentBreaker {
    phase: Phase,
    failures: VecDeque<Instant>,
}

impl AgentBreaker {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failures: VecDeque::new(),
        }
    }
}

/// Snapshot row for the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: BreakerState,
    /// Seconds until the breaker leaves `open`, if open.
    pub open_for_secs: Option<u64>,
    pub recent_failures: usize,
}

pub struct CircuitBreakers {
    window: Duration,
    threshold: u32,
    open_duration: Duration,
    breakers: Arc<Mutex<HashMap<String, AgentBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            window: Duration::from_secs(config.breaker_window_secs),
            threshold: config.breaker_failure_threshold,
            open_duration: Duration::from_secs(config.breaker_open_duration_secs),
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decide whether a call to `agent` may proceed at `now`.
    pub async fn check(&self, agent: &str, now: Instant) -> CallDecision {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(agent.to_string())
            .or_insert_with(AgentBreaker::new);

        match &mut breaker.phase {
            Phase::Closed => CallDecision::Allow,
            Phase::Open { until } => {
                if now >= *until {
                    breaker.phase = Phase::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(agent, "circuit breaker half-open, allowing probe call");
                    CallDecision::AllowProbe
                } else {
                    CallDecision::Reject(*until - now)
                }
            }
            Phase::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    // One probe at a time; everyone else keeps failing fast.
                    CallDecision::Reject(Duration::ZERO)
                } else {
                    *probe_in_flight = true;
                    CallDecision::AllowProbe
                }
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self, agent: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(agent) {
            if matches!(breaker.phase, Phase::HalfOpen { .. }) {
                info!(agent, "circuit breaker closed after successful probe");
            }
            breaker.phase = Phase::Closed;
            breaker.failures.clear();
        }
    }

    /// Record a failed call; may open the breaker.
    pub async fn record_failure(&self, agent: &str, now: Instant) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(agent.to_string())
            .or_insert_with(AgentBreaker::new);

        match breaker.phase {
            Phase::HalfOpen { .. } => {
                // Failed probe: straight back to open.
                breaker.phase = Phase::Open {
                    until: now + self.open_duration,
                };
                warn!(agent, "circuit breaker re-opened after failed probe");
            }
            Phase::Open { .. } => {}
            Phase::Closed => {
                breaker.failures.push_back(now);
                let window_start = now.checked_sub(self.window).unwrap_or(now);
                while breaker
                    .failures
                    .front()
                    .map(|t| *t < window_start)
                    .unwrap_or(false)
                {
                    breaker.failures.pop_front();
                }

                if breaker.failures.len() as u32 >= self.threshold {
                    breaker.phase = Phase::Open {
                        until: now + self.open_duration,
                    };
                    breaker.failures.clear();
                    warn!(
                        agent,
                        open_secs = self.open_duration.as_secs(),
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    /// True when any agent's breaker is not closed.
    pub async fn any_active(&self) -> bool {
        let breakers = self.breakers.lock().await;
        breakers
            .values()
            .any(|b| !matches!(b.phase, Phase::Closed))
    }

    /// Admin snapshot for `circuit_breaker_status()`.
    pub async fn status(&self, now: Instant) -> HashMap<String, BreakerStatus> {
        let breakers = self.breakers.lock().await;
        breakers
            .iter()
            .map(|(agent, b)| {
                let (state, open_for) = match &b.phase {
                    Phase::Closed => (BreakerState::Closed, None),
                    Phase::Open { until } => (
                        BreakerState::Open,
                        Some(until.saturating_duration_since(now).as_secs()),
                    ),
                    Phase::HalfOpen { .. } => (BreakerState::HalfOpen, None),
                };
                (
                    agent.clone(),
                    BreakerStatus {
                        state,
                        open_for_secs: open_for,
                        recent_failures: b.failures.len(),
                    },
                )
            })
            .collect()
    }
}
