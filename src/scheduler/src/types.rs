//! Core type definitions for the crawl scheduler
//!
//! Crawl profiles are read-only per-domain configuration consumed by the
//! scheduler and the crawler agent; schedule entries carry cadence and the
//! rolling per-run outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named per-domain crawl configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlProfile {
    pub name: String,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_max_links")]
    pub max_links: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Skip seed/landing pages when collecting article links.
    #[serde(default)]
    pub skip_seed_pages: bool,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_max_links() -> usize {
    100
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_budget() -> u32 {
    3
}

/// One scheduled domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub domain: String,
    pub profile: String,
    /// Minimum seconds between passes for this domain.
    pub cadence_seconds: u64,
    /// Per-run article target for this domain.
    pub max_articles: usize,
    #[serde(default)]
    pub last_run: Option<RunOutcome>,
}

/// Outcome of the most recent pass over a domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    pub attempted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub articles_attempted: u64,
    pub articles_ingested: u64,
    pub articles_duplicate: u64,
    pub articles_error: u64,
    /// Seconds this domain's pass started late, accumulated while a
    /// previous pass blocks the slot.
    pub lag_seconds: u64,
}

/// One batch the scheduler hands to the crawler at a tick.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlBatch {
    pub planned_at: DateTime<Utc>,
    pub jobs: Vec<CrawlJob>,
    /// Domains skipped because a previous pass is still running.
    pub skipped_running: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlJob {
    pub domain: String,
    pub profile: String,
    pub max_articles: usize,
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick interval; hourly by default.
    pub tick_interval_secs: u64,
    /// Global per-run article budget across all domains.
    pub run_article_budget: usize,
    /// Hard cap on one domain's pass.
    pub domain_run_cap_secs: u64,
    pub schedule_path: std::path::PathBuf,
    pub profiles_dir: std::path::PathBuf,
    pub metrics_path: std::path::PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 3600,
            run_article_budget: 500,
            domain_run_cap_secs: 2400,
            schedule_path: std::path::PathBuf::from("configs/crawl_schedule.toml"),
            profiles_dir: std::path::PathBuf::from("configs/crawl_profiles"),
            metrics_path: std::path::PathBuf::from("stage_b_metrics.prom"),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CRAWL_SCHEDULE_PATH") {
            if !v.is_empty() {
                config.schedule_path = std::path::PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("CRAWL_PROFILES_DIR") {
            if !v.is_empty() {
                config.profiles_dir = std::path::PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("STAGE_B_METRICS_PATH") {
            if !v.is_empty() {
                config.metrics_path = std::path::PathBuf::from(v);
            }
        }
        config
    }
}

/// Errors surfaced by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule or profile: {0}")]
    Validation(String),

    #[error("unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("metrics export failed: {0}")]
    MetricsExport(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl SchedulerError {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "validation_error",
            SchedulerError::UnknownProfile(_) => "not_found",
            SchedulerError::MetricsExport(_) => "transient_infra_error",
            SchedulerError::Transient(_) => "transient_infra_error",
        }
    }
}

pub type SchedResult<T> = Result<T, SchedulerError>;
