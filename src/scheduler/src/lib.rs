//! Crawl Scheduler - Profile-Driven Periodic Crawl Planning
//!
//! Each tick computes the batch of (domain, profile) pairs whose cadence
//! is due, subject to a global per-run article budget. A domain whose
//! previous pass is still running is never crawled concurrently: the tick
//! skips it and accumulates its lag. Outcomes feed the Stage-B textfile
//! snapshot and the per-domain success history.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod profiles;
pub mod stage_b;
pub mod types;

pub use profiles::{load_profiles, load_schedule};
pub use stage_b::{DomainHistory, StageBSnapshot};
pub use types::*;

/// Version of the scheduler crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Counts returned by one domain pass.
#[derive(Debug, Clone, Default)]
pub struct DomainRunStats {
    pub attempted: u64,
    pub ingested: u64,
    pub duplicate: u64,
    pub error: u64,
    /// Articles found outside the profile's link patterns.
    pub adaptive: u64,
}

/// The crawler agent seam: the scheduler plans, the executor crawls.
#[async_trait]
pub trait CrawlExecutor: Send + Sync {
    async fn crawl(&self, job: &CrawlJob) -> SchedResult<DomainRunStats>;
}

pub struct CrawlScheduler {
    config: SchedulerConfig,
    profiles: HashMap<String, CrawlProfile>,
    entries: Mutex<Vec<ScheduleEntry>>,
    running: Mutex<HashSet<String>>,
    snapshot: Mutex<StageBSnapshot>,
}

impl CrawlScheduler {
    pub fn new(
        config: SchedulerConfig,
        schedule: Vec<ScheduleEntry>,
        profiles: HashMap<String, CrawlProfile>,
    ) -> SchedResult<Self> {
        profiles::validate(&schedule, &profiles)?;
        Ok(Self {
            config,
            profiles,
            entries: Mutex::new(schedule),
            running: Mutex::new(HashSet::new()),
            snapshot: Mutex::new(StageBSnapshot::default()),
        })
    }

    /// Load schedule and profiles from the configured paths.
    pub fn from_config(config: SchedulerConfig) -> SchedResult<Self> {
        let schedule = profiles::load_schedule(&config.schedule_path)?;
        let profile_map = profiles::load_profiles(&config.profiles_dir)?;
        Self::new(config, schedule, profile_map)
    }

    pub fn profile(&self, name: &str) -> Option<&CrawlProfile> {
        self.profiles.get(name)
    }

    /// Compute the batch eligible at `now`. Domains still running are
    /// skipped with their lag accumulated; the global article budget caps
    /// the batch.
    pub async fn plan_tick(&self, now: DateTime<Utc>) -> CrawlBatch {
        let running = self.running.lock().await;
        let mut entries = self.entries.lock().await;
        let mut snapshot = self.snapshot.lock().await;

        let mut jobs = Vec::new();
        let mut skipped_running = Vec::new();
        let mut budget = self.config.run_article_budget;

        for entry in entries.iter_mut() {
            let due_at = entry
                .last_run
                .as_ref()
                .and_then(|run| run.attempted_at)
                .map(|attempted| attempted + chrono::Duration::seconds(entry.cadence_seconds as i64));
            let due = due_at.map(|at| now >= at).unwrap_or(true);
            if !due {
                continue;
            }

            if running.contains(&entry.domain) {
                // Never two concurrent passes for one domain; the lag
                // gauge records how late this slot is.
                let late = due_at
                    .map(|at| (now - at).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                snapshot.lag_seconds += late;
                if let Some(run) = entry.last_run.as_mut() {
                    run.lag_seconds += late;
                }
                skipped_running.push(entry.domain.clone());
                continue;
            }

            if budget == 0 {
                break;
            }
            let max_articles = entry.max_articles.min(budget);
            budget -= max_articles;

            jobs.push(CrawlJob {
                domain: entry.domain.clone(),
                profile: entry.profile.clone(),
                max_articles,
            });
        }

        info!(
            jobs = jobs.len(),
            skipped = skipped_running.len(),
            "tick planned"
        );
        CrawlBatch {
            planned_at: now,
            jobs,
            skipped_running,
        }
    }

    /// Mark a domain pass as started; false when one is already running.
    pub async fn begin_domain(&self, domain: &str, now: DateTime<Utc>) -> bool {
        let mut running = self.running.lock().await;
        if !running.insert(domain.to_string()) {
            return false;
        }
        drop(running);

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.domain == domain) {
            let previous_lag = entry
                .last_run
                .as_ref()
                .map(|run| run.lag_seconds)
                .unwrap_or(0);
            entry.last_run = Some(RunOutcome {
                attempted_at: Some(now),
                lag_seconds: previous_lag,
                ..RunOutcome::default()
            });
        }
        true
    }

    /// Record a finished pass and fold it into the snapshot.
    pub async fn finish_domain(&self, domain: &str, stats: &DomainRunStats, now: DateTime<Utc>) {
        self.running.lock().await.remove(domain);

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.domain == domain) {
            if let Some(run) = entry.last_run.as_mut() {
                run.finished_at = Some(now);
                run.articles_attempted = stats.attempted;
                run.articles_ingested = stats.ingested;
                run.articles_duplicate = stats.duplicate;
                run.articles_error = stats.error;
            }
        }
        drop(entries);

        let mut snapshot = self.snapshot.lock().await;
        snapshot.domains_crawled_total += 1;
        snapshot.articles_accepted_total += stats.ingested;
        snapshot.adaptive_articles_total += stats.adaptive;
        let history = snapshot.history.entry(domain.to_string()).or_default();
        history.runs += 1;
        history.articles_accepted += stats.ingested;
        history.articles_error += stats.error;
        if stats.error == 0 && stats.attempted > 0 {
            history.last_success = Some(now);
        }
    }

    pub async fn snapshot(&self) -> StageBSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Export the Stage-B textfile and history sidecar.
    pub async fn export_metrics(&self) -> SchedResult<()> {
        let snapshot = self.snapshot.lock().await.clone();
        snapshot.export(&self.config.metrics_path)
    }

    /// Run one full pass: plan, crawl every job through `executor` with
    /// the per-domain cap, export metrics. Used by both the service loop
    /// and `scheduler run --live`.
    pub async fn run_pass(
        &self,
        executor: &Arc<dyn CrawlExecutor>,
        now: DateTime<Utc>,
    ) -> SchedResult<CrawlBatch> {
        let batch = self.plan_tick(now).await;
        for job in &batch.jobs {
            if !self.begin_domain(&job.domain, Utc::now()).await {
                continue;
            }
            let cap = Duration::from_secs(self.config.domain_run_cap_secs);
            let outcome = tokio::time::timeout(cap, executor.crawl(job)).await;
            let stats = match outcome {
                Ok(Ok(stats)) => stats,
                Ok(Err(err)) => {
                    warn!(domain = %job.domain, error = %err, "domain pass failed");
                    DomainRunStats {
                        error: 1,
                        ..DomainRunStats::default()
                    }
                }
                Err(_) => {
                    warn!(domain = %job.domain, cap_secs = self.config.domain_run_cap_secs, "domain pass hit run cap");
                    DomainRunStats {
                        error: 1,
                        ..DomainRunStats::default()
                    }
                }
            };
            self.finish_domain(&job.domain, &stats, Utc::now()).await;
        }
        self.export_metrics().await?;
        Ok(batch)
    }

    /// Periodic trigger loop.
    pub async fn run(
        self: Arc<Self>,
        executor: Arc<dyn CrawlExecutor>,
        token: CancellationToken,
    ) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        info!(
            interval_secs = self.config.tick_interval_secs,
            "crawl scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.run_pass(&executor, Utc::now()).await {
                        warn!(error = %err, "scheduler pass failed");
                    }
                }
                _ = token.cancelled() => {
                    info!("crawl scheduler stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn schedule() -> Vec<ScheduleEntry> {
        vec![
            ScheduleEntry {
                domain: "example.com".into(),
                profile: "default".into(),
                cadence_seconds: 3600,
                max_articles: 50,
                last_run: None,
            },
            ScheduleEntry {
                domain: "news.example.org".into(),
                profile: "default".into(),
                cadence_seconds: 3600,
                max_articles: 500,
                last_run: None,
            },
        ]
    }

    fn profiles() -> HashMap<String, CrawlProfile> {
        let mut map = HashMap::new();
        map.insert(
            "default".to_string(),
            CrawlProfile {
                name: "default".into(),
                include_patterns: vec![],
                exclude_patterns: vec![],
                max_links: 100,
                concurrency: 4,
                skip_seed_pages: false,
                retry_budget: 3,
            },
        );
        map
    }

    fn scheduler() -> CrawlScheduler {
        CrawlScheduler::new(SchedulerConfig::default(), schedule(), profiles()).unwrap()
    }

    #[tokio::test]
    async fn test_first_tick_schedules_everything_within_budget() {
        let scheduler = scheduler();
        let batch = scheduler.plan_tick(Utc::now()).await;
        assert_eq!(batch.jobs.len(), 2);
        // Global budget 500: first domain takes 50, second is capped at 450.
        assert_eq!(batch.jobs[0].max_articles, 50);
        assert_eq!(batch.jobs[1].max_articles, 450);
    }

    #[tokio::test]
    async fn test_cadence_gates_next_tick() {
        let scheduler = scheduler();
        let t0 = Utc::now();
        let batch = scheduler.plan_tick(t0).await;
        for job in &batch.jobs {
            scheduler.begin_domain(&job.domain, t0).await;
            scheduler
                .finish_domain(&job.domain, &DomainRunStats::default(), t0)
                .await;
        }

        // Half an hour later nothing is due.
        let t1 = t0 + ChronoDuration::minutes(30);
        assert!(scheduler.plan_tick(t1).await.jobs.is_empty());

        // Past the cadence everything is due again.
        let t2 = t0 + ChronoDuration::minutes(61);
        assert_eq!(scheduler.plan_tick(t2).await.jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_running_domain_is_skipped_and_lag_accumulates() {
        let scheduler = scheduler();
        let t0 = Utc::now();

        // Pass starts at t0 and never finishes.
        assert!(scheduler.begin_domain("example.com", t0).await);

        // Next tick at t0 + 1h10m: the domain is due but still running.
        let t1 = t0 + ChronoDuration::minutes(70);
        let batch = scheduler.plan_tick(t1).await;
        assert!(batch.jobs.iter().all(|j| j.domain != "example.com"));
        assert_eq!(batch.skipped_running, vec!["example.com".to_string()]);

        let snapshot = scheduler.snapshot().await;
        assert!(snapshot.lag_seconds >= 600);

        // No second concurrent pass can begin.
        assert!(!scheduler.begin_domain("example.com", t1).await);
    }

    #[tokio::test]
    async fn test_finish_updates_history() {
        let scheduler = scheduler();
        let t0 = Utc::now();
        scheduler.begin_domain("example.com", t0).await;
        scheduler
            .finish_domain(
                "example.com",
                &DomainRunStats {
                    attempted: 40,
                    ingested: 30,
                    duplicate: 8,
                    error: 0,
                    adaptive: 2,
                },
                t0,
            )
            .await;

        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.domains_crawled_total, 1);
        assert_eq!(snapshot.articles_accepted_total, 30);
        assert_eq!(snapshot.adaptive_articles_total, 2);
        let history = &snapshot.history["example.com"];
        assert_eq!(history.runs, 1);
        assert!(history.last_success.is_some());
    }

    #[tokio::test]
    async fn test_run_pass_with_executor() {
        struct CountingExecutor;

        #[async_trait]
        impl CrawlExecutor for CountingExecutor {
            async fn crawl(&self, job: &CrawlJob) -> SchedResult<DomainRunStats> {
                Ok(DomainRunStats {
                    attempted: job.max_articles as u64,
                    ingested: job.max_articles as u64 / 2,
                    ..DomainRunStats::default()
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            metrics_path: dir.path().join("stage_b.prom"),
            ..SchedulerConfig::default()
        };
        let scheduler = CrawlScheduler::new(config, schedule(), profiles()).unwrap();
        let executor: Arc<dyn CrawlExecutor> = Arc::new(CountingExecutor);

        let batch = scheduler.run_pass(&executor, Utc::now()).await.unwrap();
        assert_eq!(batch.jobs.len(), 2);

        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot.domains_crawled_total, 2);
        assert!(dir.path().join("stage_b.prom").exists());
    }
}
