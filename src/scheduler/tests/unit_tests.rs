//! # Scheduler Integration Tests
//!
//! Builds a scheduler from on-disk schedule/profile files and runs a full
//! pass against a stub crawler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use justnews_scheduler::{
    CrawlExecutor, CrawlJob, CrawlScheduler, DomainRunStats, SchedResult, SchedulerConfig,
};

struct NoopExecutor;

#[async_trait]
impl CrawlExecutor for NoopExecutor {
    async fn crawl(&self, _job: &CrawlJob) -> SchedResult<DomainRunStats> {
        Ok(DomainRunStats {
            attempted: 5,
            ingested: 4,
            duplicate: 1,
            ..DomainRunStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_and_full_pass() {
        let dir = tempfile::tempdir().unwrap();

        let schedule_path = dir.path().join("schedule.toml");
        std::fs::write(
            &schedule_path,
            r#"
[[domains]]
domain = "example.com"
profile = "default"
cadence_seconds = 3600
max_articles = 25
"#,
        )
        .unwrap();

        let profiles_dir = dir.path().join("profiles");
        std::fs::create_dir(&profiles_dir).unwrap();
        std::fs::write(
            profiles_dir.join("default.toml"),
            "name = \"default\"\nmax_links = 40\nconcurrency = 2\n",
        )
        .unwrap();

        let config = SchedulerConfig {
            schedule_path,
            profiles_dir,
            metrics_path: dir.path().join("stage_b.prom"),
            ..SchedulerConfig::default()
        };

        let scheduler = CrawlScheduler::from_config(config).unwrap();
        assert_eq!(scheduler.profile("default").unwrap().max_links, 40);

        let executor: Arc<dyn CrawlExecutor> = Arc::new(NoopExecutor);
        let batch = scheduler.run_pass(&executor, Utc::now()).await.unwrap();
        assert_eq!(batch.jobs.len(), 1);

        let text = std::fs::read_to_string(dir.path().join("stage_b.prom")).unwrap();
        assert!(text.contains("justnews_crawler_scheduler_articles_accepted_total 4"));
    }
}
