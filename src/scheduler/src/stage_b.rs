//! Stage-B textfile export
//!
//! Writes the scheduler's counters as a Prometheus textfile snapshot for
//! the node-exporter textfile collector, plus a per-domain success-history
//! JSON sidecar. Writes are atomic (temp file then rename) so a scrape
//! never sees a half-written file.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{SchedResult, SchedulerError};

/// Rolling success history for one domain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DomainHistory {
    pub runs: u64,
    pub articles_accepted: u64,
    pub articles_error: u64,
    pub last_success: Option<DateTime<Utc>>,
}

/// Snapshot of one scheduler pass, rendered to the textfile.
#[derive(Debug, Clone, Default)]
pub struct StageBSnapshot {
    pub domains_crawled_total: u64,
    pub articles_accepted_total: u64,
    pub adaptive_articles_total: u64,
    pub lag_seconds: u64,
    pub history: HashMap<String, DomainHistory>,
}

impl StageBSnapshot {
    /// Prometheus exposition format, one metric family per counter.
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_counter(
            &mut out,
            "justnews_crawler_scheduler_domains_crawled_total",
            "Domains crawled across all scheduler runs",
            self.domains_crawled_total,
        );
        render_counter(
            &mut out,
            "justnews_crawler_scheduler_articles_accepted_total",
            "Articles accepted across all scheduler runs",
            self.articles_accepted_total,
        );
        render_counter(
            &mut out,
            "justnews_crawler_scheduler_adaptive_articles_total",
            "Articles collected through adaptive (non-profile) discovery",
            self.adaptive_articles_total,
        );
        out.push_str(&format!(
            "# HELP justnews_crawler_scheduler_lag_seconds Accumulated scheduling lag\n\
             # TYPE justnews_crawler_scheduler_lag_seconds gauge\n\
             justnews_crawler_scheduler_lag_seconds {}\n",
            self.lag_seconds
        ));
        out
    }

    /// Atomically write the textfile and the history JSON next to it.
    pub fn export(&self, metrics_path: &Path) -> SchedResult<()> {
        write_atomic(metrics_path, &self.render())?;

        let history_path = metrics_path.with_extension("history.json");
        let history = serde_json::to_string_pretty(&self.history)
            .map_err(|err| SchedulerError::MetricsExport(err.to_string()))?;
        write_atomic(&history_path, &history)
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
    ));
}

fn write_atomic(path: &Path, content: &str) -> SchedResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|err| SchedulerError::MetricsExport(err.to_string()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SchedulerError::MetricsExport(format!("bad path {}", path.display())))?;
    let tmp = parent.join(format!(".{file_name}.tmp"));

    std::fs::write(&tmp, content)
        .map_err(|err| SchedulerError::MetricsExport(err.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|err| SchedulerError::MetricsExport(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposition_format() {
        let snapshot = StageBSnapshot {
            domains_crawled_total: 12,
            articles_accepted_total: 340,
            adaptive_articles_total: 7,
            lag_seconds: 640,
            history: HashMap::new(),
        };
        let text = snapshot.render();
        assert!(text.contains("justnews_crawler_scheduler_domains_crawled_total 12"));
        assert!(text.contains("justnews_crawler_scheduler_articles_accepted_total 340"));
        assert!(text.contains("# TYPE justnews_crawler_scheduler_lag_seconds gauge"));
        assert!(text.contains("justnews_crawler_scheduler_lag_seconds 640"));
    }

    #[test]
    fn test_export_writes_textfile_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("stage_b.prom");

        let mut snapshot = StageBSnapshot::default();
        snapshot.history.insert(
            "example.com".into(),
            DomainHistory {
                runs: 3,
                articles_accepted: 45,
                articles_error: 2,
                last_success: Some(Utc::now()),
            },
        );
        snapshot.export(&metrics_path).unwrap();

        assert!(metrics_path.exists());
        let history_raw =
            std::fs::read_to_string(dir.path().join("stage_b.history.json")).unwrap();
        assert!(history_raw.contains("example.com"));
        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
