//! Raw HTML fetching
//!
//! Fetch errors classify as transient (retried with jittered backoff) or
//! permanent (surfaced immediately, article not persisted). The per-URL
//! deadline is 60 s by default.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::types::{IngestConfig, IngestError, IngestResult};

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> IngestResult<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    retries: u32,
}

impl HttpFetcher {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(config.fetch_timeout_secs),
            retries: config.fetch_retries,
        }
    }

    async fn fetch_once(&self, url: &str) -> IngestResult<String> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    IngestError::FetchTransient {
                        url: url.to_string(),
                        detail: err.to_string(),
                    }
                } else {
                    IngestError::FetchPermanent {
                        url: url.to_string(),
                        detail: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(IngestError::FetchTransient {
                url: url.to_string(),
                detail: format!("status {status}"),
            });
        }
        if !status.is_success() {
            return Err(IngestError::FetchPermanent {
                url: url.to_string(),
                detail: format!("status {status}"),
            });
        }

        response.text().await.map_err(|err| IngestError::FetchTransient {
            url: url.to_string(),
            detail: err.to_string(),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> IngestResult<String> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(html) => return Ok(html),
                Err(err @ IngestError::FetchTransient { .. }) if attempt < self.retries => {
                    attempt += 1;
                    let delay = jittered_backoff(attempt);
                    warn!(url, attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient fetch failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff with ±25% jitter: ~1s, ~2s, ~4s.
fn jittered_backoff(attempt: u32) -> Duration {
    let base_ms = 1000u64.saturating_mul(1 << (attempt.saturating_sub(1)).min(6));
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

/// Canned fetcher for tests: URL → HTML or scripted failure.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
    permanent_failures: HashMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, html: &str) -> Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn with_failure(mut self, url: &str, detail: &str) -> Self {
        self.permanent_failures
            .insert(url.to_string(), detail.to_string());
        self
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> IngestResult<String> {
        if let Some(detail) = self.permanent_failures.get(url) {
            return Err(IngestError::FetchPermanent {
                url: url.to_string(),
                detail: detail.clone(),
            });
        }
        debug!(url, "static fetch");
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| IngestError::FetchPermanent {
                url: url.to_string(),
                detail: "status 404".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let first = jittered_backoff(1);
        let third = jittered_backoff(3);
        assert!(first >= Duration::from_millis(750));
        assert!(first <= Duration::from_millis(1250));
        assert!(third > first);
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new()
            .with_page("https://example.com/a", "<html></html>")
            .with_failure("https://example.com/b", "status 403");

        assert!(fetcher.fetch("https://example.com/a").await.is_ok());
        let err = fetcher.fetch("https://example.com/b").await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert!(fetcher.fetch("https://example.com/missing").await.is_err());
    }
}
