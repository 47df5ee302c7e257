//! Core type definitions for the ingestion pipeline
//!
//! Articles, sources, ingest outcomes, configuration and the pipeline
//! error taxonomy. Articles are never physically deleted; superseded rows
//! are marked duplicate or retained with a canonical pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Article lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    Ok,
    NeedsReview,
    Duplicate,
    Failed,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Ok => "ok",
            ArticleStatus::NeedsReview => "needs_review",
            ArticleStatus::Duplicate => "duplicate",
            ArticleStatus::Failed => "failed",
        }
    }
}

/// One ingested news item.
///
/// Invariants: `url_hash` and `normalized_url` are unique where non-null;
/// `needs_review` implies at least one reason; an embedding is only present
/// for `ok` or `needs_review` articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Assigned by the store on insert.
    pub id: Option<i64>,
    pub source_url: String,
    pub normalized_url: Option<String>,
    pub url_hash: Option<String>,
    pub url_hash_algo: String,
    pub title: Option<String>,
    pub content: String,
    pub language: Option<String>,
    pub section: Option<String>,
    pub tags: Vec<String>,
    pub authors: Vec<String>,
    /// Opaque locator of the archived raw HTML.
    pub raw_html_ref: Option<String>,
    pub extraction_confidence: f32,
    pub needs_review: bool,
    pub review_reasons: Vec<String>,
    pub extraction_metadata: serde_json::Value,
    pub publication_date: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
    pub collection_timestamp: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
    pub status: ArticleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Publisher/domain record. `canonical_source_id` enables non-destructive
/// duplicate consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Option<i64>,
    pub domain: String,
    pub canonical: bool,
    pub canonical_source_id: Option<i64>,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Result of one pipeline run for one URL.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Ingested { article: Box<Article> },
    Duplicate { url_hash: String },
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate { .. })
    }
}

/// Which extractor leads the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryExtractor {
    Trafilatura,
    Readability,
    Justext,
}

impl PrimaryExtractor {
    pub fn from_env_value(value: &str) -> Self {
        match value {
            "readability" => PrimaryExtractor::Readability,
            "justext" => PrimaryExtractor::Justext,
            _ => PrimaryExtractor::Trafilatura,
        }
    }
}

/// Pipeline configuration, environment-sourced.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub primary_extractor: PrimaryExtractor,
    /// First extractor whose confidence exceeds this wins.
    pub primary_threshold: f32,
    pub hash_algo: crate::normalize::HashAlgo,
    pub normalization: crate::normalize::NormalizationMode,
    pub min_words: usize,
    pub min_text_html_ratio: f32,
    pub embedding_model: String,
    /// HTTP endpoint of the embedding worker.
    pub embedding_endpoint: String,
    pub raw_html_dir: std::path::PathBuf,
    /// Fetch retry budget for transient failures.
    pub fetch_retries: u32,
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            primary_extractor: PrimaryExtractor::Trafilatura,
            primary_threshold: 0.7,
            hash_algo: crate::normalize::HashAlgo::Sha256,
            normalization: crate::normalize::NormalizationMode::Strict,
            min_words: 120,
            min_text_html_ratio: 0.25,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_endpoint: "http://localhost:8030/embed".to_string(),
            raw_html_dir: std::path::PathBuf::from("./archive_storage/raw_html"),
            fetch_retries: 3,
            fetch_timeout_secs: 60,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("ARTICLE_EXTRACTOR_PRIMARY") {
            config.primary_extractor = PrimaryExtractor::from_env_value(&v);
        }
        if let Ok(v) = std::env::var("ARTICLE_URL_HASH_ALGO") {
            config.hash_algo = crate::normalize::HashAlgo::from_env_value(&v);
        }
        if let Ok(v) = std::env::var("ARTICLE_URL_NORMALIZATION") {
            config.normalization = crate::normalize::NormalizationMode::from_env_value(&v);
        }
        if let Some(v) = env_parse::<usize>("ARTICLE_MIN_WORDS") {
            config.min_words = v;
        }
        if let Some(v) = env_parse::<f32>("ARTICLE_MIN_TEXT_HTML_RATIO") {
            config.min_text_html_ratio = v;
        }
        if let Ok(v) = std::env::var("ARTICLE_EMBEDDING_MODEL") {
            if !v.is_empty() {
                config.embedding_model = v;
            }
        }
        if let Ok(v) = std::env::var("ARTICLE_EMBEDDING_ENDPOINT") {
            if !v.is_empty() {
                config.embedding_endpoint = v;
            }
        }
        if let Ok(v) = std::env::var("JUSTNEWS_RAW_HTML_DIR") {
            if !v.is_empty() {
                config.raw_html_dir = std::path::PathBuf::from(v);
            }
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Errors surfaced by the ingestion pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("transient fetch failure for {url}: {detail}")]
    FetchTransient { url: String, detail: String },

    #[error("permanent fetch failure for {url}: {detail}")]
    FetchPermanent { url: String, detail: String },

    #[error("invalid URL `{url}`: {detail}")]
    InvalidUrl { url: String, detail: String },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("raw HTML archive failure: {0}")]
    Archive(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    FatalInvariant(String),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::FetchTransient { .. } => "transient_infra_error",
            IngestError::FetchPermanent { .. } => "upstream_error",
            IngestError::InvalidUrl { .. } => "validation_error",
            IngestError::Storage(_) => "transient_infra_error",
            IngestError::Archive(_) => "transient_infra_error",
            IngestError::NotFound(_) => "not_found",
            IngestError::FatalInvariant(_) => "fatal_invariant_violation",
        }
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_extractor_parsing() {
        assert_eq!(
            PrimaryExtractor::from_env_value("readability"),
            PrimaryExtractor::Readability
        );
        assert_eq!(
            PrimaryExtractor::from_env_value("anything-else"),
            PrimaryExtractor::Trafilatura
        );
    }

    #[test]
    fn test_error_kinds() {
        let err = IngestError::FetchTransient {
            url: "https://example.com".into(),
            detail: "connection reset".into(),
        };
        assert_eq!(err.kind(), "transient_infra_error");
    }
}
