//! Ingestion Pipeline - Extraction, Dedupe and Embedding
//!
//! Turns a URL into a persisted article: fetch raw HTML, run the extractor
//! cascade, parse structured metadata, normalize and hash the URL for
//! dedupe, apply quality heuristics, archive the raw page, persist the
//! article and source rows, then compute the embedding best-effort and
//! mirror it to the vector store.
//!
//! ## Pipeline flow
//!
//! ```text
//! fetch → extract (cascade) → normalize/hash → dedupe check
//!   → quality heuristics → raw-HTML archive → source upsert
//!   → article insert → embedding (best-effort) → vector mirror
//! ```
//!
//! Articles failing a quality heuristic persist as `needs_review` with
//! reason strings; only fetch failures prevent persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub mod embedding;
pub mod extract;
pub mod fetch;
pub mod metadata;
pub mod metrics;
pub mod normalize;
pub mod quality;
pub mod raw_html;
pub mod store;
pub mod types;

pub use embedding::{EmbeddingModel, EmbeddingService, HttpEmbeddingModel, StubEmbeddingModel};
pub use extract::{ExtractedDocument, Extractor, ExtractorCascade};
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use metrics::StageBMetrics;
pub use normalize::{normalize_url, url_hash, HashAlgo, NormalizationMode};
pub use raw_html::RawHtmlArchive;
pub use store::{ArticleStore, MemoryArticleStore, MemoryVectorStore, PgArticleStore, VectorStore};
pub use types::*;

/// Version of the ingest crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct IngestPipeline {
    config: IngestConfig,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ArticleStore>,
    cascade: Arc<ExtractorCascade>,
    archive: RawHtmlArchive,
    embeddings: EmbeddingService,
    metrics: Arc<StageBMetrics>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ArticleStore>,
        model: Arc<dyn EmbeddingModel>,
        vectors: Arc<dyn VectorStore>,
        metrics: Arc<StageBMetrics>,
    ) -> Self {
        let cascade = Arc::new(ExtractorCascade::new(&config));
        let archive = RawHtmlArchive::new(&config.raw_html_dir);
        let embeddings = EmbeddingService::new(model, vectors, Arc::clone(&metrics));
        Self {
            config,
            fetcher,
            store,
            cascade,
            archive,
            embeddings,
            metrics,
        }
    }

    /// Ingest one URL at `now`.
    pub async fn ingest_url(&self, url: &str, now: DateTime<Utc>) -> IngestResult<IngestOutcome> {
        let html = self.fetcher.fetch(url).await?;

        // The DOM handle is not Send; the cascade runs on a blocking thread
        // and only the owned result crosses back.
        let cascade = Arc::clone(&self.cascade);
        let html_for_extraction = html.clone();
        let document = tokio::task::spawn_blocking(move || cascade.extract(&html_for_extraction))
            .await
            .map_err(|err| IngestError::FatalInvariant(err.to_string()))?;

        let normalized = normalize_url(
            url,
            self.config.normalization,
            document.metadata.canonical_url.as_deref(),
        )?;
        let hash = url_hash(&normalized, self.config.hash_algo);

        if self.store.find_by_url_hash(&hash).await?.is_some() {
            self.store.touch_by_url_hash(&hash, now).await?;
            self.metrics
                .articles_total
                .with_label_values(&["duplicate"])
                .inc();
            info!(url, url_hash = %hash, "duplicate article skipped");
            return Ok(IngestOutcome::Duplicate { url_hash: hash });
        }

        let reasons = quality::review_reasons(&document, &self.config);
        let needs_review = !reasons.is_empty();

        let raw_html_ref = match self.archive.persist(&hash, now, &html).await {
            Ok(locator) => Some(locator),
            Err(err) => {
                // Archival is not load-bearing for persistence.
                warn!(url, error = %err, "raw HTML archival failed");
                None
            }
        };

        let domain = normalize::domain_of(&normalized)?;
        self.store
            .upsert_source(
                &domain,
                &serde_json::json!({ "last_ingest": now.to_rfc3339() }),
                now,
            )
            .await?;

        let title = document
            .extraction
            .title
            .clone()
            .or_else(|| document.metadata.og_title.clone());
        let status = if needs_review {
            ArticleStatus::NeedsReview
        } else {
            ArticleStatus::Ok
        };

        let article = Article {
            id: None,
            source_url: url.to_string(),
            normalized_url: Some(normalized),
            url_hash: Some(hash),
            url_hash_algo: self.config.hash_algo.as_str().to_string(),
            title,
            content: document.extraction.body.clone(),
            language: document.language.clone(),
            section: document.metadata.section.clone(),
            tags: document.metadata.tags.clone(),
            authors: document.metadata.authors.clone(),
            raw_html_ref,
            extraction_confidence: document.extraction.confidence,
            needs_review,
            review_reasons: reasons,
            extraction_metadata: serde_json::json!({
                "extractor": document.extraction.extractor,
                "text_html_ratio": document.text_html_ratio,
            }),
            publication_date: document.metadata.publication_date,
            metadata: serde_json::json!({}),
            collection_timestamp: now,
            embedding: None,
            status,
            created_at: now,
            updated_at: now,
        };

        let mut stored = self.store.insert_article(&article).await?;
        self.metrics
            .articles_total
            .with_label_values(&[if needs_review { "needs_review" } else { "ingested" }])
            .inc();

        // Best-effort embedding; never flips needs_review.
        if let Some(article_id) = stored.id {
            if !stored.content.is_empty() {
                if let Some(vector) = self
                    .embeddings
                    .embed_article(article_id, &stored.content)
                    .await?
                {
                    self.store.set_embedding(article_id, &vector).await?;
                    stored.embedding = Some(vector);
                }
            }
        }

        info!(
            url,
            article_id = stored.id,
            needs_review,
            confidence = stored.extraction_confidence,
            "article ingested"
        );
        Ok(IngestOutcome::Ingested {
            article: Box::new(stored),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn metrics(&self) -> &StageBMetrics {
        &self.metrics
    }
}
