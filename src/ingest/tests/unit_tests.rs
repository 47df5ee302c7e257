//! # Ingestion Pipeline Unit Tests
//!
//! Drives `IngestPipeline` end to end with a canned fetcher, in-memory
//! stores and a deterministic embedding stub.

use std::sync::Arc;

use chrono::Utc;

use justnews_ingest::embedding::UnavailableModel;
use justnews_ingest::{
    ArticleStatus, ArticleStore, IngestConfig, IngestOutcome, IngestPipeline, MemoryArticleStore,
    MemoryVectorStore, StageBMetrics, StaticFetcher, StubEmbeddingModel,
};

fn article_page(title: &str) -> String {
    let paragraph = "The committee published its long awaited findings on the energy \
                     transition, noting that grid capacity remains the main constraint \
                     for the coming decade and beyond across most member states.";
    let body: String = (0..10).map(|_| format!("<p>{paragraph}</p>")).collect();
    format!(
        "<html><head><title>{title}</title></head><body><article>{body}</article></body></html>"
    )
}

struct Fixture {
    pipeline: IngestPipeline,
    store: Arc<MemoryArticleStore>,
    vectors: Arc<MemoryVectorStore>,
}

fn fixture(fetcher: StaticFetcher, model_unavailable: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig {
        raw_html_dir: dir.keep(),
        ..IngestConfig::default()
    };
    let store = MemoryArticleStore::new();
    let vectors = MemoryVectorStore::new();
    let metrics = Arc::new(StageBMetrics::new().unwrap());
    let model: Arc<dyn justnews_ingest::EmbeddingModel> = if model_unavailable {
        Arc::new(UnavailableModel)
    } else {
        Arc::new(StubEmbeddingModel::new("all-MiniLM-L6-v2", 16))
    };
    let pipeline = IngestPipeline::new(
        config,
        Arc::new(fetcher),
        store.clone(),
        model,
        vectors.clone(),
        metrics,
    );
    Fixture {
        pipeline,
        store,
        vectors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clean_article_is_ingested_with_embedding() {
        let fetcher =
            StaticFetcher::new().with_page("https://example.com/story", &article_page("Grid"));
        let f = fixture(fetcher, false);

        let outcome = f
            .pipeline
            .ingest_url("https://example.com/story", Utc::now())
            .await
            .unwrap();

        let IngestOutcome::Ingested { article } = outcome else {
            panic!("expected ingestion");
        };
        assert_eq!(article.status, ArticleStatus::Ok);
        assert!(!article.needs_review);
        assert!(article.review_reasons.is_empty());
        assert_eq!(article.language.as_deref(), Some("eng"));
        assert!(article.embedding.is_some());
        assert!(article.raw_html_ref.is_some());
        assert!(f.vectors.get(article.id.unwrap()).await.is_some());

        let source = f.store.get_source("example.com").await.unwrap();
        assert!(source.is_some());
    }

    #[tokio::test]
    async fn test_url_hash_dedupe() {
        let fetcher = StaticFetcher::new()
            .with_page(
                "https://Example.com/Article?utm_source=x#frag",
                &article_page("One"),
            )
            .with_page(
                "https://example.com/Article?utm_campaign=y",
                &article_page("Two"),
            );
        let f = fixture(fetcher, false);

        let first = f
            .pipeline
            .ingest_url("https://Example.com/Article?utm_source=x#frag", Utc::now())
            .await
            .unwrap();
        let IngestOutcome::Ingested { article } = first else {
            panic!("expected ingestion");
        };
        assert_eq!(
            article.normalized_url.as_deref(),
            Some("https://example.com/Article")
        );
        assert_eq!(
            article.url_hash.as_deref(),
            Some("ce8e2398388addd1506688f43109b326f3d6d206620e2020704b6b6c2b09deb7")
        );

        // Same story behind different tracking params: duplicate, no new
        // row.
        let second = f
            .pipeline
            .ingest_url("https://example.com/Article?utm_campaign=y", Utc::now())
            .await
            .unwrap();
        assert!(second.is_duplicate());
        assert_eq!(f.store.article_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_body_persists_as_needs_review() {
        let fetcher = StaticFetcher::new().with_page(
            "https://example.com/nav",
            "<html><head><title>Nav</title></head><body><nav>HOME</nav></body></html>",
        );
        let f = fixture(fetcher, false);

        let outcome = f
            .pipeline
            .ingest_url("https://example.com/nav", Utc::now())
            .await
            .unwrap();
        let IngestOutcome::Ingested { article } = outcome else {
            panic!("expected ingestion");
        };
        assert_eq!(article.status, ArticleStatus::NeedsReview);
        assert!(article.needs_review);
        assert!(article
            .review_reasons
            .contains(&"empty_body".to_string()));
        // Persisted despite the failure.
        assert_eq!(f.store.article_count().await, 1);
    }

    #[tokio::test]
    async fn test_needs_review_implies_reasons() {
        let fetcher = StaticFetcher::new().with_page(
            "https://example.com/thin",
            "<html><body><p>Just a few words here to read.</p></body></html>",
        );
        let f = fixture(fetcher, false);
        let outcome = f
            .pipeline
            .ingest_url("https://example.com/thin", Utc::now())
            .await
            .unwrap();
        let IngestOutcome::Ingested { article } = outcome else {
            panic!("expected ingestion");
        };
        assert!(article.needs_review);
        assert!(!article.review_reasons.is_empty());
    }

    #[tokio::test]
    async fn test_model_unavailable_does_not_flag_review() {
        let fetcher =
            StaticFetcher::new().with_page("https://example.com/story", &article_page("Grid"));
        let f = fixture(fetcher, true);

        let outcome = f
            .pipeline
            .ingest_url("https://example.com/story", Utc::now())
            .await
            .unwrap();
        let IngestOutcome::Ingested { article } = outcome else {
            panic!("expected ingestion");
        };
        assert_eq!(article.status, ArticleStatus::Ok);
        assert!(article.embedding.is_none());
        assert!(!article.needs_review);
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_persists_nothing() {
        let fetcher = StaticFetcher::new().with_failure("https://example.com/gone", "status 410");
        let f = fixture(fetcher, false);

        let err = f
            .pipeline
            .ingest_url("https://example.com/gone", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert_eq!(f.store.article_count().await, 0);
    }
}
