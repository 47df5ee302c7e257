//! Article and source persistence
//!
//! Writes to `articles` use upsert-by-url-hash so concurrent ingests of
//! the same story cannot create phantom duplicates. `sources` rows merge
//! metadata JSON-patch style: object fields merge recursively, everything
//! else is replaced. Articles are never physically deleted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;

use crate::types::{Article, ArticleStatus, IngestError, IngestResult, Source};

#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn find_by_url_hash(&self, url_hash: &str) -> IngestResult<Option<Article>>;
    /// Insert and return the stored article with its assigned id.
    async fn insert_article(&self, article: &Article) -> IngestResult<Article>;
    /// Refresh `updated_at` on the surviving row of a duplicate collision.
    async fn touch_by_url_hash(&self, url_hash: &str, now: DateTime<Utc>) -> IngestResult<()>;
    async fn set_embedding(&self, article_id: i64, embedding: &[f32]) -> IngestResult<()>;
    /// Merge-upsert a source row keyed by domain.
    async fn upsert_source(
        &self,
        domain: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> IngestResult<Source>;
    async fn get_source(&self, domain: &str) -> IngestResult<Option<Source>>;
}

/// Mirror of article embeddings keyed by article id.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, article_id: i64, vector: &[f32]) -> IngestResult<()>;
}

/// JSON-patch-style merge: objects merge key-wise recursively, any other
/// value (including null) replaces.
pub fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_json(
                    base_map.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryArticleStore {
    articles: Mutex<Vec<Article>>,
    sources: Mutex<HashMap<String, Source>>,
}

impl MemoryArticleStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn article_count(&self) -> usize {
        self.articles.lock().await.len()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn find_by_url_hash(&self, url_hash: &str) -> IngestResult<Option<Article>> {
        Ok(self
            .articles
            .lock()
            .await
            .iter()
            .find(|a| a.url_hash.as_deref() == Some(url_hash))
            .cloned())
    }

    async fn insert_article(&self, article: &Article) -> IngestResult<Article> {
        let mut articles = self.articles.lock().await;
        if let Some(hash) = article.url_hash.as_deref() {
            if articles.iter().any(|a| a.url_hash.as_deref() == Some(hash)) {
                return Err(IngestError::Storage(format!(
                    "url_hash {hash} already present"
                )));
            }
        }
        let mut stored = article.clone();
        stored.id = Some(articles.len() as i64 + 1);
        articles.push(stored.clone());
        Ok(stored)
    }

    async fn touch_by_url_hash(&self, url_hash: &str, now: DateTime<Utc>) -> IngestResult<()> {
        let mut articles = self.articles.lock().await;
        if let Some(article) = articles
            .iter_mut()
            .find(|a| a.url_hash.as_deref() == Some(url_hash))
        {
            article.updated_at = now;
        }
        Ok(())
    }

    async fn set_embedding(&self, article_id: i64, embedding: &[f32]) -> IngestResult<()> {
        let mut articles = self.articles.lock().await;
        let article = articles
            .iter_mut()
            .find(|a| a.id == Some(article_id))
            .ok_or_else(|| IngestError::NotFound(format!("article {article_id}")))?;
        article.embedding = Some(embedding.to_vec());
        Ok(())
    }

    async fn upsert_source(
        &self,
        domain: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> IngestResult<Source> {
        let mut sources = self.sources.lock().await;
        let next_id = sources.len() as i64 + 1;
        let source = sources.entry(domain.to_string()).or_insert_with(|| Source {
            id: Some(next_id),
            domain: domain.to_string(),
            canonical: true,
            canonical_source_id: None,
            metadata: serde_json::json!({}),
            updated_at: now,
        });
        merge_json(&mut source.metadata, metadata);
        source.updated_at = now;
        Ok(source.clone())
    }

    async fn get_source(&self, domain: &str) -> IngestResult<Option<Source>> {
        Ok(self.sources.lock().await.get(domain).cloned())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    vectors: Mutex<HashMap<i64, Vec<f32>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, article_id: i64) -> Option<Vec<f32>> {
        self.vectors.lock().await.get(&article_id).cloned()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, article_id: i64, vector: &[f32]) -> IngestResult<()> {
        self.vectors
            .lock()
            .await
            .insert(article_id, vector.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> IngestError {
    IngestError::Storage(err.to_string())
}

fn article_from_row(row: &sqlx::postgres::PgRow) -> IngestResult<Article> {
    let status: String = row.try_get("status").map_err(storage)?;
    let status = match status.as_str() {
        "ok" => ArticleStatus::Ok,
        "needs_review" => ArticleStatus::NeedsReview,
        "duplicate" => ArticleStatus::Duplicate,
        "failed" => ArticleStatus::Failed,
        other => {
            return Err(IngestError::FatalInvariant(format!(
                "unknown article status `{other}`"
            )))
        }
    };
    let tags: serde_json::Value = row.try_get("tags").map_err(storage)?;
    let authors: serde_json::Value = row.try_get("authors").map_err(storage)?;
    let reasons: serde_json::Value = row.try_get("review_reasons").map_err(storage)?;
    let embedding: Option<Vec<f32>> = row.try_get("embedding").map_err(storage)?;

    Ok(Article {
        id: Some(row.try_get::<i64, _>("id").map_err(storage)?),
        source_url: row.try_get("source_url").map_err(storage)?,
        normalized_url: row.try_get("normalized_url").map_err(storage)?,
        url_hash: row.try_get("url_hash").map_err(storage)?,
        url_hash_algo: row.try_get("url_hash_algo").map_err(storage)?,
        title: row.try_get("title").map_err(storage)?,
        content: row.try_get("content").map_err(storage)?,
        language: row.try_get("language").map_err(storage)?,
        section: row.try_get("section").map_err(storage)?,
        tags: serde_json::from_value(tags).unwrap_or_default(),
        authors: serde_json::from_value(authors).unwrap_or_default(),
        raw_html_ref: row.try_get("raw_html_ref").map_err(storage)?,
        extraction_confidence: row
            .try_get::<f32, _>("extraction_confidence")
            .map_err(storage)?,
        needs_review: row.try_get("needs_review").map_err(storage)?,
        review_reasons: serde_json::from_value(reasons).unwrap_or_default(),
        extraction_metadata: row.try_get("extraction_metadata").map_err(storage)?,
        publication_date: row.try_get("publication_date").map_err(storage)?,
        metadata: row.try_get("metadata").map_err(storage)?,
        collection_timestamp: row.try_get("collection_timestamp").map_err(storage)?,
        embedding,
        status,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn find_by_url_hash(&self, url_hash: &str) -> IngestResult<Option<Article>> {
        let row = sqlx::query("SELECT * FROM articles WHERE url_hash = $1")
            .bind(url_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(article_from_row).transpose()
    }

    async fn insert_article(&self, article: &Article) -> IngestResult<Article> {
        let row = sqlx::query(
            "INSERT INTO articles \
             (source_url, normalized_url, url_hash, url_hash_algo, title, content, language, \
              section, tags, authors, raw_html_ref, extraction_confidence, needs_review, \
              review_reasons, extraction_metadata, publication_date, metadata, \
              collection_timestamp, embedding, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22) \
             ON CONFLICT (url_hash) WHERE url_hash IS NOT NULL DO NOTHING \
             RETURNING *",
        )
        .bind(&article.source_url)
        .bind(&article.normalized_url)
        .bind(&article.url_hash)
        .bind(&article.url_hash_algo)
        .bind(&article.title)
        .bind(&article.content)
        .bind(&article.language)
        .bind(&article.section)
        .bind(serde_json::json!(article.tags))
        .bind(serde_json::json!(article.authors))
        .bind(&article.raw_html_ref)
        .bind(article.extraction_confidence)
        .bind(article.needs_review)
        .bind(serde_json::json!(article.review_reasons))
        .bind(&article.extraction_metadata)
        .bind(article.publication_date)
        .bind(&article.metadata)
        .bind(article.collection_timestamp)
        .bind(&article.embedding)
        .bind(article.status.as_str())
        .bind(article.created_at)
        .bind(article.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => article_from_row(&row),
            // Conflict: a concurrent ingest won the race.
            None => Err(IngestError::Storage(format!(
                "url_hash {:?} already present",
                article.url_hash
            ))),
        }
    }

    async fn touch_by_url_hash(&self, url_hash: &str, now: DateTime<Utc>) -> IngestResult<()> {
        sqlx::query("UPDATE articles SET updated_at = $2 WHERE url_hash = $1")
            .bind(url_hash)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn set_embedding(&self, article_id: i64, embedding: &[f32]) -> IngestResult<()> {
        sqlx::query("UPDATE articles SET embedding = $2, updated_at = now() WHERE id = $1")
            .bind(article_id)
            .bind(embedding)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn upsert_source(
        &self,
        domain: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> IngestResult<Source> {
        // Merge happens in SQL so the update stays a single statement.
        let row = sqlx::query(
            "INSERT INTO sources (domain, canonical, metadata, updated_at) \
             VALUES ($1, TRUE, $2, $3) \
             ON CONFLICT (domain) DO UPDATE \
             SET metadata = sources.metadata || EXCLUDED.metadata, updated_at = EXCLUDED.updated_at \
             RETURNING *",
        )
        .bind(domain)
        .bind(metadata)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        Ok(Source {
            id: Some(row.try_get::<i64, _>("id").map_err(storage)?),
            domain: row.try_get("domain").map_err(storage)?,
            canonical: row.try_get("canonical").map_err(storage)?,
            canonical_source_id: row.try_get("canonical_source_id").map_err(storage)?,
            metadata: row.try_get("metadata").map_err(storage)?,
            updated_at: row.try_get("updated_at").map_err(storage)?,
        })
    }

    async fn get_source(&self, domain: &str) -> IngestResult<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|row| {
            Ok(Source {
                id: Some(row.try_get::<i64, _>("id").map_err(storage)?),
                domain: row.try_get("domain").map_err(storage)?,
                canonical: row.try_get("canonical").map_err(storage)?,
                canonical_source_id: row.try_get("canonical_source_id").map_err(storage)?,
                metadata: row.try_get("metadata").map_err(storage)?,
                updated_at: row.try_get("updated_at").map_err(storage)?,
            })
        })
        .transpose()
    }
}

/// Qdrant-backed embedding mirror.
pub struct QdrantVectorStore {
    client: qdrant_client::Qdrant,
    collection: String,
}

impl QdrantVectorStore {
    pub fn connect(url: &str, collection: &str) -> IngestResult<Self> {
        let client = qdrant_client::Qdrant::from_url(url)
            .build()
            .map_err(|err| IngestError::Storage(err.to_string()))?;
        Ok(Self {
            client,
            collection: collection.to_string(),
        })
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, article_id: i64, vector: &[f32]) -> IngestResult<()> {
        use qdrant_client::qdrant::{PointStruct, UpsertPointsBuilder};

        let point = PointStruct::new(
            article_id as u64,
            vector.to_vec(),
            qdrant_client::Payload::new(),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|err| IngestError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_recursive() {
        let mut base = json!({"modal": {"seen": 3, "dismissed": 1}, "tos_ack": false});
        merge_json(&mut base, &json!({"modal": {"seen": 4}, "tos_ack": true}));
        assert_eq!(
            base,
            json!({"modal": {"seen": 4, "dismissed": 1}, "tos_ack": true})
        );
    }

    #[test]
    fn test_merge_json_replaces_non_objects() {
        let mut base = json!({"tags": ["a"]});
        merge_json(&mut base, &json!({"tags": ["b", "c"]}));
        assert_eq!(base, json!({"tags": ["b", "c"]}));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_hash_collision() {
        let store = MemoryArticleStore::new();
        let now = Utc::now();
        let article = Article {
            id: None,
            source_url: "https://example.com/a".into(),
            normalized_url: Some("https://example.com/a".into()),
            url_hash: Some("abc".into()),
            url_hash_algo: "sha256".into(),
            title: Some("t".into()),
            content: "body".into(),
            language: Some("eng".into()),
            section: None,
            tags: vec![],
            authors: vec![],
            raw_html_ref: None,
            extraction_confidence: 0.9,
            needs_review: false,
            review_reasons: vec![],
            extraction_metadata: json!({}),
            publication_date: None,
            metadata: json!({}),
            collection_timestamp: now,
            embedding: None,
            status: ArticleStatus::Ok,
            created_at: now,
            updated_at: now,
        };
        let stored = store.insert_article(&article).await.unwrap();
        assert_eq!(stored.id, Some(1));
        assert!(store.insert_article(&article).await.is_err());
    }

    #[tokio::test]
    async fn test_source_upsert_merges_metadata() {
        let store = MemoryArticleStore::new();
        let now = Utc::now();
        store
            .upsert_source("example.com", &json!({"modal": {"seen": 1}}), now)
            .await
            .unwrap();
        let source = store
            .upsert_source("example.com", &json!({"modal": {"dismissed": 1}}), now)
            .await
            .unwrap();
        assert_eq!(source.metadata, json!({"modal": {"seen": 1, "dismissed": 1}}));
    }
}
