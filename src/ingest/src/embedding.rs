//! Sentence-embedding generation
//!
//! Embeddings are best-effort: a missing model never blocks persistence
//! and never sets needs_review. Results are cached by
//! `(model_id, content_hash)` behind a read-write lock with TTL-bounded
//! entries, and mirrored to the vector store keyed by article id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::metrics::StageBMetrics;
use crate::store::VectorStore;
use crate::types::IngestResult;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("embedding request failed: {0}")]
    RequestFailed(String),
}

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Model served over HTTP by the GPU-backed embedding worker.
pub struct HttpEmbeddingModel {
    client: reqwest::Client,
    endpoint: String,
    model_id: String,
    dimension: usize,
}

impl HttpEmbeddingModel {
    pub fn new(endpoint: &str, model_id: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            model_id: model_id.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    fn id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .json(&serde_json::json!({ "model": self.model_id, "text": text }))
            .send()
            .await
            .map_err(|err| EmbeddingError::ModelUnavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::ModelUnavailable(format!(
                "status {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| EmbeddingError::RequestFailed(err.to_string()))?;
        let vector: Vec<f32> = body
            .get("embedding")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| EmbeddingError::RequestFailed("no embedding in response".into()))?;
        Ok(vector)
    }
}

/// Deterministic stand-in model for tests.
pub struct StubEmbeddingModel {
    model_id: String,
    dimension: usize,
}

impl StubEmbeddingModel {
    pub fn new(model_id: &str, dimension: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingModel for StubEmbeddingModel {
    fn id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let digest = Sha256::digest(text.as_bytes());
        Ok((0..self.dimension)
            .map(|i| digest[i % digest.len()] as f32 / 255.0)
            .collect())
    }
}

/// Model that is always down, for exercising the best-effort path.
pub struct UnavailableModel;

#[async_trait]
impl EmbeddingModel for UnavailableModel {
    fn id(&self) -> &str {
        "unavailable"
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelUnavailable("model not loaded".into()))
    }
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// Cache + mirror wrapper around a model.
pub struct EmbeddingService {
    model: Arc<dyn EmbeddingModel>,
    vectors: Arc<dyn VectorStore>,
    metrics: Arc<StageBMetrics>,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    cache_ttl: Duration,
}

impl EmbeddingService {
    pub fn new(
        model: Arc<dyn EmbeddingModel>,
        vectors: Arc<dyn VectorStore>,
        metrics: Arc<StageBMetrics>,
    ) -> Self {
        Self {
            model,
            vectors,
            metrics,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3600),
        }
    }

    pub fn content_hash(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    /// Compute (or recall) the embedding for an article body and mirror it
    /// keyed by article id. Returns the vector on success; `None` when the
    /// model is unavailable.
    pub async fn embed_article(
        &self,
        article_id: i64,
        content: &str,
    ) -> IngestResult<Option<Vec<f32>>> {
        let key = (self.model.id().to_string(), Self::content_hash(content));
        let started = Instant::now();

        if let Some(vector) = self.cache_lookup(&key).await {
            self.metrics
                .embedding_latency_seconds
                .with_label_values(&["hit"])
                .observe(started.elapsed().as_secs_f64());
            self.metrics
                .embedding_total
                .with_label_values(&["ok"])
                .inc();
            self.vectors.upsert(article_id, &vector).await?;
            return Ok(Some(vector));
        }

        match self.model.embed(content).await {
            Ok(vector) => {
                self.metrics
                    .embedding_latency_seconds
                    .with_label_values(&["miss"])
                    .observe(started.elapsed().as_secs_f64());
                self.metrics
                    .embedding_total
                    .with_label_values(&["ok"])
                    .inc();

                self.cache.write().await.insert(
                    key,
                    CacheEntry {
                        vector: vector.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                self.vectors.upsert(article_id, &vector).await?;
                Ok(Some(vector))
            }
            Err(EmbeddingError::ModelUnavailable(detail)) => {
                warn!(article_id, detail, "embedding model unavailable");
                self.metrics
                    .embedding_total
                    .with_label_values(&["model_unavailable"])
                    .inc();
                Ok(None)
            }
            Err(err) => {
                warn!(article_id, error = %err, "embedding failed");
                self.metrics
                    .embedding_total
                    .with_label_values(&["error"])
                    .inc();
                Ok(None)
            }
        }
    }

    async fn cache_lookup(&self, key: &(String, String)) -> Option<Vec<f32>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(key) {
                if entry.inserted_at.elapsed() < self.cache_ttl {
                    debug!("embedding cache hit");
                    return Some(entry.vector.clone());
                }
            } else {
                return None;
            }
        }
        // Entry exists but expired; evict under the write lock.
        self.cache.write().await.remove(key);
        None
    }
}
