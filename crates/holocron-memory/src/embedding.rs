use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use holocron_schema::retry::RETRYABLE_MARKER;
use sha2::{Digest, Sha256};

use crate::{content_hash, CacheStore};

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
}

impl EmbeddingResult {
    fn empty(model: &str, dimensions: usize) -> Self {
        Self {
            embeddings: Vec::new(),
            model: model.to_string(),
            dimensions,
        }
    }
}

/// Turns documents and queries into vectors. `model_id` namespaces both the
/// persisted index and the embedding cache.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

pub const GEMINI_EMBEDDING_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_EMBEDDING_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_GEMINI_EMBEDDING_DIMENSIONS: usize = 768;

/// `batchEmbedContents` client with a fixed `outputDimensionality`.
#[derive(Clone)]
pub struct GeminiEmbeddingProvider {
    http: reqwest::Client,
    model: String,
    dimensions: usize,
    api_key: String,
    base_url: String,
}

impl GeminiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_model(
            api_key,
            DEFAULT_GEMINI_EMBEDDING_MODEL.to_string(),
            DEFAULT_GEMINI_EMBEDDING_DIMENSIONS,
        )
    }

    pub fn with_model(api_key: String, model: String, dimensions: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            model,
            dimensions,
            api_key,
            base_url: GEMINI_EMBEDDING_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn batch_body(&self, texts: &[String]) -> wire::BatchRequest {
        let model = format!("models/{}", self.model);
        wire::BatchRequest {
            requests: texts
                .iter()
                .map(|text| wire::EmbedRequest {
                    model: model.clone(),
                    content: wire::Content {
                        parts: vec![wire::Part { text: text.clone() }],
                    },
                    output_dimensionality: self.dimensions,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::empty(&self.model, self.dimensions));
        }

        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        );
        let resp = self
            .http
            .post(&url)
            .json(&self.batch_body(texts))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    anyhow!("gemini embedding request failed {RETRYABLE_MARKER}: {e}")
                } else {
                    anyhow!(e).context("gemini embedding request failed")
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let transient = status.as_u16() == 429 || status.is_server_error();
            return Err(if transient {
                anyhow!("gemini embedding returned {status} {RETRYABLE_MARKER}: {detail}")
            } else {
                anyhow!("gemini embedding returned {status}: {detail}")
            });
        }

        let body: wire::BatchResponse = resp
            .json()
            .await
            .context("gemini embedding returned an unreadable body")?;
        if body.embeddings.len() != texts.len() {
            return Err(anyhow!(
                "gemini returned {} embeddings for {} texts",
                body.embeddings.len(),
                texts.len()
            ));
        }

        let embeddings: Vec<Vec<f32>> = body.embeddings.into_iter().map(|e| e.values).collect();
        if let Some(bad) = embeddings.iter().find(|v| v.len() != self.dimensions) {
            return Err(anyhow!(
                "embedding dimensions mismatch: got {}, configured {}",
                bad.len(),
                self.dimensions
            ));
        }

        Ok(EmbeddingResult {
            embeddings,
            model: self.model.clone(),
            dimensions: self.dimensions,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    pub(super) struct BatchRequest {
        pub requests: Vec<EmbedRequest>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct EmbedRequest {
        pub model: String,
        pub content: Content,
        pub output_dimensionality: usize,
    }

    #[derive(Serialize)]
    pub(super) struct Content {
        pub parts: Vec<Part>,
    }

    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }

    #[derive(Deserialize)]
    pub(super) struct BatchResponse {
        #[serde(default)]
        pub embeddings: Vec<Values>,
    }

    #[derive(Deserialize)]
    pub(super) struct Values {
        pub values: Vec<f32>,
    }
}

/// Offline provider: unit-length vectors derived from sha256 of the text.
/// Identical texts map to identical vectors; nothing else is meaningful.
#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dims);
        let mut block: u32 = 0;
        while values.len() < self.dims {
            let digest = Sha256::new()
                .chain_update(block.to_le_bytes())
                .chain_update(text.as_bytes())
                .finalize();
            values.extend(
                digest
                    .chunks_exact(4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / i32::MAX as f32)
                    .take(self.dims - values.len()),
            );
            block += 1;
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        values
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        Ok(EmbeddingResult {
            embeddings: texts.iter().map(|t| self.vector(t)).collect(),
            model: "stub".to_string(),
            dimensions: self.dims,
        })
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Serves vectors from the durable cache, keyed by `(model id, sha256)`, and
/// sends only the misses to the inner provider in one call.
pub struct CachedEmbeddingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    cache: CacheStore,
    hits: AtomicUsize,
    computed: AtomicUsize,
}

impl CachedEmbeddingProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: CacheStore) -> Self {
        Self {
            inner,
            cache,
            hits: AtomicUsize::new(0),
            computed: AtomicUsize::new(0),
        }
    }

    /// `(cache hits, computed)` since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.computed.load(Ordering::Relaxed),
        )
    }

    async fn lookup(&self, model: &str, hash: &str) -> Option<Vec<f32>> {
        match self.cache.get_embedding(model, hash).await {
            Ok(Some(v)) if v.len() == self.inner.dimensions() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("embedding cache read failed, recomputing: {e:#}");
                None
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let model = self.inner.model_id().to_string();
        let dimensions = self.inner.dimensions();

        let mut slots: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        // (slot, hash, text) for every cache miss
        let mut misses: Vec<(usize, String, String)> = Vec::new();
        for (slot, text) in texts.iter().enumerate() {
            let hash = content_hash(text);
            let cached = self.lookup(&model, &hash).await;
            if cached.is_none() {
                misses.push((slot, hash, text.clone()));
            }
            slots.push(cached);
        }
        self.hits
            .fetch_add(texts.len() - misses.len(), Ordering::Relaxed);

        if !misses.is_empty() {
            let pending: Vec<String> = misses.iter().map(|(_, _, t)| t.clone()).collect();
            let fresh = self.inner.embed(&pending).await?;
            if fresh.embeddings.len() != pending.len() {
                return Err(anyhow!(
                    "{} returned {} embeddings for {} texts",
                    model,
                    fresh.embeddings.len(),
                    pending.len()
                ));
            }
            self.computed.fetch_add(pending.len(), Ordering::Relaxed);

            for ((slot, hash, _), vector) in misses.into_iter().zip(fresh.embeddings) {
                if let Err(e) = self.cache.put_embedding(&model, &hash, &vector).await {
                    tracing::warn!("embedding cache write failed: {e:#}");
                }
                slots[slot] = Some(vector);
            }
        }

        let embeddings = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("embedding cache left a slot unfilled"))?;
        Ok(EmbeddingResult {
            embeddings,
            model,
            dimensions,
        })
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_vectors_are_unit_length_and_stable() {
        let provider = StubEmbeddingProvider::new(12);
        let texts = vec!["Character: Grand Master Yoda".to_string()];

        let first = provider.embed(&texts).await.unwrap();
        let second = provider.embed(&texts).await.unwrap();
        assert_eq!(first.embeddings, second.embeddings);
        assert_eq!(first.embeddings[0].len(), 12);

        let norm: f32 = first.embeddings[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn stub_vectors_differ_between_texts() {
        let provider = StubEmbeddingProvider::new(8);
        let result = provider
            .embed(&["Rey".to_string(), "Darth Vader".to_string()])
            .await
            .unwrap();
        assert_ne!(result.embeddings[0], result.embeddings[1]);
    }

    #[tokio::test]
    async fn cached_provider_serves_repeats_from_cache() {
        let cache = CacheStore::open_in_memory().unwrap();
        let cached = CachedEmbeddingProvider::new(Arc::new(StubEmbeddingProvider::new(4)), cache);

        let texts = vec!["a".to_string(), "b".to_string()];
        let first = cached.embed(&texts).await.unwrap();
        assert_eq!(cached.stats(), (0, 2));

        let more = vec!["b".to_string(), "c".to_string(), "a".to_string()];
        let second = cached.embed(&more).await.unwrap();
        assert_eq!(cached.stats(), (2, 3));
        assert_eq!(second.embeddings[0], first.embeddings[1]);
        assert_eq!(second.embeddings[2], first.embeddings[0]);
    }

    #[tokio::test]
    async fn cached_provider_handles_empty_input() {
        let cache = CacheStore::open_in_memory().unwrap();
        let cached = CachedEmbeddingProvider::new(Arc::new(StubEmbeddingProvider::new(4)), cache);
        let result = cached.embed(&[]).await.unwrap();
        assert!(result.embeddings.is_empty());
        assert_eq!(cached.stats(), (0, 0));
    }

    #[test]
    fn gemini_batch_body_carries_model_and_dimensions() {
        let provider = GeminiEmbeddingProvider::new("k".to_string());
        assert_eq!(provider.model_id(), DEFAULT_GEMINI_EMBEDDING_MODEL);

        let body = serde_json::to_value(provider.batch_body(&["Mace Windu".to_string()])).unwrap();
        let request = &body["requests"][0];
        assert_eq!(request["model"], "models/gemini-embedding-001");
        assert_eq!(request["outputDimensionality"], 768);
        assert_eq!(request["content"]["parts"][0]["text"], "Mace Windu");
    }
}
