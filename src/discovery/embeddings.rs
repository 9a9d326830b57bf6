//! Embedding providers: turn document/query text into vectors.
//!
//! Grounded in `swissknife-ai-sdk`'s provider-per-backend trait shape,
//! narrowed to the one operation discovery needs. `HashingEmbedder` gives
//! the in-memory store something deterministic to run against without a
//! real backend, for local development and tests.

use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::config::EmbeddingsConfig;
use crate::error::{DiscoveryError, Result};

/// Capability set for turning text into an embedding vector.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts; the default implementation calls [`Self::embed`]
    /// sequentially, adequate for providers without a native batch API.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output vector dimensionality.
    fn dimensions(&self) -> usize;
}

/// Deterministic hashing "embedding": every token contributes to a
/// fixed-width vector via a seeded hash, giving cosine similarity a rough
/// lexical-overlap signal without calling out to a real model. Used when
/// `embeddings.provider = "none"`.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    /// Build a hashing embedder of the given width.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0f32; self.dimensions];
        for token in text.split_whitespace().map(str::to_lowercase) {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let index = (hasher.finish() as usize) % self.dimensions;
            vector[index] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// A `reqwest`-based adapter hitting a hosted embeddings endpoint. Covers
/// both `bedrock` and `openai` configurations: the two differ only in
/// endpoint shape and request body, which [`HostedEmbedder::new`] resolves
/// from [`EmbeddingsConfig::provider`].
pub struct HostedEmbedder {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl HostedEmbedder {
    /// Build an adapter from configuration.
    #[must_use]
    pub fn new(config: &EmbeddingsConfig) -> Self {
        let endpoint = match config.provider.as_str() {
            "openai" => "https://api.openai.com/v1/embeddings".to_string(),
            _ => "https://bedrock-runtime.amazonaws.com/model/invoke".to_string(),
        };
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key: config.api_key.as_deref().map(crate::config::ProviderConfig::resolve),
            model: config.model.clone(),
            dimensions: config.dimensions,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HostedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({"model": self.model, "input": text}));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DiscoveryError::Unavailable(format!("embeddings backend returned {}", resp.status())).into());
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        extract_embedding(&body).ok_or_else(|| {
            DiscoveryError::Unavailable("embeddings response missing vector".to_string()).into()
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn extract_embedding(body: &Value) -> Option<Vec<f32>> {
    let array = body
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|d| d.get("embedding"))
        .or_else(|| body.get("embedding"))
        .and_then(Value::as_array)?;
    array.iter().map(Value::as_f64).map(|v| v.map(|v| v as f32)).collect()
}

/// Build the configured embedding provider.
#[must_use]
pub fn build_embedder(config: &EmbeddingsConfig) -> std::sync::Arc<dyn EmbeddingProvider> {
    match config.provider.as_str() {
        "bedrock" | "openai" => std::sync::Arc::new(HostedEmbedder::new(config)),
        _ => std::sync::Arc::new(HashingEmbedder::new(config.dimensions)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("brave search the web").await.unwrap();
        let b = embedder.embed("brave search the web").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[tokio::test]
    async fn similar_text_has_higher_cosine_similarity_than_unrelated_text() {
        let embedder = HashingEmbedder::new(128);
        let query = embedder.embed("search the web for news").await.unwrap();
        let close = embedder.embed("search the web for articles").await.unwrap();
        let far = embedder.embed("convert currency exchange rates").await.unwrap();

        let cos = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(cos(&query, &close) > cos(&query, &far));
    }
}
