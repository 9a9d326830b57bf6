//! Vector store abstraction: one collection per [`super::document::EntityType`],
//! two adapters (in-memory and HTTP/Qdrant-shaped), both behind the same
//! `async_trait` object-safe capability set — the same shape the upstream
//! gateway uses for `key_server::store::TokenStore`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::document::{Document, Filter, ScoredDocument};
use super::embeddings::EmbeddingProvider;
use crate::config::VectorStoreConfig;
use crate::error::{DiscoveryError, Result};

/// Keys that may be patched via [`VectorStore::update_metadata`] /
/// [`VectorStore::batch_update_properties`] without forcing re-embedding.
/// Any other property requires a delete-and-reinsert.
pub const METADATA_SAFE_KEYS: &[&str] = &["is_enabled", "tags", "entity_type", "server_name"];

/// How a search should combine vector and keyword signal.
#[derive(Debug, Clone, Copy)]
pub enum SearchType {
    /// Pure vector similarity.
    Semantic,
    /// Pure keyword (BM25-ish term-frequency) scoring.
    Bm25,
    /// `alpha=0` pure BM25, `alpha=1` pure vector.
    Hybrid(f32),
}

/// Capability set every vector-store backend implements.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync + 'static {
    /// Insert a single document, embedding its content.
    async fn insert(&self, collection: &str, doc: Document) -> Result<String>;

    /// Insert many documents in one round trip.
    async fn bulk_insert(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert(collection, doc).await?);
        }
        Ok(ids)
    }

    /// Fetch one document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Fetch many documents by id.
    async fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        for id in ids {
            if let Some(doc) = self.get(collection, id).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Replace a document's content and properties, re-embedding.
    async fn update(&self, collection: &str, id: &str, doc: Document) -> Result<()>;

    /// Patch properties in place without re-embedding. Rejects any key
    /// outside [`METADATA_SAFE_KEYS`].
    async fn update_metadata(&self, collection: &str, id: &str, patch: HashMap<String, Value>) -> Result<()>;

    /// [`Self::update_metadata`] across many ids.
    async fn batch_update_properties(
        &self,
        collection: &str,
        ids: &[String],
        patch: HashMap<String, Value>,
    ) -> Result<()> {
        for id in ids {
            self.update_metadata(collection, id, patch.clone()).await?;
        }
        Ok(())
    }

    /// Delete one document.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Delete every document matching `filter`.
    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Metadata-only listing, no vector involved.
    async fn filter(&self, collection: &str, filter: &Filter, limit: usize, offset: usize) -> Result<Vec<Document>>;

    /// Semantic (pure-vector) search.
    async fn near_text(
        &self,
        collection: &str,
        text: &str,
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>>;

    /// Keyword (BM25-ish) search.
    async fn bm25(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>>;

    /// Hybrid search, `alpha` weighting vector vs. keyword signal.
    async fn hybrid(
        &self,
        collection: &str,
        text: &str,
        k: usize,
        alpha: f32,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>>;

    /// Hybrid search biased toward keyword matching (`alpha≈0.3`).
    async fn fuzzy(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        self.hybrid(collection, text, k, 0.3, filter).await
    }

    /// Search by a caller-supplied vector, bypassing embedding.
    async fn near_vector(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>>;

    /// Dispatch on [`SearchType`].
    async fn search(
        &self,
        collection: &str,
        search_type: SearchType,
        text: &str,
        k: usize,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>> {
        match search_type {
            SearchType::Semantic => self.near_text(collection, text, k, filter).await,
            SearchType::Bm25 => self.bm25(collection, text, k, filter).await,
            SearchType::Hybrid(alpha) => self.hybrid(collection, text, k, alpha, filter).await,
        }
    }
}

struct StoredDocument {
    document: Document,
    vector: Vec<f32>,
}

/// `DashMap`-backed reference adapter: brute-force cosine similarity plus a
/// simple term-frequency scorer for BM25-ish keyword search. Adequate for
/// single-node/dev use and for tests.
pub struct InMemoryVectorStore {
    collections: DashMap<String, DashMap<String, StoredDocument>>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl InMemoryVectorStore {
    /// Build an empty store backed by `embedder`.
    #[must_use]
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            collections: DashMap::new(),
            embedder,
        }
    }

    fn collection(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, DashMap<String, StoredDocument>> {
        self.collections.entry(name.to_string()).or_default();
        self.collections.get(name).expect("just inserted")
    }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn term_frequency_score(query: &str, content: &str) -> f32 {
    let query_terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let matches = query_terms
        .iter()
        .filter(|term| content_lower.contains(term.as_str()))
        .count();
    matches as f32 / query_terms.len() as f32
}

fn reject_unsafe_keys(patch: &HashMap<String, Value>) -> Result<()> {
    if let Some(key) = patch.keys().find(|k| !METADATA_SAFE_KEYS.contains(&k.as_str())) {
        return Err(DiscoveryError::NotMetadataSafe(key.clone()).into());
    }
    Ok(())
}

#[async_trait::async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, collection: &str, doc: Document) -> Result<String> {
        let vector = self.embedder.embed(&doc.content).await?;
        let id = doc.id.clone();
        self.collection(collection).insert(id.clone(), StoredDocument { document: doc, vector });
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.collection(collection).get(id).map(|e| e.document.clone()))
    }

    async fn update(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        let vector = self.embedder.embed(&doc.content).await?;
        self.collection(collection).insert(id.to_string(), StoredDocument { document: doc, vector });
        Ok(())
    }

    async fn update_metadata(&self, collection: &str, id: &str, patch: HashMap<String, Value>) -> Result<()> {
        reject_unsafe_keys(&patch)?;
        let coll = self.collection(collection);
        let Some(mut entry) = coll.get_mut(id) else {
            return Err(DiscoveryError::NotFound(id.to_string()).into());
        };
        for (key, value) in patch {
            entry.document.properties.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.collection(collection).remove(id);
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let coll = self.collection(collection);
        let matching: Vec<String> = coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .map(|e| e.key().clone())
            .collect();
        let count = matching.len() as u64;
        for id in matching {
            coll.remove(&id);
        }
        Ok(count)
    }

    async fn filter(&self, collection: &str, filter: &Filter, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let coll = self.collection(collection);
        Ok(coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .skip(offset)
            .take(limit)
            .map(|e| e.document.clone())
            .collect())
    }

    async fn near_text(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.embedder.embed(text).await?;
        let coll = self.collection(collection);
        let mut scored: Vec<ScoredDocument> = coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .map(|e| {
                let distance = cosine(&query_vector, &e.vector);
                ScoredDocument {
                    document: e.document.clone(),
                    distance: Some(1.0 - distance),
                    certainty: Some(distance),
                    score: distance,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn bm25(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        let coll = self.collection(collection);
        let mut scored: Vec<ScoredDocument> = coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .map(|e| {
                let score = term_frequency_score(text, &e.document.content);
                ScoredDocument {
                    document: e.document.clone(),
                    distance: None,
                    certainty: None,
                    score,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn near_vector(&self, collection: &str, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        let coll = self.collection(collection);
        let mut scored: Vec<ScoredDocument> = coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .map(|e| {
                let distance = cosine(vector, &e.vector);
                ScoredDocument {
                    document: e.document.clone(),
                    distance: Some(1.0 - distance),
                    certainty: Some(distance),
                    score: distance,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }

    async fn hybrid(
        &self,
        collection: &str,
        text: &str,
        k: usize,
        alpha: f32,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.embedder.embed(text).await?;
        let coll = self.collection(collection);
        let mut scored: Vec<ScoredDocument> = coll
            .iter()
            .filter(|e| filter.matches(&e.document.properties))
            .map(|e| {
                let vector_score = cosine(&query_vector, &e.vector);
                let keyword_score = term_frequency_score(text, &e.document.content);
                let score = alpha * vector_score + (1.0 - alpha) * keyword_score;
                ScoredDocument {
                    document: e.document.clone(),
                    distance: Some(1.0 - vector_score),
                    certainty: Some(vector_score),
                    score,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

/// A `reqwest`-based client against a Qdrant-shaped collections/points REST
/// API, grounded in `swissknife-vectordb-sdk`'s adapter-per-backend shape.
pub struct HttpVectorStore {
    http: reqwest::Client,
    base_url: String,
    collection_prefix: String,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl HttpVectorStore {
    /// Build the client from configuration.
    #[must_use]
    pub fn new(config: &VectorStoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{}:{}", config.host, config.port),
            collection_prefix: config.collection_prefix.clone(),
            embedder,
        }
    }

    fn qualified(&self, collection: &str) -> String {
        format!("{}_{collection}", self.collection_prefix)
    }

    fn points_url(&self, collection: &str, suffix: &str) -> String {
        format!("{}/collections/{}/points{suffix}", self.base_url, self.qualified(collection))
    }
}

#[async_trait::async_trait]
impl VectorStore for HttpVectorStore {
    async fn insert(&self, collection: &str, doc: Document) -> Result<String> {
        let vector = self.embedder.embed(&doc.content).await?;
        let body = serde_json::json!({
            "points": [{
                "id": doc.id,
                "vector": vector,
                "payload": payload_of(&doc),
            }]
        });
        self.http
            .put(self.points_url(collection, ""))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(doc.id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let resp = self
            .http
            .get(self.points_url(collection, &format!("/{id}")))
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = resp.json().await.map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(document_from_point(&body))
    }

    async fn update(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.delete(collection, id).await.ok();
        self.insert(collection, doc).await.map(|_| ())
    }

    async fn update_metadata(&self, collection: &str, id: &str, patch: HashMap<String, Value>) -> Result<()> {
        reject_unsafe_keys(&patch)?;
        let body = serde_json::json!({"points": [id], "payload": patch});
        self.http
            .post(self.points_url(collection, "/payload"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let body = serde_json::json!({"points": [id]});
        self.http
            .post(self.points_url(collection, "/delete"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_filter(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let body = serde_json::json!({"filter": filter.0});
        self.http
            .post(self.points_url(collection, "/delete"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(0)
    }

    async fn filter(&self, collection: &str, filter: &Filter, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let body = serde_json::json!({"filter": filter.0, "limit": limit, "offset": offset});
        let resp = self
            .http
            .post(self.points_url(collection, "/scroll"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        let parsed: Value = resp.json().await.map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(parsed
            .get("result")
            .and_then(|r| r.get("points"))
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(document_from_point).collect())
            .unwrap_or_default())
    }

    async fn near_text(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        let vector = self.embedder.embed(text).await?;
        let body = serde_json::json!({"vector": vector, "limit": k, "filter": filter.0, "with_payload": true});
        let resp = self
            .http
            .post(self.points_url(collection, "/search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        let parsed: Value = resp.json().await.map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(scored_from_result(&parsed))
    }

    async fn bm25(&self, collection: &str, text: &str, k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        // This backend has no native keyword index; fall back to a
        // semantic search over the same text, which is strictly better
        // than returning nothing.
        self.near_text(collection, text, k, filter).await
    }

    async fn near_vector(&self, collection: &str, vector: &[f32], k: usize, filter: &Filter) -> Result<Vec<ScoredDocument>> {
        let body = serde_json::json!({"vector": vector, "limit": k, "filter": filter.0, "with_payload": true});
        let resp = self
            .http
            .post(self.points_url(collection, "/search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        let parsed: Value = resp.json().await.map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        Ok(scored_from_result(&parsed))
    }

    async fn hybrid(
        &self,
        collection: &str,
        text: &str,
        k: usize,
        _alpha: f32,
        filter: &Filter,
    ) -> Result<Vec<ScoredDocument>> {
        self.near_text(collection, text, k, filter).await
    }
}

fn payload_of(doc: &Document) -> Value {
    let mut payload = doc.properties.clone();
    payload.insert("content".to_string(), Value::String(doc.content.clone()));
    payload.insert("id".to_string(), Value::String(doc.id.clone()));
    Value::Object(payload.into_iter().collect())
}

fn document_from_point(point: &Value) -> Option<Document> {
    let payload = point.get("payload").or_else(|| point.get("result").and_then(|r| r.get("payload")))?;
    let id = payload.get("id").and_then(Value::as_str)?.to_string();
    let content = payload.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
    let mut properties: HashMap<String, Value> = payload.as_object()?.clone().into_iter().collect();
    properties.remove("id");
    properties.remove("content");
    Some(Document { id, content, properties })
}

fn scored_from_result(parsed: &Value) -> Vec<ScoredDocument> {
    parsed
        .get("result")
        .and_then(Value::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let document = document_from_point(hit)?;
                    let score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                    Some(ScoredDocument {
                        document,
                        distance: Some(1.0 - score),
                        certainty: Some(score),
                        score,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Build the configured vector-store backend.
#[must_use]
pub fn build_store(config: &VectorStoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Arc<dyn VectorStore> {
    match config.kind.as_str() {
        "http" => Arc::new(HttpVectorStore::new(config, embedder)),
        _ => Arc::new(InMemoryVectorStore::new(embedder)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::embeddings::HashingEmbedder;

    fn store() -> InMemoryVectorStore {
        InMemoryVectorStore::new(Arc::new(HashingEmbedder::new(64)))
    }

    fn doc(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            content: content.to_string(),
            properties: HashMap::from([("server_id".to_string(), serde_json::json!("brave"))]),
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = store();
        store.insert("tools", doc("t1", "search the web")).await.unwrap();
        let fetched = store.get("tools", "t1").await.unwrap().unwrap();
        assert_eq!(fetched.content, "search the web");
    }

    #[tokio::test]
    async fn update_metadata_rejects_non_safe_keys() {
        let store = store();
        store.insert("tools", doc("t1", "search the web")).await.unwrap();
        let patch = HashMap::from([("content".to_string(), serde_json::json!("hacked"))]);
        let result = store.update_metadata("tools", "t1", patch).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_metadata_accepts_safe_keys() {
        let store = store();
        store.insert("tools", doc("t1", "search the web")).await.unwrap();
        let patch = HashMap::from([("is_enabled".to_string(), serde_json::json!(false))]);
        store.update_metadata("tools", "t1", patch).await.unwrap();
        let fetched = store.get("tools", "t1").await.unwrap().unwrap();
        assert_eq!(fetched.properties.get("is_enabled"), Some(&serde_json::json!(false)));
    }

    #[tokio::test]
    async fn near_text_ranks_closer_matches_first() {
        let store = store();
        store.insert("tools", doc("t1", "search the web for news")).await.unwrap();
        store.insert("tools", doc("t2", "convert currency exchange rates")).await.unwrap();
        let results = store.near_text("tools", "search news articles", 2, &Filter::none()).await.unwrap();
        assert_eq!(results.first().unwrap().document.id, "t1");
    }

    #[tokio::test]
    async fn delete_by_filter_removes_matching_documents() {
        let store = store();
        store.insert("tools", doc("t1", "a")).await.unwrap();
        store
            .insert(
                "tools",
                Document {
                    id: "t2".to_string(),
                    content: "b".to_string(),
                    properties: HashMap::from([("server_id".to_string(), serde_json::json!("tavily"))]),
                },
            )
            .await
            .unwrap();
        let removed = store
            .delete_by_filter("tools", &Filter::eq("server_id", serde_json::json!("brave")))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("tools", "t1").await.unwrap().is_none());
        assert!(store.get("tools", "t2").await.unwrap().is_some());
    }
}
