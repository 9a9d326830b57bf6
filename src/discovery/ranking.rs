//! Score-combination helpers shared by the fuzzy-search highlighter and the
//! tool-finder's secondary re-embedding pass: alpha-weighting between vector
//! and keyword signal lives in [`super::store::InMemoryVectorStore::hybrid`];
//! what's here is built on top of a completed search, not inside one.

use super::document::{Document, ScoredDocument};
use super::embeddings::EmbeddingProvider;
use super::store::cosine;
use crate::error::Result;

/// A [`ScoredDocument`] plus the query terms that were found in its content,
/// for client-side highlighting.
#[derive(Debug, Clone)]
pub struct Highlighted {
    /// The underlying scored document.
    pub document: ScoredDocument,
    /// Query terms found (case-insensitively) in the document's content.
    pub highlights: Vec<String>,
}

/// Terms from `query` that appear in `content`, preserving query order and
/// deduplicating.
#[must_use]
pub fn highlight(query: &str, content: &str) -> Vec<String> {
    let content_lower = content.to_lowercase();
    let mut seen = std::collections::HashSet::new();
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|term| content_lower.contains(term.as_str()))
        .filter(|term| seen.insert(term.clone()))
        .collect()
}

/// Attach highlight spans to each result of a fuzzy search.
#[must_use]
pub fn with_highlights(query: &str, results: Vec<ScoredDocument>) -> Vec<Highlighted> {
    results
        .into_iter()
        .map(|document| {
            let highlights = highlight(query, &document.document.content);
            Highlighted { document, highlights }
        })
        .collect()
}

/// Re-embed each candidate's content against `query` and re-sort by cosine
/// similarity. The "intelligent tool finder" query path uses this as its
/// secondary ranking stage: a coarse server/tool retrieval narrows the
/// candidate set, then every surviving tool gets a dedicated comparison
/// against the literal query text.
///
/// # Errors
///
/// Returns an error if the embedding provider fails for the query or any
/// candidate's content.
pub async fn rerank_by_fresh_embedding(
    embedder: &dyn EmbeddingProvider,
    query: &str,
    candidates: Vec<Document>,
) -> Result<Vec<ScoredDocument>> {
    let query_vector = embedder.embed(query).await?;
    let mut scored = Vec::with_capacity(candidates.len());
    for document in candidates {
        let vector = embedder.embed(&document.content).await?;
        let score = cosine(&query_vector, &vector);
        scored.push(ScoredDocument {
            document,
            distance: Some(1.0 - score),
            certainty: Some(score),
            score,
        });
    }
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::embeddings::HashingEmbedder;
    use std::collections::HashMap;

    #[test]
    fn highlight_finds_case_insensitive_term_overlap() {
        let terms = highlight("Search Web News", "a tool to search the web for articles");
        assert_eq!(terms, vec!["search".to_string(), "web".to_string()]);
    }

    #[test]
    fn highlight_dedups_repeated_query_terms() {
        let terms = highlight("search search web", "search the web");
        assert_eq!(terms, vec!["search".to_string(), "web".to_string()]);
    }

    #[tokio::test]
    async fn rerank_by_fresh_embedding_orders_by_similarity() {
        let embedder = HashingEmbedder::new(64);
        let candidates = vec![
            Document { id: "a".to_string(), content: "convert currency exchange rates".to_string(), properties: HashMap::new() },
            Document { id: "b".to_string(), content: "search the web for news".to_string(), properties: HashMap::new() },
        ];
        let results = rerank_by_fresh_embedding(&embedder, "search news articles", candidates).await.unwrap();
        assert_eq!(results.first().unwrap().document.id, "b");
    }
}
