//! Tool & server discovery.
//!
//! The vector-search engine (`document`/`embeddings`/`store`/`ranking`/
//! `rerank`/`sync`/`query`) indexes the MCP catalog for semantic, keyword,
//! hybrid, and fuzzy retrieval, scope-filtered at query time. Grounded
//! on `swissknife-vectordb-sdk`'s provider-per-backend traits, the
//! concurrency idiom (`DashMap`-backed in-memory adapter, `async_trait`
//! object-safe store trait) on the gateway's own `key_server::store`.

pub mod document;
pub mod embeddings;
pub mod query;
pub mod ranking;
pub mod rerank;
pub mod store;
pub mod sync;

pub use document::{Document, EntityType, Filter, ScoredDocument};
pub use embeddings::{EmbeddingProvider, build_embedder};
pub use query::{QueryState, routes};
pub use rerank::{HostedReranker, Reranker, search_with_rerank};
pub use store::{SearchType, VectorStore, build_store};
pub use sync::{CatalogSync, ServerSpec, ToolDiff, ToolSpec, diff_tools};
