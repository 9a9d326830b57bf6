//! Query API: `search/semantic`, `search/servers`, `search/tools`.
//!
//! Every handler validates its inputs (query length, result cap) before
//! touching the index, and the index being unreachable surfaces as `503`
//! rather than an empty result set, so callers can tell "nothing matched"
//! from "the backend is down".

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};

use super::document::{EntityType, Filter, ScoredDocument};
use super::embeddings::EmbeddingProvider;
use super::ranking::{Highlighted, rerank_by_fresh_embedding, with_highlights};
use super::rerank::{Reranker, search_with_rerank};
use super::store::{SearchType, VectorStore};
use super::sync::{CatalogSync, ServerSpec};
use crate::error::{DiscoveryError, Result};
use crate::key_server::policy::ScopePolicy;

const MIN_QUERY_LEN: usize = 1;
const MAX_QUERY_LEN: usize = 512;

/// Shared state for the discovery query surface.
pub struct QueryState {
    /// Backing vector store.
    pub store: Arc<dyn VectorStore>,
    /// Cross-encoder reranker used by the hybrid+rerank default paths.
    pub reranker: Arc<dyn Reranker>,
    /// Embedding provider, for the tool finder's secondary re-embedding
    /// ranking stage.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// Scope policy, for post-filtering tool results against caller scopes.
    pub policy: Arc<ScopePolicy>,
    /// Upper bound on `max_results`/`top_n` regardless of what a caller
    /// requests.
    pub max_results_cap: usize,
    /// Catalog sync component, for the admin `/discovery/sync/server*`
    /// surface.
    pub catalog_sync: Arc<CatalogSync>,
}

/// Mount the discovery query and admin sync routes.
#[must_use]
pub fn routes(state: Arc<QueryState>) -> Router {
    Router::new()
        .route("/discovery/search/semantic", post(search_semantic))
        .route("/discovery/search/servers", post(search_servers))
        .route("/discovery/search/tools", post(search_tools))
        .route("/discovery/sync/server", post(sync_server))
        .route("/discovery/sync/server/{id}", axum::routing::delete(sync_disable_server))
        .with_state(state)
}

fn validate_query(query: &str) -> Result<()> {
    let len = query.chars().count();
    if !(MIN_QUERY_LEN..=MAX_QUERY_LEN).contains(&len) {
        return Err(DiscoveryError::InvalidQuery(format!(
            "query must be {MIN_QUERY_LEN}-{MAX_QUERY_LEN} characters, got {len}"
        ))
        .into());
    }
    Ok(())
}

fn clamp_max_results(requested: usize, cap: usize) -> usize {
    requested.clamp(1, cap)
}

#[derive(Debug, Deserialize)]
struct SemanticQuery {
    query: String,
    #[serde(default)]
    entity_types: Vec<EntityType>,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SemanticResults {
    servers: Vec<ScoredDocument>,
    tools: Vec<ScoredDocument>,
}

async fn search_semantic(State(state): State<Arc<QueryState>>, Json(params): Json<SemanticQuery>) -> Response {
    if let Err(e) = validate_query(&params.query) {
        return e.into_response();
    }
    let k = clamp_max_results(params.max_results, state.max_results_cap);
    let want = |t: EntityType| params.entity_types.is_empty() || params.entity_types.contains(&t);

    let servers = if want(EntityType::Server) {
        match state.store.near_text("servers", &params.query, k, &Filter::none()).await {
            Ok(r) => r,
            Err(e) => return e.into_response(),
        }
    } else {
        vec![]
    };
    let tools = if want(EntityType::Tool) {
        match state.store.near_text("tools", &params.query, k, &Filter::none()).await {
            Ok(r) => r,
            Err(e) => return e.into_response(),
        }
    } else {
        vec![]
    };

    Json(SemanticResults { servers, tools }).into_response()
}

#[derive(Debug, Deserialize)]
struct ServersQuery {
    query: String,
    #[serde(default = "default_top_n")]
    top_n: usize,
    #[serde(default)]
    search_type: SearchTypeParam,
    #[serde(default)]
    include_disabled: bool,
}

fn default_top_n() -> usize {
    10
}

#[derive(Debug, Default, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum SearchTypeParam {
    #[default]
    Hybrid,
    Semantic,
    Bm25,
}

impl From<SearchTypeParam> for SearchType {
    fn from(value: SearchTypeParam) -> Self {
        match value {
            SearchTypeParam::Hybrid => SearchType::Hybrid(0.5),
            SearchTypeParam::Semantic => SearchType::Semantic,
            SearchTypeParam::Bm25 => SearchType::Bm25,
        }
    }
}

async fn search_servers(State(state): State<Arc<QueryState>>, Json(params): Json<ServersQuery>) -> Response {
    if let Err(e) = validate_query(&params.query) {
        return e.into_response();
    }
    let k = clamp_max_results(params.top_n, state.max_results_cap);
    let filter = if params.include_disabled {
        Filter::none()
    } else {
        Filter::eq("is_enabled", serde_json::json!(true))
    };

    // Default path is hybrid+rerank; an explicit non-hybrid search_type
    // skips reranking to keep its ranking signal pure.
    let result = match params.search_type {
        SearchTypeParam::Hybrid => {
            search_with_rerank(
                state.store.as_ref(),
                state.reranker.as_ref(),
                "servers",
                &params.query,
                k,
                SearchType::Hybrid(0.5),
                &filter,
            )
            .await
        }
        other => state.store.search("servers", other.into(), &params.query, k, &filter).await,
    };

    match result {
        Ok(docs) => Json(docs).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ToolsQuery {
    query: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    user_scopes: Vec<String>,
    #[serde(default = "default_top_k_services")]
    top_k_services: usize,
    #[serde(default = "default_top_n")]
    top_n_tools: usize,
}

fn default_top_k_services() -> usize {
    5
}

async fn search_tools(State(state): State<Arc<QueryState>>, Json(params): Json<ToolsQuery>) -> Response {
    if let Err(e) = validate_query(&params.query) {
        return e.into_response();
    }

    // Fail-closed: no scopes means no tools, independent of match quality.
    if params.user_scopes.is_empty() {
        return Json(Vec::<ScoredDocument>::new()).into_response();
    }

    let top_k_services = clamp_max_results(params.top_k_services, state.max_results_cap);
    let top_n_tools = clamp_max_results(params.top_n_tools, state.max_results_cap);

    let server_filter = if params.tags.is_empty() {
        Filter::eq("is_enabled", serde_json::json!(true))
    } else {
        Filter(HashMap::from([(
            "$and".to_string(),
            serde_json::json!([
                {"is_enabled": true},
                {"tags": params.tags},
            ]),
        )]))
    };

    let candidate_servers = match state
        .store
        .hybrid("servers", &params.query, top_k_services, 0.5, &server_filter)
        .await
    {
        Ok(servers) => servers,
        Err(e) => return e.into_response(),
    };

    let server_paths: Vec<serde_json::Value> = candidate_servers
        .iter()
        .filter_map(|s| s.document.properties.get("server_path").cloned())
        .collect();
    if server_paths.is_empty() {
        return Json(Vec::<ScoredDocument>::new()).into_response();
    }
    let tool_filter = Filter::eq("server_path", serde_json::Value::Array(server_paths));

    let candidate_tools = match state.store.filter("tools", &tool_filter, usize::MAX, 0).await {
        Ok(tools) => tools,
        Err(e) => return e.into_response(),
    };

    // The tool finder's secondary ranking: re-embed every surviving tool's
    // content against the literal query text rather than trusting the
    // server-level hybrid score to carry over.
    let embedder_result = rerank_by_fresh_embedding(state.embedder.as_ref(), &params.query, candidate_tools).await;
    let reranked = match embedder_result {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let allowed: Vec<ScoredDocument> = reranked
        .into_iter()
        .filter(|doc| {
            let server = doc
                .document
                .properties
                .get("server_path")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let tool_name = doc
                .document
                .properties
                .get("tool_name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            state.policy.allow(&params.user_scopes, server, "tools/call", Some(tool_name))
        })
        .take(top_n_tools)
        .collect();

    Json(allowed).into_response()
}

#[derive(Debug, Deserialize)]
struct SyncServerRequest {
    server: ServerSpec,
    #[serde(default)]
    previous: Option<ServerSpec>,
}

async fn sync_server(State(state): State<Arc<QueryState>>, Json(req): Json<SyncServerRequest>) -> Response {
    match state.catalog_sync.upsert_server(&req.server, req.previous.as_ref()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn sync_disable_server(State(state): State<Arc<QueryState>>, Path(id): Path<String>) -> Response {
    match state.catalog_sync.disable_server(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Fuzzy search with highlighting, exposed for callers that want matched
/// spans rather than the classic tool-finder pipeline.
///
/// # Errors
///
/// Propagates any underlying index error.
pub async fn fuzzy_with_highlights(
    store: &dyn VectorStore,
    collection: &str,
    query: &str,
    k: usize,
    filter: &Filter,
) -> Result<Vec<Highlighted>> {
    validate_query(query)?;
    let results = store.fuzzy(collection, query, k, filter).await?;
    Ok(with_highlights(query, results))
}
