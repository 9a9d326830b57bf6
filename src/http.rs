//! HTTP transport & wiring: assembles every subsystem's `axum::Router` into
//! one service, layers on tracing/CORS/timeout middleware, and runs it to
//! completion with graceful shutdown — the same signal-racing shape as the
//! upstream gateway's `gateway::server::Gateway::run`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::{self, CatalogSync, QueryState, VectorStore};
use crate::key_server::{self, InternalTokenState, TokenService, ValidateState};
use crate::oauth::{self, FlowStore, FlowState, IdentityProvider};
use crate::wellknown::{self, WellKnownState};
use crate::{Error, Result};

/// Everything the assembled router needs, already constructed from
/// [`Config`]. Kept separate from `Gateway` so tests can build a router
/// against fakes/mocks without a real bind.
pub struct AppContext {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Identity provider adapters, keyed by provider name.
    pub providers: std::collections::HashMap<String, Arc<dyn IdentityProvider>>,
    /// Self-signed token minting/verification service.
    pub tokens: Arc<TokenService>,
    /// Scope & policy engine.
    pub policy: Arc<key_server::ScopePolicy>,
    /// OAuth client registry.
    pub registry: Arc<oauth::ClientRegistry>,
    /// User-id resolution store.
    pub users: Arc<dyn crate::userstore::UserStore>,
    /// Authorization-code / device-code / refresh-token store.
    pub flow_store: Arc<FlowStore>,
    /// Vector store backing discovery.
    pub vector_store: Arc<dyn VectorStore>,
    /// Catalog sync component over the vector store.
    pub catalog_sync: Arc<CatalogSync>,
    /// Cross-encoder reranker used by discovery's hybrid+rerank path.
    pub reranker: Arc<dyn discovery::Reranker>,
    /// Embedding provider backing the vector store and query-time
    /// re-embedding.
    pub embedder: Arc<dyn discovery::EmbeddingProvider>,
}

impl AppContext {
    /// Build every collaborator from configuration. Does not bind a socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the scope policy file cannot be loaded.
    pub fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let jwks = Arc::new(oauth::JwksCache::new(
            reqwest::Client::new(),
            Duration::from_secs(3600),
        ));
        let providers = config
            .providers
            .iter()
            .map(|(name, provider_config)| {
                (name.clone(), oauth::build_provider(provider_config.clone(), Arc::clone(&jwks)))
            })
            .collect();

        let tokens = Arc::new(TokenService::new(config.token.clone()));
        let policy = Arc::new(match &config.scopes.config_path {
            Some(path) => key_server::ScopePolicy::load(std::path::Path::new(path))?,
            None => key_server::ScopePolicy::empty(),
        });
        let registry = Arc::new(oauth::ClientRegistry::new());
        let users: Arc<dyn crate::userstore::UserStore> = Arc::new(crate::userstore::InMemoryUserStore::new());
        let flow_store = Arc::new(FlowStore::new());

        let embedder = discovery::build_embedder(&config.discovery.embeddings);
        let vector_store = discovery::build_store(&config.discovery.vector_store, Arc::clone(&embedder));
        let catalog_sync = Arc::new(CatalogSync::new(Arc::clone(&vector_store)));
        let reranker: Arc<dyn discovery::Reranker> = Arc::new(discovery::HostedReranker::new(
            config.discovery.vector_store.host.clone(),
        ));

        Ok(Self {
            config,
            providers,
            tokens,
            policy,
            registry,
            users,
            flow_store,
            vector_store,
            catalog_sync,
            reranker,
            embedder,
        })
    }

    /// Assemble the full HTTP surface: OAuth flow, well-known metadata,
    /// the access-enforcement `/validate` endpoint, internal token minting,
    /// and discovery search — layered with tracing, CORS, and a request
    /// timeout.
    #[must_use]
    pub fn router(&self) -> Router {
        let oauth_state = Arc::new(FlowState {
            config: Arc::clone(&self.config),
            providers: self.providers.clone(),
            store: Arc::clone(&self.flow_store),
            registry: Arc::clone(&self.registry),
            users: Arc::clone(&self.users),
            tokens: Arc::clone(&self.tokens),
            policy: Arc::clone(&self.policy),
            sessions: dashmap::DashMap::new(),
            cookie_secret: self.config.token.secret_key.as_bytes().to_vec(),
        });

        let validate_state = Arc::new(ValidateState {
            tokens: Arc::clone(&self.tokens),
            policy: Arc::clone(&self.policy),
            providers: self.providers.clone(),
            auth_server: self.config.auth_server.clone(),
            cookie_secret: self.config.token.secret_key.as_bytes().to_vec(),
        });

        let internal_token_state = Arc::new(InternalTokenState {
            tokens: Arc::clone(&self.tokens),
            providers: self.providers.clone(),
            token_config: self.config.token.clone(),
        });

        let wellknown_state = Arc::new(WellKnownState {
            config: Arc::clone(&self.config),
            policy: Arc::clone(&self.policy),
        });

        let query_state = Arc::new(QueryState {
            store: Arc::clone(&self.vector_store),
            reranker: Arc::clone(&self.reranker),
            embedder: Arc::clone(&self.embedder),
            policy: Arc::clone(&self.policy),
            max_results_cap: self.config.discovery.max_results,
            catalog_sync: Arc::clone(&self.catalog_sync),
        });

        let health_state = Arc::new(HealthState {
            vector_store: Arc::clone(&self.vector_store),
        });

        let cors = cors_layer(&self.config.cors_origins);

        // Every operational endpoint lives under the configured API prefix;
        // only the well-known metadata documents, the health checks, and the
        // root-level `/authorize` shim are served at the bare origin, per
        // RFC 8414's issuer-is-the-prefix-stripped-origin rule.
        let api = Router::new()
            .merge(oauth::routes(oauth_state))
            .merge(key_server::validate_routes(validate_state))
            .merge(key_server::internal_token_routes(internal_token_state))
            .merge(discovery::routes(query_state));

        let health = Router::new()
            .route("/health", get(liveness))
            .route("/healthz/ready", get(readiness))
            .with_state(health_state);

        Router::new()
            .nest(&self.config.auth_server.api_prefix, api)
            .merge(wellknown::routes(wellknown_state))
            .merge(health)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(TimeoutLayer::new(self.config.server.request_timeout))
    }

    /// Bind and serve the assembled router until a shutdown signal arrives,
    /// draining in-flight requests up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured address cannot be bound, or if
    /// the server loop exits with an I/O error.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid host/port: {e}")))?;
        let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
        info!(%addr, "MCP gateway listening");

        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(Error::Io)?;

        info!("shutdown complete");
        Ok(())
    }
}

/// State for the unprefixed health-check routes.
struct HealthState {
    vector_store: Arc<dyn VectorStore>,
}

/// Liveness probe: always 200 once the process is serving requests.
async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only if the vector store actually answers a query,
/// 503 otherwise, so a load balancer can pull an instance whose index
/// backend died without killing the process.
async fn readiness(State(state): State<Arc<HealthState>>) -> Response {
    match state.vector_store.filter("servers", &discovery::Filter::none(), 1, 0).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!(error = %e, "readiness check failed: vector store unreachable");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(allowed)).allow_methods(tower_http::cors::Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
