//! Access Enforcement Point and token-minting surface.
//!
//! Three collaborators meet here: the self-signed [`TokenService`] (mints
//! and verifies HMAC access tokens), the [`ScopePolicy`] engine (group- and
//! scope-based authorization), and [`validate`]'s `/validate` handler (the
//! decision endpoint an upstream reverse proxy calls via `auth_request` on
//! every inbound MCP request). [`audit`] gives every lifecycle transition a
//! structured log line.

pub mod audit;
pub mod policy;
pub mod token;
pub mod validate;

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::Deserialize;

use crate::config::TokenConfig;
use crate::error::unauthorized_response;
use crate::oauth::IdentityProvider;

pub use audit::AuditEvent;
pub use policy::ScopePolicy;
pub use token::{Claims, MintRequest, TokenService};
pub use validate::{ValidateState, routes as validate_routes};

/// State for the `/internal/tokens` admin surface: mint user-generated
/// self-signed tokens, rate-limited per caller.
pub struct InternalTokenState {
    /// Self-signed token service, shared with [`ValidateState`].
    pub tokens: Arc<TokenService>,
    /// Configured identity providers, used to resolve the caller's identity
    /// from whatever bearer credential they present.
    pub providers: HashMap<String, Arc<dyn IdentityProvider>>,
    /// Token-lifetime bounds (`default_user_lifetime`, `max_user_lifetime`).
    pub token_config: TokenConfig,
}

/// Mount the `/internal/tokens` route.
#[must_use]
pub fn internal_token_routes(state: Arc<InternalTokenState>) -> Router {
    Router::new()
        .route("/internal/tokens", post(mint_user_token))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MintUserTokenRequest {
    #[serde(default)]
    scope: Option<String>,
    /// Requested lifetime in seconds; clamped to `max_user_lifetime`.
    lifetime_secs: Option<u64>,
    resource: Option<String>,
}

async fn mint_user_token(
    State(state): State<Arc<InternalTokenState>>,
    headers: HeaderMap,
    Json(req): Json<MintUserTokenRequest>,
) -> Response {
    let Some(bearer) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
    else {
        return unauthorized_response("this endpoint requires a logged-in user", None);
    };

    let identity = match resolve_caller(&state, bearer).await {
        Some(identity) => identity,
        None => return unauthorized_response("invalid token", None),
    };

    if !state.tokens.check_rate_limit(&identity.0) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "rate limit exceeded"})),
        )
            .into_response();
    }

    let lifetime = match req.lifetime_secs {
        Some(0) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "invalid_request", "error_description": "lifetime_secs must be greater than 0"})),
            )
                .into_response();
        }
        Some(secs) => {
            let requested = std::time::Duration::from_secs(secs);
            if requested > state.token_config.max_user_lifetime {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "invalid_request",
                        "error_description": format!(
                            "lifetime_secs must not exceed {}",
                            state.token_config.max_user_lifetime.as_secs()
                        ),
                    })),
                )
                    .into_response();
            }
            requested.as_secs()
        }
        None => state.token_config.default_user_lifetime.as_secs(),
    };

    let scopes: Vec<String> = req
        .scope
        .as_deref()
        .unwrap_or(&identity.3.join(" "))
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mint_result = state.tokens.mint(MintRequest {
        sub: &identity.0,
        user_id: identity.1.as_deref(),
        email: &identity.2,
        scopes: &scopes,
        groups: &identity.3,
        client_id: "internal-token-mint",
        resource: req.resource.as_deref(),
        lifetime_secs: lifetime,
    });

    match mint_result {
        Ok((access_token, expires_in, jti)) => {
            audit::emit(&AuditEvent::token_issued(&identity.0, "internal-token-mint", &jti, scopes.clone()));
            Json(serde_json::json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": expires_in,
                "scope": scopes.join(" "),
            }))
            .into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "minting failed"})))
            .into_response(),
    }
}

/// Resolve the caller's (username, user_id, email, groups) from a bearer
/// token, trying the self-issued verifier first and falling back to every
/// configured IdP adapter.
async fn resolve_caller(
    state: &InternalTokenState,
    token: &str,
) -> Option<(String, Option<String>, String, Vec<String>)> {
    if state.tokens.looks_self_issued(token) {
        let claims = state.tokens.verify(token).ok()?;
        return Some((claims.sub, claims.user_id, claims.email, claims.groups));
    }
    for provider in state.providers.values() {
        if let Ok(claims) = provider.validate_idp_token(token).await {
            let mapped = provider.map_claims(Some(&claims), None);
            return Some((mapped.username, mapped.user_id, mapped.email, mapped.groups));
        }
    }
    None
}
