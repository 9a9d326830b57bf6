//! RFC 8414 / OIDC / RFC 8707 discovery metadata.
//!
//! The upstream gateway only ever *consumed* this shape, fetching it from an
//! upstream IdP (see [`crate::oauth::providers`], grounded on the gateway's
//! `oauth::metadata::AuthorizationServerMetadata`/`ProtectedResourceMetadata`
//! client). Here the gateway is itself the authorization server, so the same
//! fields are served rather than fetched.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::key_server::policy::ScopePolicy;

/// Shared state for the well-known metadata surface.
pub struct WellKnownState {
    /// Resolved configuration, for issuer/endpoint construction and the
    /// default provider to redirect bare `/authorize` hits to.
    pub config: Arc<Config>,
    /// Scope policy, for the `scopes_supported` metadata field.
    pub policy: Arc<ScopePolicy>,
}

/// Mount the `/.well-known/*` routes and the root-level `/authorize` shim.
#[must_use]
pub fn routes(state: Arc<WellKnownState>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/.well-known/jwks.json", get(jwks))
        .route(
            "/.well-known/oauth-protected-resource/{*path}",
            get(protected_resource_metadata),
        )
        .route("/authorize", get(authorize_shim))
        .with_state(state)
}

/// RFC 8414 Authorization Server Metadata.
#[derive(Debug, Serialize)]
struct AuthorizationServerMetadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    registration_endpoint: String,
    device_authorization_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    userinfo_endpoint: Option<String>,
    grant_types_supported: Vec<String>,
    response_types_supported: Vec<String>,
    scopes_supported: Vec<String>,
    token_endpoint_auth_methods_supported: Vec<String>,
    code_challenge_methods_supported: Vec<String>,
}

/// RFC 8707 / 9728-shaped Protected Resource Metadata.
#[derive(Debug, Serialize)]
struct ProtectedResourceMetadata {
    resource: String,
    authorization_servers: Vec<String>,
    bearer_methods_supported: Vec<String>,
    scopes_supported: Vec<String>,
}

fn scopes_supported(state: &WellKnownState) -> Vec<String> {
    state.policy.scope_names()
}

async fn authorization_server_metadata(State(state): State<Arc<WellKnownState>>) -> Response {
    let auth_server = &state.config.auth_server;
    let metadata = AuthorizationServerMetadata {
        issuer: auth_server.issuer(),
        authorization_endpoint: auth_server.endpoint("/authorize"),
        token_endpoint: auth_server.endpoint("/oauth2/token"),
        registration_endpoint: auth_server.endpoint("/oauth2/register"),
        device_authorization_endpoint: auth_server.endpoint("/oauth2/device/code"),
        userinfo_endpoint: None,
        grant_types_supported: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
            "client_credentials".to_string(),
            "urn:ietf:params:oauth:grant-type:device_code".to_string(),
        ],
        response_types_supported: vec!["code".to_string()],
        scopes_supported: scopes_supported(&state),
        token_endpoint_auth_methods_supported: vec!["none".to_string(), "client_secret_post".to_string()],
        code_challenge_methods_supported: vec!["S256".to_string(), "plain".to_string()],
    };
    axum::Json(metadata).into_response()
}

async fn openid_configuration(State(state): State<Arc<WellKnownState>>) -> Response {
    // Identical surface to the RFC 8414 document: this gateway doesn't issue
    // ID tokens of its own, it only relays identity asserted by the upstream
    // IdP during login.
    authorization_server_metadata(State(state)).await
}

async fn jwks() -> Response {
    // Tokens are HMAC-signed with a shared secret, not an asymmetric key
    // pair, so there is nothing to publish here beyond an empty key set.
    axum::Json(serde_json::json!({"keys": []})).into_response()
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceQuery {
    #[serde(default)]
    resource: Option<String>,
}

async fn protected_resource_metadata(
    Path(path): Path<String>,
    Query(query): Query<ProtectedResourceQuery>,
    State(state): State<Arc<WellKnownState>>,
) -> Response {
    let resource = query
        .resource
        .unwrap_or_else(|| state.config.auth_server.endpoint(&format!("/{path}")));
    let metadata = ProtectedResourceMetadata {
        resource,
        authorization_servers: vec![state.config.auth_server.issuer()],
        bearer_methods_supported: vec!["header".to_string()],
        scopes_supported: scopes_supported(&state),
    };
    axum::Json(metadata).into_response()
}

/// Root-level `/authorize` shim: some clients build the authorize URL from
/// the issuer origin rather than the full prefixed issuer path. Preserve
/// every query parameter and 307-redirect to the real, prefixed login route.
async fn authorize_shim(
    axum::extract::RawQuery(query): axum::extract::RawQuery,
    State(state): State<Arc<WellKnownState>>,
) -> Response {
    let params = url::Url::parse("http://placeholder/")
        .map(|mut u| {
            u.set_query(query.as_deref());
            u
        })
        .ok();
    let provider = params
        .as_ref()
        .and_then(|u| u.query_pairs().find(|(k, _)| k == "provider").map(|(_, v)| v.to_string()))
        .or_else(|| state.config.default_provider.clone())
        .unwrap_or_default();

    let mut target = state
        .config
        .auth_server
        .endpoint(&format!("/oauth2/login/{provider}"));
    if let Some(q) = query {
        target.push('?');
        target.push_str(&q);
    }
    Redirect::temporary(&target).into_response()
}
