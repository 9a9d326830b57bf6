//! Access Enforcement Point — the `/validate` endpoint an upstream reverse
//! proxy calls via `auth_request` on every inbound MCP call.
//!
//! Credential priority: a signed `session` cookie first, then a bearer
//! token in `X-Authorization` (preferred over the standard `Authorization`
//! header, since some proxies rewrite it), finally the standard header.
//! A token is treated as self-issued — and verified with the shared HMAC
//! secret — when its header `kid` matches the fixed self-signed marker, or
//! when its (still-unverified) `iss` claim equals the gateway's own issuer;
//! anything else is delegated to the matching IdP adapter.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::Value;

use super::policy::ScopePolicy;
use super::token::TokenService;
use crate::config::AuthServerConfig;
use crate::error::unauthorized_response;
use crate::oauth::{IdentityProvider, SessionCookie};

/// Shared state for the `/validate` handler.
pub struct ValidateState {
    /// Self-signed token verifier.
    pub tokens: Arc<TokenService>,
    /// Scope policy engine.
    pub policy: Arc<ScopePolicy>,
    /// Configured identity providers, keyed by name.
    pub providers: HashMap<String, Arc<dyn IdentityProvider>>,
    /// Routing identity, used to recognize self-issued `iss` values.
    pub auth_server: AuthServerConfig,
    /// HMAC secret backing the `session` cookie's signature (shares the
    /// token-service secret; kept separate here so callers don't need a
    /// `TokenService` just to verify a cookie wrapper).
    pub cookie_secret: Vec<u8>,
}

/// Build the `/validate` route.
#[must_use]
pub fn routes(state: Arc<ValidateState>) -> Router {
    Router::new()
        .route("/validate", get(validate).post(validate))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    valid: bool,
    username: String,
    client_id: String,
    scopes: Vec<String>,
    method: Option<String>,
    groups: Vec<String>,
    server_name: Option<String>,
    tool_name: Option<String>,
}

struct ResolvedIdentity {
    username: String,
    client_id: String,
    scopes: Vec<String>,
    groups: Vec<String>,
    auth_method: &'static str,
}

async fn validate(State(state): State<Arc<ValidateState>>, headers: HeaderMap) -> Response {
    let Some(credential) = extract_credential(&headers, &state.cookie_secret) else {
        return unauthorized_response("missing credential", None);
    };

    let identity = match resolve_identity(&state, &credential).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };

    let (server_name, method, tool_name) = parse_request_target(&headers);

    if let Some(ref server) = server_name {
        let method = method.clone().unwrap_or_else(|| "initialize".to_string());
        if identity.scopes.is_empty() {
            return forbidden("no scopes granted");
        }
        if !state
            .policy
            .allow(&identity.scopes, server, &method, tool_name.as_deref())
        {
            return forbidden("scope does not permit this operation");
        }
    }

    let body = ValidateResponse {
        valid: true,
        username: identity.username.clone(),
        client_id: identity.client_id.clone(),
        scopes: identity.scopes.clone(),
        method: method.clone(),
        groups: identity.groups.clone(),
        server_name: server_name.clone(),
        tool_name: tool_name.clone(),
    };

    let mut response = (StatusCode::OK, axum::Json(body)).into_response();
    let headers_out = response.headers_mut();
    insert_header(headers_out, "x-user", &identity.username);
    insert_header(headers_out, "x-username", &identity.username);
    insert_header(headers_out, "x-scopes", &identity.scopes.join(" "));
    insert_header(headers_out, "x-auth-method", identity.auth_method);
    insert_header(headers_out, "x-groups", &identity.groups.join(","));
    if let Some(server) = &server_name {
        insert_header(headers_out, "x-server-name", server);
    }
    if let Some(tool) = &tool_name {
        insert_header(headers_out, "x-tool-name", tool);
    }
    response
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = axum::http::HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn forbidden(message: &str) -> Response {
    (StatusCode::FORBIDDEN, axum::Json(serde_json::json!({"error": message}))).into_response()
}

/// Pull the bearer credential in priority order: `session` cookie,
/// `X-Authorization`, then `Authorization`.
fn extract_credential(headers: &HeaderMap, cookie_secret: &[u8]) -> Option<String> {
    if let Some(cookie_header) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        for pair in cookie_header.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix("session=") {
                if let Some(session_id) = SessionCookie::verify(value, cookie_secret) {
                    return Some(session_id);
                }
            }
        }
    }

    headers
        .get("x-authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(strip_bearer)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(strip_bearer)
        })
        .map(str::to_string)
}

fn strip_bearer(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

async fn resolve_identity(state: &ValidateState, token: &str) -> Result<ResolvedIdentity, Response> {
    let unverified_iss = unverified_claim(token, "iss");
    let is_self_issued = state.tokens.looks_self_issued(token)
        || unverified_iss.as_deref() == Some(state.auth_server.issuer().as_str());

    if is_self_issued {
        let claims = state
            .tokens
            .verify(token)
            .map_err(|_| unauthorized_response("invalid or expired token", None))?;
        let scopes = split_scope(&claims.scope);
        return Ok(ResolvedIdentity {
            username: claims.sub,
            client_id: claims.client_id,
            scopes,
            groups: claims.groups,
            auth_method: "self-issued",
        });
    }

    let provider = find_provider_for_issuer(state, unverified_iss.as_deref())
        .ok_or_else(|| unauthorized_response("unknown token issuer", None))?;

    let claims = provider
        .validate_idp_token(token)
        .await
        .map_err(|_| unauthorized_response("invalid identity provider token", None))?;

    let mapped = provider.map_claims(Some(&claims), None);
    // Group membership is authoritative for IdP-issued tokens: it always
    // overrides whatever scope the token itself might carry.
    let scopes = state.policy.groups_to_scopes(&mapped.groups);

    Ok(ResolvedIdentity {
        username: mapped.username,
        client_id: provider.name().to_string(),
        scopes,
        groups: mapped.groups,
        auth_method: "idp",
    })
}

fn find_provider_for_issuer<'a>(
    state: &'a ValidateState,
    iss: Option<&str>,
) -> Option<&'a Arc<dyn IdentityProvider>> {
    if let Some(iss) = iss {
        if let Some(provider) = state
            .providers
            .values()
            .find(|p| iss.starts_with(p.authorization_endpoint().trim_end_matches("/protocol/auth")))
        {
            return Some(provider);
        }
    }
    state.providers.values().next()
}

fn split_scope(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Extract a single string claim from a JWT without verifying its signature
/// — used only to route between self-issued and IdP-delegated verification.
fn unverified_claim(token: &str, key: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: Value = serde_json::from_slice(&decoded).ok()?;
    value.get(key)?.as_str().map(str::to_string)
}

/// Parse `X-Original-URL` for the server name, and `X-Body` for the method
/// and (for `tools/call`) the target tool name.
fn parse_request_target(headers: &HeaderMap) -> (Option<String>, Option<String>, Option<String>) {
    let server_name = headers
        .get("x-original-url")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_server_name);

    let (method, tool_name) = headers
        .get("x-body")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_jsonrpc_frame)
        .unwrap_or((None, None));

    (server_name, method, tool_name)
}

fn extract_server_name(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    path.split('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn parse_jsonrpc_frame(body: &str) -> Option<(Option<String>, Option<String>)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let method = value.get("method").and_then(|m| m.as_str()).map(str::to_string);
    let tool = if method.as_deref() == Some("tools/call") {
        value
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string)
    } else {
        None
    };
    Some((method, tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_server_name_takes_first_path_segment() {
        assert_eq!(extract_server_name("/brave/mcp"), Some("brave".to_string()));
        assert_eq!(extract_server_name("/brave/mcp?x=1"), Some("brave".to_string()));
        assert_eq!(extract_server_name("/"), None);
    }

    #[test]
    fn parse_jsonrpc_frame_extracts_tool_name_for_tools_call() {
        let body = r#"{"method":"tools/call","params":{"name":"brave_search"}}"#;
        let (method, tool) = parse_jsonrpc_frame(body).unwrap();
        assert_eq!(method.as_deref(), Some("tools/call"));
        assert_eq!(tool.as_deref(), Some("brave_search"));
    }

    #[test]
    fn parse_jsonrpc_frame_has_no_tool_for_other_methods() {
        let body = r#"{"method":"tools/list"}"#;
        let (method, tool) = parse_jsonrpc_frame(body).unwrap();
        assert_eq!(method.as_deref(), Some("tools/list"));
        assert!(tool.is_none());
    }
}
