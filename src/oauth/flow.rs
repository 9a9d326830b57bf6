//! OAuth flow engine: the `/oauth2/*` surface the MCP clients and the
//! upstream reverse proxy interact with directly.
//!
//! Handlers follow the same axum-handler idiom as the upstream gateway's
//! key-server handlers ([`crate::key_server::validate`]): thin request/response
//! types, a shared `Arc<State>` extractor, and `IntoResponse` built from the
//! crate's typed error taxonomy rather than ad hoc JSON.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use super::codes::{AuthCodeRecord, DeviceCodeRecord, DeviceStatus, FlowStore, RefreshTokenRecord};
use super::providers::{IdentityProvider, MappedUserContext};
use super::registry::{ClientRegistrationRequest, ClientRegistry};
use super::session::SessionCookie;
use crate::config::Config;
use crate::error::{OAuthError, OAuthErrorCode, unauthorized_response};
use crate::key_server::audit::{self, AuditEvent};
use crate::key_server::policy::ScopePolicy;
use crate::key_server::token::{MintRequest, TokenService};
use crate::userstore::UserStore;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn split_scope(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Shared state for the entire `/oauth2/*` surface.
pub struct FlowState {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Configured identity providers, keyed by name.
    pub providers: HashMap<String, Arc<dyn IdentityProvider>>,
    /// Authorization-code / device-code / refresh-token tables.
    pub store: Arc<FlowStore>,
    /// Registered OAuth clients.
    pub registry: Arc<ClientRegistry>,
    /// User-store collaborator.
    pub users: Arc<dyn UserStore>,
    /// Self-signed access-token service.
    pub tokens: Arc<TokenService>,
    /// Scope policy engine.
    pub policy: Arc<ScopePolicy>,
    /// In-flight login sessions, keyed by session id. The cookie only
    /// carries the signed id; this table holds the actual state.
    pub sessions: DashMap<String, SessionCookie>,
    /// HMAC key backing session-cookie signatures (shared with
    /// [`crate::key_server::validate`]'s `session` cookie verification).
    pub cookie_secret: Vec<u8>,
}

/// Mount the OAuth flow engine's routes.
#[must_use]
pub fn routes(state: Arc<FlowState>) -> Router {
    Router::new()
        .route("/oauth2/providers", get(list_providers))
        .route("/oauth2/login/{provider}", get(login))
        .route("/oauth2/callback/{provider}", get(callback))
        .route("/oauth2/token", post(token))
        .route("/oauth2/register", post(register))
        .route("/oauth2/device/code", post(device_code))
        .route("/oauth2/device/verify", get(device_verify))
        .route("/oauth2/device/approve", post(approve_device))
        .route("/oauth2/logout/{provider}", get(logout))
        .with_state(state)
}

// ── /oauth2/providers ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ProviderInfo {
    name: String,
    authorization_endpoint: String,
}

async fn list_providers(State(state): State<Arc<FlowState>>) -> Response {
    let providers: Vec<ProviderInfo> = state
        .providers
        .values()
        .map(|p| ProviderInfo {
            name: p.name().to_string(),
            authorization_endpoint: p.authorization_endpoint(),
        })
        .collect();
    Json(providers).into_response()
}

// ── /oauth2/login/{provider} ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    state: String,
    code_challenge: String,
    #[serde(default = "default_challenge_method")]
    code_challenge_method: String,
    #[serde(default)]
    scope: String,
    resource: Option<String>,
}

fn default_challenge_method() -> String {
    "S256".to_string()
}

async fn login(
    Path(provider_name): Path<String>,
    Query(params): Query<AuthorizeParams>,
    State(state): State<Arc<FlowState>>,
) -> Response {
    let Some(provider) = state.providers.get(&provider_name) else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "unknown provider").into_response();
    };
    if state.registry.get(&params.client_id).is_none() {
        return OAuthError::new(OAuthErrorCode::InvalidClient, "unregistered client").into_response();
    }
    if !state
        .registry
        .redirect_uri_is_registered(&params.client_id, &params.redirect_uri)
    {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "redirect_uri not registered")
            .into_response();
    }

    let session = SessionCookie::new(
        provider_name.clone(),
        params.client_id,
        params.redirect_uri,
        params.state,
        params.code_challenge,
        params.code_challenge_method,
        params.scope,
        params.resource,
    );
    let cookie_value = SessionCookie::sign(&session.session_id, &state.cookie_secret);
    let idp_redirect_uri = state
        .config
        .auth_server
        .endpoint(&format!("/oauth2/callback/{provider_name}"));
    let idp_state = session.idp_state.clone();
    state.sessions.insert(session.session_id.clone(), session);

    let Ok(mut authorize_url) = Url::parse(&provider.authorization_endpoint()) else {
        return OAuthError::new(OAuthErrorCode::ServerError, "malformed provider endpoint")
            .into_response();
    };
    authorize_url
        .query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", &idp_redirect_uri)
        .append_pair("state", &idp_state);

    let mut response = Redirect::temporary(authorize_url.as_str()).into_response();
    if let Ok(cookie) = HeaderValue::from_str(&format!(
        "session={cookie_value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        state.config.flow.session_ttl.as_secs()
    )) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

// ── /oauth2/callback/{provider} ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: String,
    error: Option<String>,
}

async fn callback(
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackParams>,
    State(state): State<Arc<FlowState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = read_session_cookie(&headers, &state.cookie_secret) else {
        return unauthorized_response("missing or invalid session cookie", None);
    };
    let Some((_, session)) = state.sessions.remove(&session_id) else {
        return unauthorized_response("expired or unknown session", None);
    };
    let resource_metadata = session.resource.as_deref().map(|r| {
        state
            .config
            .auth_server
            .endpoint(&format!("/.well-known/oauth-protected-resource/{r}"))
    });
    if session.is_expired(state.config.flow.session_ttl.as_secs()) {
        return unauthorized_response("login session expired, please retry", resource_metadata.as_deref());
    }
    if session.idp_state != params.state {
        audit::emit(&AuditEvent::denied("idp state mismatch", None));
        return unauthorized_response("state mismatch", resource_metadata.as_deref());
    }
    if let Some(error) = params.error {
        return OAuthError::new(OAuthErrorCode::AccessDenied, error).into_response();
    }
    let Some(code) = params.code else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing code").into_response();
    };

    let Some(provider) = state.providers.get(&provider_name) else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "unknown provider").into_response();
    };
    let idp_redirect_uri = state
        .config
        .auth_server
        .endpoint(&format!("/oauth2/callback/{provider_name}"));

    let bundle = match provider.exchange_code(&code, &idp_redirect_uri).await {
        Ok(bundle) => bundle,
        Err(e) => {
            audit::emit(&AuditEvent::denied(format!("idp exchange failed: {e}"), None));
            return OAuthError::new(OAuthErrorCode::ServerError, "identity provider exchange failed")
                .into_response();
        }
    };

    let id_claims = match &bundle.id_token {
        Some(id_token) => provider.validate_idp_token(id_token).await.ok(),
        None => None,
    };
    let userinfo = if id_claims.is_none() {
        provider.fetch_userinfo(&bundle.access_token).await.ok()
    } else {
        None
    };

    let mut mapped = provider.map_claims(id_claims.as_ref(), userinfo.as_ref());
    mapped.user_id = state.users.resolve(&mapped.idp_id, &mapped.username, &mapped.email).await;
    mapped.scopes = state.policy.groups_to_scopes(&mapped.groups);

    let auth_code = FlowStore::generate_auth_code();
    state.store.insert_auth_code(AuthCodeRecord {
        code: auth_code.clone(),
        client_id: session.client_id.clone(),
        user_context: mapped.clone(),
        redirect_uri: session.client_redirect_uri.clone(),
        code_challenge: session.code_challenge.clone(),
        code_challenge_method: session.code_challenge_method.clone(),
        resource: session.resource.clone(),
        scope: session.scope.clone(),
        expires_at: now_secs() + state.config.flow.auth_code_ttl.as_secs(),
        used: false,
    });
    audit::emit(&AuditEvent::code_issued(&mapped.username, &session.client_id));

    let Ok(mut redirect_url) = Url::parse(&session.client_redirect_uri) else {
        return OAuthError::new(OAuthErrorCode::ServerError, "malformed client redirect_uri")
            .into_response();
    };
    redirect_url
        .query_pairs_mut()
        .append_pair("code", &auth_code)
        .append_pair("state", &session.client_state);

    Redirect::temporary(redirect_url.as_str()).into_response()
}

fn read_session_cookie(headers: &HeaderMap, secret: &[u8]) -> Option<String> {
    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let value = pair.strip_prefix("session=")?;
        SessionCookie::verify(value, secret)
    })
}

// ── /oauth2/token ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    code: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    code_verifier: Option<String>,
    refresh_token: Option<String>,
    device_code: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    resource: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

async fn token(State(state): State<Arc<FlowState>>, Form(req): Form<TokenRequest>) -> Response {
    match req.grant_type.as_str() {
        "authorization_code" => handle_authorization_code(&state, req).await,
        "refresh_token" => handle_refresh_token(&state, req).await,
        "client_credentials" => handle_client_credentials(&state, req).await,
        "urn:ietf:params:oauth:grant-type:device_code" => handle_device_code(&state, req).await,
        _ => OAuthError::new(OAuthErrorCode::UnsupportedGrantType, req.grant_type).into_response(),
    }
}

fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> bool {
    if method.eq_ignore_ascii_case("plain") {
        return verifier == challenge;
    }
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let computed = URL_SAFE_NO_PAD.encode(hasher.finalize());
    computed == challenge
}

async fn handle_authorization_code(state: &Arc<FlowState>, req: TokenRequest) -> Response {
    let (Some(code), Some(client_id)) = (req.code, req.client_id) else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing code or client_id")
            .into_response();
    };
    if !state.registry.authenticate(&client_id, req.client_secret.as_deref()) {
        return OAuthError::new(OAuthErrorCode::InvalidClient, "client authentication failed")
            .into_response();
    }

    let Some(record) = state.store.consume_auth_code(&code) else {
        audit::emit(&AuditEvent::denied("authorization code reuse or unknown code", None));
        return OAuthError::new(OAuthErrorCode::InvalidGrant, "invalid or expired code").into_response();
    };
    if record.client_id != client_id {
        return OAuthError::new(OAuthErrorCode::InvalidGrant, "client_id mismatch").into_response();
    }
    if Some(record.redirect_uri.as_str()) != req.redirect_uri.as_deref() {
        return OAuthError::new(OAuthErrorCode::InvalidGrant, "redirect_uri mismatch").into_response();
    }
    let Some(verifier) = req.code_verifier else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing code_verifier").into_response();
    };
    if !verify_pkce(&verifier, &record.code_challenge, &record.code_challenge_method) {
        audit::emit(&AuditEvent::denied("PKCE verification failed", None));
        return OAuthError::new(OAuthErrorCode::InvalidGrant, "PKCE verification failed")
            .into_response();
    }

    issue_tokens_for(
        state,
        &record.user_context,
        &record.client_id,
        &record.scope,
        record.resource.as_deref(),
        true,
    )
}

async fn handle_refresh_token(state: &Arc<FlowState>, req: TokenRequest) -> Response {
    let Some(token_value) = req.refresh_token else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing refresh_token").into_response();
    };
    let Some(record) = state.store.get_refresh_token(&token_value) else {
        return OAuthError::new(OAuthErrorCode::InvalidGrant, "invalid or expired refresh token")
            .into_response();
    };
    if let Some(client_id) = &req.client_id {
        if client_id != &record.client_id {
            return OAuthError::new(OAuthErrorCode::InvalidGrant, "client_id mismatch").into_response();
        }
    }

    let scopes = split_scope(&record.scope);
    let lifetime = state.config.token.default_lifetime.as_secs();
    let Ok((access_token, expires_in, jti)) = state.tokens.mint(MintRequest {
        sub: &record.user_context.username,
        user_id: record.user_context.user_id.as_deref(),
        email: &record.user_context.email,
        scopes: &scopes,
        groups: &record.user_context.groups,
        client_id: &record.client_id,
        resource: record.resource.as_deref(),
        lifetime_secs: lifetime,
    }) else {
        return OAuthError::new(OAuthErrorCode::ServerError, "token minting failed").into_response();
    };
    audit::emit(&AuditEvent::token_refreshed(&record.user_context.username, &record.client_id, &jti));

    // Refresh tokens are not rotated on use: this deployment's client
    // population doesn't depend on single-use refresh semantics, and
    // reissuing the same value avoids a lost-token race if the client
    // crashes after the response but before persisting a new one.
    Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in,
        scope: record.scope.clone(),
        refresh_token: Some(token_value),
    })
    .into_response()
}

async fn handle_client_credentials(state: &Arc<FlowState>, req: TokenRequest) -> Response {
    let Some(client_id) = req.client_id else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing client_id").into_response();
    };
    let Some(client) = state.registry.get(&client_id) else {
        return OAuthError::new(OAuthErrorCode::InvalidClient, "unknown client").into_response();
    };
    if !state.registry.authenticate(&client_id, req.client_secret.as_deref()) {
        return OAuthError::new(OAuthErrorCode::InvalidClient, "client authentication failed")
            .into_response();
    }

    let scope = req.scope.unwrap_or(client.scope);
    let scopes = split_scope(&scope);
    let lifetime = state.config.token.default_lifetime.as_secs();
    let Ok((access_token, expires_in, jti)) = state.tokens.mint(MintRequest {
        sub: &client_id,
        user_id: None,
        email: "",
        scopes: &scopes,
        groups: &[],
        client_id: &client_id,
        resource: req.resource.as_deref(),
        lifetime_secs: lifetime,
    }) else {
        return OAuthError::new(OAuthErrorCode::ServerError, "token minting failed").into_response();
    };
    audit::emit(&AuditEvent::token_issued(&client_id, &client_id, &jti, scopes.clone()));

    Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in,
        scope,
        refresh_token: None,
    })
    .into_response()
}

async fn handle_device_code(state: &Arc<FlowState>, req: TokenRequest) -> Response {
    let Some(device_code) = req.device_code else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing device_code").into_response();
    };
    let Some(record) = state.store.get_device_code(&device_code) else {
        return OAuthError::new(OAuthErrorCode::ExpiredToken, "device code expired or unknown")
            .into_response();
    };

    match record.status {
        DeviceStatus::Denied => {
            state.store.remove_device_code(&device_code);
            OAuthError::new(OAuthErrorCode::AccessDenied, "user denied the request").into_response()
        }
        DeviceStatus::Expired => {
            state.store.remove_device_code(&device_code);
            OAuthError::new(OAuthErrorCode::ExpiredToken, "device code expired").into_response()
        }
        DeviceStatus::Pending => {
            if let Some(last) = record.last_polled_at {
                if now_secs().saturating_sub(last) < record.interval {
                    state.store.touch_device_poll(&device_code);
                    return OAuthError::new(OAuthErrorCode::SlowDown, "polling too fast").into_response();
                }
            }
            state.store.touch_device_poll(&device_code);
            OAuthError::new(OAuthErrorCode::AuthorizationPending, "authorization pending").into_response()
        }
        DeviceStatus::Approved => {
            let Some(user_context) = record.user_context.clone() else {
                return OAuthError::new(OAuthErrorCode::ServerError, "approved device code missing identity")
                    .into_response();
            };
            state.store.remove_device_code(&device_code);
            issue_tokens_for(
                state,
                &user_context,
                &record.client_id,
                &record.scope,
                record.resource.as_deref(),
                false,
            )
        }
    }
}

fn issue_tokens_for(
    state: &Arc<FlowState>,
    user: &MappedUserContext,
    client_id: &str,
    scope: &str,
    resource: Option<&str>,
    issue_refresh: bool,
) -> Response {
    let scopes = split_scope(scope);
    let lifetime = state.config.token.default_lifetime.as_secs();
    let (access_token, expires_in, jti) = match state.tokens.mint(MintRequest {
        sub: &user.username,
        user_id: user.user_id.as_deref(),
        email: &user.email,
        scopes: &scopes,
        groups: &user.groups,
        client_id,
        resource,
        lifetime_secs: lifetime,
    }) {
        Ok(minted) => minted,
        Err(_) => {
            return OAuthError::new(OAuthErrorCode::ServerError, "token minting failed").into_response();
        }
    };
    audit::emit(&AuditEvent::token_issued(&user.username, client_id, &jti, scopes));

    let refresh_token = issue_refresh.then(|| {
        let value = FlowStore::generate_refresh_token();
        state.store.insert_refresh_token(RefreshTokenRecord {
            token: value.clone(),
            client_id: client_id.to_string(),
            user_context: user.clone(),
            scope: scope.to_string(),
            resource: resource.map(str::to_string),
            expires_at: now_secs() + state.config.flow.refresh_token_ttl.as_secs(),
            revoked: false,
        });
        value
    });

    Json(TokenResponse {
        access_token,
        token_type: "Bearer",
        expires_in,
        scope: scope.to_string(),
        refresh_token,
    })
    .into_response()
}

// ── /oauth2/register ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    client_name: String,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
    token_endpoint_auth_method: String,
    response_types: Vec<String>,
    client_id_issued_at: u64,
}

async fn register(
    State(state): State<Arc<FlowState>>,
    Json(req): Json<ClientRegistrationRequest>,
) -> Response {
    let client = state.registry.register(req, "mcp:read");
    audit::emit(&AuditEvent::client_registered(&client.client_id));
    let body = RegistrationResponse {
        client_id: client.client_id,
        client_secret: client.client_secret,
        client_name: client.client_name,
        redirect_uris: client.redirect_uris,
        grant_types: client.grant_types,
        token_endpoint_auth_method: client.token_endpoint_auth_method,
        response_types: client.response_types,
        client_id_issued_at: client.client_id_issued_at,
    };
    (StatusCode::CREATED, Json(body)).into_response()
}

// ── /oauth2/device/code ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeviceCodeRequest {
    client_id: String,
    #[serde(default)]
    scope: String,
    resource: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    expires_in: u64,
    interval: u64,
}

async fn device_code(State(state): State<Arc<FlowState>>, Form(req): Form<DeviceCodeRequest>) -> Response {
    if state.registry.get(&req.client_id).is_none() {
        return OAuthError::new(OAuthErrorCode::InvalidClient, "unknown client").into_response();
    }

    let (device_code, user_code) = FlowStore::generate_device_codes();
    let interval = state.config.flow.device_code_poll_interval.as_secs();
    let expiry = state.config.flow.device_code_expiry.as_secs();
    state.store.insert_device_code(DeviceCodeRecord {
        device_code: device_code.clone(),
        user_code: user_code.clone(),
        client_id: req.client_id,
        scope: req.scope,
        resource: req.resource,
        status: DeviceStatus::Pending,
        user_context: None,
        expires_at: now_secs() + expiry,
        interval,
        last_polled_at: None,
    });

    let verification_uri = state.config.auth_server.endpoint("/oauth2/device/verify");
    Json(DeviceCodeResponse {
        device_code,
        verification_uri_complete: format!("{verification_uri}?user_code={user_code}"),
        user_code,
        verification_uri,
        expires_in: expiry,
        interval,
    })
    .into_response()
}

// ── /oauth2/device/verify ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeviceVerifyQuery {
    user_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceVerifyResponse {
    user_code: String,
    client_id: String,
    scope: String,
    status: &'static str,
}

async fn device_verify(
    Query(query): Query<DeviceVerifyQuery>,
    State(state): State<Arc<FlowState>>,
) -> Response {
    let Some(user_code) = query.user_code else {
        return OAuthError::new(OAuthErrorCode::InvalidRequest, "missing user_code").into_response();
    };
    let Some(record) = state.store.get_device_code_by_user_code(&user_code) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown user_code"})))
            .into_response();
    };
    let status = match record.status {
        DeviceStatus::Pending => "pending",
        DeviceStatus::Approved => "approved",
        DeviceStatus::Denied => "denied",
        DeviceStatus::Expired => "expired",
    };
    Json(DeviceVerifyResponse {
        user_code: record.user_code,
        client_id: record.client_id,
        scope: record.scope,
        status,
    })
    .into_response()
}

// ── /oauth2/device/approve ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DeviceApproveRequest {
    user_code: String,
    #[serde(default = "default_approve")]
    approve: bool,
}

fn default_approve() -> bool {
    true
}

async fn approve_device(
    State(state): State<Arc<FlowState>>,
    headers: HeaderMap,
    Form(req): Form<DeviceApproveRequest>,
) -> Response {
    let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
    else {
        return unauthorized_response("approving the device code requires a logged-in user", None);
    };

    let user_context = match resolve_bearer_identity(&state, bearer).await {
        Ok(ctx) => ctx,
        Err(resp) => return resp,
    };

    let status = if req.approve { DeviceStatus::Approved } else { DeviceStatus::Denied };
    let identity = req.approve.then_some(user_context);
    let Some(record) = state.store.get_device_code_by_user_code(&req.user_code) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown user_code"})))
            .into_response();
    };
    let resolved = state.store.resolve_device_code(&req.user_code, status, identity);
    if !resolved {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown user_code"})))
            .into_response();
    }
    audit::emit(&AuditEvent::device_resolved(&record.client_id, req.approve));

    Json(serde_json::json!({"status": if req.approve { "approved" } else { "denied" }})).into_response()
}

async fn resolve_bearer_identity(
    state: &Arc<FlowState>,
    token: &str,
) -> Result<MappedUserContext, Response> {
    if state.tokens.looks_self_issued(token) {
        let claims = state
            .tokens
            .verify(token)
            .map_err(|_| unauthorized_response("invalid or expired token", None))?;
        return Ok(MappedUserContext {
            username: claims.sub,
            email: claims.email,
            name: None,
            idp_id: String::new(),
            groups: claims.groups,
            user_id: claims.user_id,
            scopes: split_scope(&claims.scope),
            provider: "self-issued".to_string(),
        });
    }

    for provider in state.providers.values() {
        if let Ok(claims) = provider.validate_idp_token(token).await {
            let mut mapped = provider.map_claims(Some(&claims), None);
            mapped.user_id = state.users.resolve(&mapped.idp_id, &mapped.username, &mapped.email).await;
            return Ok(mapped);
        }
    }
    Err(unauthorized_response("invalid token", None))
}

// ── /oauth2/logout/{provider} ────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct LogoutQuery {
    refresh_token: Option<String>,
    redirect_uri: Option<String>,
}

async fn logout(
    Path(_provider): Path<String>,
    Query(query): Query<LogoutQuery>,
    State(state): State<Arc<FlowState>>,
) -> Response {
    if let Some(token) = query.refresh_token {
        state.store.revoke_refresh_token(&token);
    }
    let target = query.redirect_uri.unwrap_or_else(|| "/".to_string());
    let mut response = Redirect::to(&target).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_static("session=; Path=/; Max-Age=0"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_pkce_s256_matches_recomputed_challenge() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());
        assert!(verify_pkce(verifier, &challenge, "S256"));
        assert!(!verify_pkce("wrong-verifier", &challenge, "S256"));
    }

    #[test]
    fn verify_pkce_plain_compares_directly() {
        assert!(verify_pkce("same-value", "same-value", "plain"));
        assert!(!verify_pkce("a", "b", "plain"));
    }
}
