//! Error types for the gateway's identity, authorization and discovery plane.

use std::io;

use axum::http::{StatusCode, header::CONNECTION};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level crate error.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// RFC 6749 OAuth protocol error
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// Discovery subsystem error
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Authentication failed (401)
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization failed (403)
    #[error("Authorization failed: {0}")]
    Forbidden(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JWT encode/decode error
    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error — never exposed to clients verbatim
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Self::OAuth(e) => e.into_response(),
            Self::Discovery(e) => e.into_response(),
            Self::Unauthorized(msg) => unauthorized_response(&msg, None),
            Self::Forbidden(msg) => problem_response(StatusCode::FORBIDDEN, &msg),
            Self::RateLimited(msg) => problem_response(StatusCode::TOO_MANY_REQUESTS, &msg),
            Self::Config(msg) => problem_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
            other => {
                tracing::error!(error = %other, "internal error");
                problem_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ProblemBody<'a> {
    error: &'a str,
}

fn problem_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(ProblemBody { error: message })).into_response()
}

/// Build a 401 with `WWW-Authenticate: Bearer`, optionally carrying
/// `resource_metadata` so the client knows where to re-discover the
/// protected-resource document.
pub fn unauthorized_response(message: &str, resource_metadata: Option<&str>) -> Response {
    let challenge = match resource_metadata {
        Some(url) => format!(r#"Bearer realm="mcpgw", resource_metadata="{url}""#),
        None => "Bearer realm=\"mcpgw\"".to_string(),
    };
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", challenge)],
        [(CONNECTION, "close")],
        axum::Json(ProblemBody { error: message }),
    )
        .into_response()
}

/// RFC 6749 `{error, error_description}` error codes used by the OAuth
/// surface (`/oauth2/*`). Returned verbatim in the response body — never
/// wrapped in the generic problem shape used elsewhere.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorCode {
    /// Malformed or missing request parameter.
    #[error("invalid_request")]
    InvalidRequest,
    /// Unknown or unauthenticated client.
    #[error("invalid_client")]
    InvalidClient,
    /// Invalid/expired/reused authorization grant (code, PKCE mismatch, device code).
    #[error("invalid_grant")]
    InvalidGrant,
    /// `grant_type` is not one this server implements.
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    /// Requested scope is invalid or exceeds what the client may request.
    #[error("invalid_scope")]
    InvalidScope,
    /// Device flow: user has not yet approved.
    #[error("authorization_pending")]
    AuthorizationPending,
    /// Device flow: user denied the request.
    #[error("access_denied")]
    AccessDenied,
    /// Device/auth code has expired.
    #[error("expired_token")]
    ExpiredToken,
    /// Client is polling faster than the advertised interval.
    #[error("slow_down")]
    SlowDown,
    /// Unexpected server-side failure.
    #[error("server_error")]
    ServerError,
}

/// An OAuth protocol error carrying the RFC 6749 code plus a human
/// description. HTTP status is derived from the code (`400` for all
/// protocol errors; device-flow polling states are also `400` per RFC 8628).
#[derive(Error, Debug)]
#[error("{code}: {description}")]
pub struct OAuthError {
    /// RFC 6749 error code.
    pub code: OAuthErrorCode,
    /// Human-readable description (never leaks internal detail).
    pub description: String,
}

impl OAuthError {
    /// Construct an OAuth error.
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    error_description: String,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = match self.code {
            OAuthErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = OAuthErrorBody {
            error: match self.code {
                OAuthErrorCode::InvalidRequest => "invalid_request",
                OAuthErrorCode::InvalidClient => "invalid_client",
                OAuthErrorCode::InvalidGrant => "invalid_grant",
                OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
                OAuthErrorCode::InvalidScope => "invalid_scope",
                OAuthErrorCode::AuthorizationPending => "authorization_pending",
                OAuthErrorCode::AccessDenied => "access_denied",
                OAuthErrorCode::ExpiredToken => "expired_token",
                OAuthErrorCode::SlowDown => "slow_down",
                OAuthErrorCode::ServerError => "server_error",
            },
            error_description: self.description,
        };
        (status, axum::Json(body)).into_response()
    }
}

/// Discovery subsystem error.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The vector store (or embedding provider) is unreachable.
    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),

    /// A caller attempted to patch a field outside the metadata-safe set
    /// via the fast-path `update_metadata`/`batch_update_properties`.
    #[error("field '{0}' is not metadata-safe and requires re-embedding")]
    NotMetadataSafe(String),

    /// Document not found.
    #[error("document not found: {0}")]
    NotFound(String),

    /// Invalid query (length, `max_results`, malformed filter, ...).
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl IntoResponse for DiscoveryError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotMetadataSafe(_) | Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        };
        problem_response(status, &self.to_string())
    }
}

/// Standard JSON-RPC-style error codes, retained for any downstream
/// component that still speaks the MCP JSON-RPC error shape.
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
}
