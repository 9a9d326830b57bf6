//! Temporary OAuth session cookie.
//!
//! A login round-trip to an upstream IdP needs somewhere to park
//! `redirect_uri`, PKCE verifier and the chosen provider between
//! `/oauth2/login/{provider}` and `/oauth2/callback/{provider}`. The gateway
//! keeps that state itself rather than trust the browser with it: the cookie
//! only carries an opaque session id, and the payload lives server-side,
//! signed with the same HMAC key as the session id so a forged id cannot be
//! swapped for another session's payload.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// An in-flight login attempt's state, keyed by a signed session id and
/// handed to the browser as a cookie value. Everything the callback handler
/// needs to finish the round trip and mint the client-facing authorization
/// code lives here, server-side — the cookie itself carries nothing but the
/// signed id.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    /// Random session identifier.
    pub session_id: String,
    /// Provider this login is for.
    pub provider: String,
    /// Client that initiated the authorization request.
    pub client_id: String,
    /// The client's own `redirect_uri`, to send the browser back to once an
    /// authorization code has been minted.
    pub client_redirect_uri: String,
    /// The client's `state` parameter, echoed back unchanged.
    pub client_state: String,
    /// PKCE `code_challenge` presented by the client.
    pub code_challenge: String,
    /// PKCE `code_challenge_method` (`S256` or `plain`).
    pub code_challenge_method: String,
    /// Requested scope string.
    pub scope: String,
    /// RFC 8707 resource indicator, if any.
    pub resource: Option<String>,
    /// CSRF token for the upstream IdP round trip, independent of the
    /// client's own `state` — a forged client `state` cannot be replayed
    /// against the IdP leg and vice versa.
    pub idp_state: String,
    /// Unix seconds this session was created.
    pub created_at: u64,
}

impl SessionCookie {
    /// Start a new session for a login attempt.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        client_id: impl Into<String>,
        client_redirect_uri: impl Into<String>,
        client_state: impl Into<String>,
        code_challenge: impl Into<String>,
        code_challenge_method: impl Into<String>,
        scope: impl Into<String>,
        resource: Option<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            client_id: client_id.into(),
            client_redirect_uri: client_redirect_uri.into(),
            client_state: client_state.into(),
            code_challenge: code_challenge.into(),
            code_challenge_method: code_challenge_method.into(),
            scope: scope.into(),
            resource,
            idp_state: Uuid::new_v4().simple().to_string(),
            created_at: now_secs(),
        }
    }

    /// Whether this session has outlived `ttl_secs`.
    #[must_use]
    pub fn is_expired(&self, ttl_secs: u64) -> bool {
        now_secs().saturating_sub(self.created_at) > ttl_secs
    }

    /// Sign the cookie's `session_id` with `secret`, producing the value to
    /// hand to the browser. The signature binds the id so a tampered cookie
    /// cannot select a different session's server-side state.
    #[must_use]
    pub fn sign(session_id: &str, secret: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(session_id.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{session_id}.{tag}")
    }

    /// Verify a cookie value produced by [`sign`](Self::sign) and return the
    /// session id if the signature matches.
    #[must_use]
    pub fn verify(cookie_value: &str, secret: &[u8]) -> Option<String> {
        let (session_id, tag) = cookie_value.split_once('.')?;
        let expected = Self::sign(session_id, secret);
        let (_, expected_tag) = expected.split_once('.')?;
        let matches: bool = tag.as_bytes().ct_eq(expected_tag.as_bytes()).into();
        matches.then(|| session_id.to_string())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trips() {
        let secret = b"test-secret-key-0123456789abcdef";
        let signed = SessionCookie::sign("sess-1", secret);
        assert_eq!(SessionCookie::verify(&signed, secret), Some("sess-1".to_string()));
    }

    #[test]
    fn verify_rejects_tampered_session_id() {
        let secret = b"test-secret-key-0123456789abcdef";
        let signed = SessionCookie::sign("sess-1", secret);
        let (_, tag) = signed.split_once('.').unwrap();
        let forged = format!("sess-2.{tag}");
        assert_eq!(SessionCookie::verify(&forged, secret), None);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let signed = SessionCookie::sign("sess-1", b"secret-one-0123456789abcdef");
        assert_eq!(SessionCookie::verify(&signed, b"secret-two-0123456789abcdef"), None);
    }

    #[test]
    fn is_expired_respects_ttl() {
        let mut cookie = SessionCookie::new(
            "keycloak",
            "client-1",
            "https://client.example.com/cb",
            "client-state",
            "challenge",
            "S256",
            "mcp:read",
            None,
        );
        assert!(!cookie.is_expired(600));
        cookie.created_at = cookie.created_at.saturating_sub(3600);
        assert!(cookie.is_expired(600));
    }
}
