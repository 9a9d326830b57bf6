//! Self-signed token service — mints and verifies HMAC-SHA256 access
//! tokens shared between the gateway and its downstream services.
//!
//! Grounded in the upstream gateway's OIDC verification pipeline
//! ([`super::oidc`]), inverted: instead of verifying an IdP-signed RS256
//! token against a JWKS, this module signs and verifies its own HS256
//! tokens with a single shared secret. The fixed `kid` in the header is
//! what [`TokenService::looks_self_issued`] uses to route `/validate`
//! between this verifier and the IdP adapters without inspecting `iss`.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::error::{Error, OAuthError, OAuthErrorCode, Result};

/// Claims carried by every gateway-minted access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the resolved username.
    pub sub: String,
    /// Internal user id, when resolved via the user-store collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Email at time of minting.
    #[serde(default)]
    pub email: String,
    /// Space-delimited granted scope string.
    #[serde(default)]
    pub scope: String,
    /// Group memberships at time of minting.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Client the token was minted for.
    pub client_id: String,
    /// Audience: a resource URL (RFC 8707) or the configured default audience.
    pub aud: String,
    /// Issuer.
    pub iss: String,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Unique token id, used for audit correlation.
    pub jti: String,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Parameters for minting a new access token.
pub struct MintRequest<'a> {
    /// Subject (username).
    pub sub: &'a str,
    /// Internal user id, if resolved.
    pub user_id: Option<&'a str>,
    /// Email.
    pub email: &'a str,
    /// Granted scopes, space-joined into the `scope` claim.
    pub scopes: &'a [String],
    /// Group memberships.
    pub groups: &'a [String],
    /// Client this token is minted for.
    pub client_id: &'a str,
    /// Audience: resource indicator, or `None` for the configured default.
    pub resource: Option<&'a str>,
    /// Lifetime in seconds.
    pub lifetime_secs: u64,
}

/// The HMAC-SHA256 self-signed token service.
pub struct TokenService {
    config: TokenConfig,
    rate_limiter: DashMap<String, (u32, u64)>,
}

impl TokenService {
    /// Build the service from configuration.
    #[must_use]
    pub fn new(config: TokenConfig) -> Self {
        Self {
            config,
            rate_limiter: DashMap::new(),
        }
    }

    /// Mint a new access token.
    ///
    /// # Errors
    ///
    /// Returns an error if JWT encoding fails.
    pub fn mint(&self, req: MintRequest<'_>) -> Result<(String, u64, String)> {
        let iat = now_secs();
        let exp = iat + req.lifetime_secs;
        let jti = Uuid::new_v4().to_string();
        let aud = req
            .resource
            .map(str::to_string)
            .unwrap_or_else(|| self.config.audience.clone());

        let claims = Claims {
            sub: req.sub.to_string(),
            user_id: req.user_id.map(str::to_string),
            email: req.email.to_string(),
            scope: req.scopes.join(" "),
            groups: req.groups.to_vec(),
            client_id: req.client_id.to_string(),
            aud,
            iss: self.config.issuer.clone(),
            iat,
            exp,
            jti: jti.clone(),
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.config.self_signed_kid.clone());

        let token = encode(
            &header,
            &claims,
            &EncodingKey::from_secret(self.config.secret_key.as_bytes()),
        )
        .map_err(Error::Jwt)?;

        Ok((token, req.lifetime_secs, jti))
    }

    /// Inspect (without verifying) whether a JWT's header `kid` marks it as
    /// self-issued, for `/validate`'s routing decision.
    #[must_use]
    pub fn looks_self_issued(&self, token: &str) -> bool {
        decode_header(token)
            .ok()
            .and_then(|h| h.kid)
            .is_some_and(|kid| kid == self.config.self_signed_kid)
    }

    /// Verify a self-signed token and return its claims.
    ///
    /// Audience verification is skipped when `aud` looks like a resource URL
    /// (RFC 8707); the configured default audience is otherwise required.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::InvalidGrant`]-shaped errors on expiry or
    /// signature mismatch, surfaced as [`Error::Jwt`].
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.clock_skew_leeway.as_secs();
        validation.validate_aud = false;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.secret_key.as_bytes()),
            &validation,
        )
        .map_err(Error::Jwt)?;

        if !looks_like_resource_url(&data.claims.aud) && data.claims.aud != self.config.audience {
            return Err(Error::OAuth(OAuthError::new(
                OAuthErrorCode::InvalidGrant,
                "token audience mismatch",
            )));
        }

        Ok(data.claims)
    }

    /// Check and record a mint attempt against the per-user hourly limit.
    /// Returns `false` if the caller is over the limit.
    #[must_use]
    pub fn check_rate_limit(&self, user_key: &str) -> bool {
        let limit = self.config.max_tokens_per_user_per_hour;
        if limit == 0 {
            return true;
        }
        let now = now_secs();
        let mut entry = self
            .rate_limiter
            .entry(user_key.to_string())
            .or_insert((0, now));

        if now.saturating_sub(entry.1) >= 3600 {
            *entry = (0, now);
        }

        if entry.0 >= limit {
            return false;
        }
        entry.0 += 1;
        true
    }
}

fn looks_like_resource_url(aud: &str) -> bool {
    aud.starts_with("http://") || aud.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(TokenConfig {
            secret_key: "test-secret-key-0123456789abcdef".to_string(),
            issuer: "https://gateway.example.com".to_string(),
            audience: "mcp-gateway".to_string(),
            self_signed_kid: "mcpgw-self-signed".to_string(),
            default_lifetime: std::time::Duration::from_secs(3600),
            default_user_lifetime: std::time::Duration::from_secs(8 * 3600),
            max_user_lifetime: std::time::Duration::from_secs(24 * 3600),
            clock_skew_leeway: std::time::Duration::from_secs(30),
            max_tokens_per_user_per_hour: 2,
        })
    }

    fn mint_request<'a>(scopes: &'a [String], groups: &'a [String]) -> MintRequest<'a> {
        MintRequest {
            sub: "alice",
            user_id: Some("usr_1"),
            email: "alice@example.com",
            scopes,
            groups,
            client_id: "client-1",
            resource: None,
            lifetime_secs: 3600,
        }
    }

    #[test]
    fn mint_then_verify_round_trips_claims() {
        let svc = service();
        let scopes = vec!["mcp:read".to_string()];
        let groups = vec!["dev".to_string()];
        let (token, expires_in, jti) = svc.mint(mint_request(&scopes, &groups)).unwrap();
        assert_eq!(expires_in, 3600);

        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.scope, "mcp:read");
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.aud, "mcp-gateway");
    }

    #[test]
    fn looks_self_issued_detects_the_fixed_kid() {
        let svc = service();
        let scopes = vec![];
        let groups = vec![];
        let (token, ..) = svc.mint(mint_request(&scopes, &groups)).unwrap();
        assert!(svc.looks_self_issued(&token));
        assert!(!svc.looks_self_issued("not-a-jwt"));
    }

    #[test]
    fn resource_audience_skips_default_audience_check() {
        let svc = service();
        let scopes = vec![];
        let groups = vec![];
        let mut req = mint_request(&scopes, &groups);
        req.resource = Some("https://mcp.example.com/servers/brave");
        let (token, ..) = svc.mint(req).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.aud, "https://mcp.example.com/servers/brave");
    }

    #[test]
    fn rate_limit_blocks_after_configured_count() {
        let svc = service();
        assert!(svc.check_rate_limit("alice"));
        assert!(svc.check_rate_limit("alice"));
        assert!(!svc.check_rate_limit("alice"));
    }
}
