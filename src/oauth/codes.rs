//! Authorization-grant tables: auth codes, device codes and refresh tokens.
//!
//! Each table is a `DashMap` keyed by the credential clients present back
//! to the token endpoint, mirroring the two-index bearer/jti pattern used
//! for temporary gateway tokens elsewhere in this crate: one map for direct
//! lookup by the credential value, lazy-evicted on access, plus a
//! background reaper for anything nobody ever redeems.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::providers::MappedUserContext;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_token(prefix: &str) -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("{prefix}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// An issued authorization code, redeemable once at `/oauth2/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeRecord {
    /// The code value itself.
    pub code: String,
    /// Client this code was issued to.
    pub client_id: String,
    /// Identity resolved during the IdP round trip.
    pub user_context: MappedUserContext,
    /// `redirect_uri` presented at `/oauth2/authorize`, re-checked at exchange.
    pub redirect_uri: String,
    /// PKCE `code_challenge`.
    pub code_challenge: String,
    /// PKCE `code_challenge_method` (`S256` or `plain`).
    pub code_challenge_method: String,
    /// RFC 8707 resource indicator, if any.
    pub resource: Option<String>,
    /// Requested scope string.
    pub scope: String,
    /// Unix-seconds expiry.
    pub expires_at: u64,
    /// Set once the code has been redeemed; a second redemption is a reuse
    /// attack and revokes every token previously issued from this code.
    pub used: bool,
}

impl AuthCodeRecord {
    #[must_use]
    fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

/// Device-flow polling state (RFC 8628).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Waiting on the user to visit the verification URL.
    Pending,
    /// User approved; `user_context` is populated.
    Approved,
    /// User explicitly denied.
    Denied,
    /// Past its expiry without resolution.
    Expired,
}

/// A device-authorization-grant record, keyed by `device_code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeRecord {
    /// Long, unguessable code the polling client holds.
    pub device_code: String,
    /// Short code the user types into the verification page.
    pub user_code: String,
    /// Client this grant was issued to.
    pub client_id: String,
    /// Requested scope string.
    pub scope: String,
    /// RFC 8707 resource indicator, if any.
    pub resource: Option<String>,
    /// Current approval state.
    pub status: DeviceStatus,
    /// Identity resolved once a user approves via the IdP.
    pub user_context: Option<MappedUserContext>,
    /// Unix-seconds expiry.
    pub expires_at: u64,
    /// Minimum seconds between polls (RFC 8628 `interval`).
    pub interval: u64,
    /// Last time the polling client hit `/oauth2/token`; used to enforce
    /// `slow_down` when a client ignores `interval`.
    pub last_polled_at: Option<u64>,
}

impl DeviceCodeRecord {
    #[must_use]
    fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

/// An issued refresh token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// The refresh token value.
    pub token: String,
    /// Client this token was issued to.
    pub client_id: String,
    /// Identity it was issued for.
    pub user_context: MappedUserContext,
    /// Scope string carried forward to refreshed access tokens.
    pub scope: String,
    /// RFC 8707 resource indicator, if any.
    pub resource: Option<String>,
    /// Unix-seconds expiry.
    pub expires_at: u64,
    /// Set on explicit revocation or reuse detection.
    pub revoked: bool,
}

impl RefreshTokenRecord {
    #[must_use]
    fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

/// The three grant tables backing the flow engine.
///
/// Same-value reuse is not rotated by default: redeeming a refresh token
/// reissues the *same* token value rather than minting a new one, since
/// nothing in this deployment's client population depends on rotation.
pub struct FlowStore {
    auth_codes: DashMap<String, AuthCodeRecord>,
    device_codes_by_device: DashMap<String, DeviceCodeRecord>,
    device_codes_by_user_code: DashMap<String, String>,
    refresh_tokens: DashMap<String, RefreshTokenRecord>,
}

impl FlowStore {
    /// Create empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            auth_codes: DashMap::new(),
            device_codes_by_device: DashMap::new(),
            device_codes_by_user_code: DashMap::new(),
            refresh_tokens: DashMap::new(),
        }
    }

    /// Generate an opaque authorization code value.
    #[must_use]
    pub fn generate_auth_code() -> String {
        random_token("ac_")
    }

    /// Insert a freshly issued authorization code.
    pub fn insert_auth_code(&self, record: AuthCodeRecord) {
        self.auth_codes.insert(record.code.clone(), record);
    }

    /// Redeem an authorization code. Returns `None` if absent, expired, or
    /// already used. A reuse attempt additionally revokes nothing here
    /// directly — the caller is responsible for fanning out revocation of
    /// anything already issued from this code, since that spans the token
    /// tables owned by the key server, not this store.
    pub fn consume_auth_code(&self, code: &str) -> Option<AuthCodeRecord> {
        let mut entry = self.auth_codes.get_mut(code)?;
        if entry.used {
            drop(entry);
            self.auth_codes.remove(code);
            return None;
        }
        if entry.is_expired() {
            return None;
        }
        entry.used = true;
        Some(entry.clone())
    }

    /// Generate a device-code / user-code pair. The user code draws from an
    /// alphabet that excludes `0`/`O` and `1`/`I`, which are hard to tell
    /// apart when read off a screen and typed on another device.
    #[must_use]
    pub fn generate_device_codes() -> (String, String) {
        const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let device_code = random_token("dc_");
        let mut rng = rand::rng();
        let chars: String = (0..8)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        let user_code = format!("{}-{}", &chars[0..4], &chars[4..8]);
        (device_code, user_code)
    }

    /// Insert a freshly issued device-authorization record.
    pub fn insert_device_code(&self, record: DeviceCodeRecord) {
        self.device_codes_by_user_code
            .insert(record.user_code.clone(), record.device_code.clone());
        self.device_codes_by_device
            .insert(record.device_code.clone(), record);
    }

    /// Look up a device-code record by the long device code, without
    /// consuming it (used by repeated polling).
    #[must_use]
    pub fn get_device_code(&self, device_code: &str) -> Option<DeviceCodeRecord> {
        let entry = self.device_codes_by_device.get(device_code)?;
        if entry.is_expired() {
            return None;
        }
        Some(entry.clone())
    }

    /// Look up a device-code record by the short user code, for the
    /// verification-page flow.
    #[must_use]
    pub fn get_device_code_by_user_code(&self, user_code: &str) -> Option<DeviceCodeRecord> {
        let device_code = self.device_codes_by_user_code.get(user_code)?.clone();
        self.get_device_code(&device_code)
    }

    /// Record the polling client's most recent hit, for `slow_down` enforcement.
    pub fn touch_device_poll(&self, device_code: &str) {
        if let Some(mut entry) = self.device_codes_by_device.get_mut(device_code) {
            entry.last_polled_at = Some(now_secs());
        }
    }

    /// Resolve a device code to an approved or denied terminal state.
    pub fn resolve_device_code(
        &self,
        user_code: &str,
        status: DeviceStatus,
        user_context: Option<MappedUserContext>,
    ) -> bool {
        let Some(device_code) = self.device_codes_by_user_code.get(user_code).map(|v| v.clone())
        else {
            return false;
        };
        let Some(mut entry) = self.device_codes_by_device.get_mut(&device_code) else {
            return false;
        };
        entry.status = status;
        entry.user_context = user_context;
        true
    }

    /// Remove a device-code record once redeemed at the token endpoint.
    pub fn remove_device_code(&self, device_code: &str) {
        if let Some((_, record)) = self.device_codes_by_device.remove(device_code) {
            self.device_codes_by_user_code.remove(&record.user_code);
        }
    }

    /// Insert a refresh token.
    pub fn insert_refresh_token(&self, record: RefreshTokenRecord) {
        self.refresh_tokens.insert(record.token.clone(), record);
    }

    /// Generate an opaque refresh-token value.
    #[must_use]
    pub fn generate_refresh_token() -> String {
        random_token("rt_")
    }

    /// Look up a refresh token without consuming it.
    #[must_use]
    pub fn get_refresh_token(&self, token: &str) -> Option<RefreshTokenRecord> {
        let entry = self.refresh_tokens.get(token)?;
        if entry.is_expired() || entry.revoked {
            return None;
        }
        Some(entry.clone())
    }

    /// Revoke a refresh token, e.g. on logout or reuse detection.
    pub fn revoke_refresh_token(&self, token: &str) -> bool {
        if let Some(mut entry) = self.refresh_tokens.get_mut(token) {
            entry.revoked = true;
            true
        } else {
            false
        }
    }

    /// Sweep every table for expired entries. Called periodically by the
    /// background reaper task; returns the total number removed.
    pub fn reap_expired(&self) -> usize {
        let mut count = 0;

        let expired_codes: Vec<String> = self
            .auth_codes
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for code in expired_codes {
            self.auth_codes.remove(&code);
            count += 1;
        }

        let expired_devices: Vec<String> = self
            .device_codes_by_device
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for device_code in expired_devices {
            self.remove_device_code(&device_code);
            count += 1;
        }

        let expired_refresh: Vec<String> = self
            .refresh_tokens
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        for token in expired_refresh {
            self.refresh_tokens.remove(&token);
            count += 1;
        }

        count
    }
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> MappedUserContext {
        MappedUserContext {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            name: None,
            idp_id: "sub-1".to_string(),
            groups: vec![],
            user_id: Some("usr_1".to_string()),
            scopes: vec![],
            provider: "keycloak".to_string(),
        }
    }

    #[test]
    fn auth_code_is_single_use() {
        let store = FlowStore::new();
        let code = FlowStore::generate_auth_code();
        store.insert_auth_code(AuthCodeRecord {
            code: code.clone(),
            client_id: "client-1".to_string(),
            user_context: user(),
            redirect_uri: "https://client.example.com/cb".to_string(),
            code_challenge: "challenge".to_string(),
            code_challenge_method: "S256".to_string(),
            resource: None,
            scope: "mcp:read".to_string(),
            expires_at: now_secs() + 600,
            used: false,
        });
        assert!(store.consume_auth_code(&code).is_some());
        assert!(store.consume_auth_code(&code).is_none());
    }

    #[test]
    fn device_code_round_trip_via_user_code() {
        let store = FlowStore::new();
        let (device_code, user_code) = FlowStore::generate_device_codes();
        store.insert_device_code(DeviceCodeRecord {
            device_code: device_code.clone(),
            user_code: user_code.clone(),
            client_id: "client-1".to_string(),
            scope: "mcp:read".to_string(),
            resource: None,
            status: DeviceStatus::Pending,
            user_context: None,
            expires_at: now_secs() + 600,
            interval: 5,
            last_polled_at: None,
        });

        assert!(store.resolve_device_code(&user_code, DeviceStatus::Approved, Some(user())));
        let record = store.get_device_code(&device_code).unwrap();
        assert_eq!(record.status, DeviceStatus::Approved);
        assert!(record.user_context.is_some());
    }

    #[test]
    fn reap_expired_removes_stale_entries_from_every_table() {
        let store = FlowStore::new();
        store.insert_auth_code(AuthCodeRecord {
            code: "expired".to_string(),
            client_id: "client-1".to_string(),
            user_context: user(),
            redirect_uri: "https://client.example.com/cb".to_string(),
            code_challenge: "x".to_string(),
            code_challenge_method: "S256".to_string(),
            resource: None,
            scope: "mcp:read".to_string(),
            expires_at: 0,
            used: false,
        });
        assert_eq!(store.reap_expired(), 1);
        assert!(store.consume_auth_code("expired").is_none());
    }

    #[test]
    fn revoked_refresh_token_is_unusable() {
        let store = FlowStore::new();
        let token = FlowStore::generate_refresh_token();
        store.insert_refresh_token(RefreshTokenRecord {
            token: token.clone(),
            client_id: "client-1".to_string(),
            user_context: user(),
            scope: "mcp:read".to_string(),
            resource: None,
            expires_at: now_secs() + 3600,
            revoked: false,
        });
        assert!(store.get_refresh_token(&token).is_some());
        assert!(store.revoke_refresh_token(&token));
        assert!(store.get_refresh_token(&token).is_none());
    }
}
