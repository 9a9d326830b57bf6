//! Audit logging for OAuth flow and token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator (Loki, CloudWatch,
//! Datadog). The log line never carries the raw username — only its hash —
//! nor any token or secret value, matching the crate-wide logging policy.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `oauth.code_issued` | An authorization code is minted after IdP callback |
//! | `oauth.token_issued` | An access token is minted from any grant |
//! | `oauth.token_refreshed` | An access token is reissued from a refresh token |
//! | `oauth.device_resolved` | A device code is approved or denied |
//! | `oauth.client_registered` | A client completes dynamic registration |
//! | `oauth.denied` | A grant, validation, or policy check failed |
//! | `oauth.invalid` | A credential was structurally invalid |

use std::net::IpAddr;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Structured audit event emitted for every OAuth lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"oauth.token_issued"`).
    pub event: &'static str,
    /// SHA-256 hash of the subject's username, when known. Never the raw value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username_hash: Option<String>,
    /// Client id associated with the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// JTI of the affected access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Granted scopes (for issuance events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Client IP address (when available).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Human-readable reason for denial or error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn hash_username(username: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuditEvent {
    /// Construct an `oauth.code_issued` event.
    #[must_use]
    pub fn code_issued(username: &str, client_id: &str) -> Self {
        Self {
            event: "oauth.code_issued",
            username_hash: Some(hash_username(username)),
            client_id: Some(client_id.to_string()),
            token_jti: None,
            scopes: None,
            client_ip: None,
            reason: None,
        }
    }

    /// Construct an `oauth.token_issued` event.
    #[must_use]
    pub fn token_issued(username: &str, client_id: &str, jti: &str, scopes: Vec<String>) -> Self {
        Self {
            event: "oauth.token_issued",
            username_hash: Some(hash_username(username)),
            client_id: Some(client_id.to_string()),
            token_jti: Some(jti.to_string()),
            scopes: Some(scopes),
            client_ip: None,
            reason: None,
        }
    }

    /// Construct an `oauth.token_refreshed` event.
    #[must_use]
    pub fn token_refreshed(username: &str, client_id: &str, jti: &str) -> Self {
        Self {
            event: "oauth.token_refreshed",
            username_hash: Some(hash_username(username)),
            client_id: Some(client_id.to_string()),
            token_jti: Some(jti.to_string()),
            scopes: None,
            client_ip: None,
            reason: None,
        }
    }

    /// Construct an `oauth.device_resolved` event.
    #[must_use]
    pub fn device_resolved(client_id: &str, approved: bool) -> Self {
        Self {
            event: "oauth.device_resolved",
            username_hash: None,
            client_id: Some(client_id.to_string()),
            token_jti: None,
            scopes: None,
            client_ip: None,
            reason: Some(if approved { "approved".to_string() } else { "denied".to_string() }),
        }
    }

    /// Construct an `oauth.client_registered` event.
    #[must_use]
    pub fn client_registered(client_id: &str) -> Self {
        Self {
            event: "oauth.client_registered",
            username_hash: None,
            client_id: Some(client_id.to_string()),
            token_jti: None,
            scopes: None,
            client_ip: None,
            reason: None,
        }
    }

    /// Construct an `oauth.denied` event (grant, validation, or policy failure).
    #[must_use]
    pub fn denied(reason: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "oauth.denied",
            username_hash: None,
            client_id: None,
            token_jti: None,
            scopes: None,
            client_ip,
            reason: Some(reason.into()),
        }
    }

    /// Construct an `oauth.invalid` event.
    #[must_use]
    pub fn invalid(reason: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        Self {
            event: "oauth.invalid",
            username_hash: None,
            client_id: None,
            token_jti: None,
            scopes: None,
            client_ip,
            reason: Some(reason.into()),
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO key_server::audit audit={"event":"oauth.token_issued",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "oauth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_issued_event_has_correct_type_and_hashes_username() {
        let event = AuditEvent::token_issued("alice", "client-1", "jti-1", vec!["mcp:read".to_string()]);
        assert_eq!(event.event, "oauth.token_issued");
        assert_ne!(event.username_hash.as_deref(), Some("alice"));
        assert_eq!(event.username_hash.unwrap().len(), 64);
    }

    #[test]
    fn denied_event_contains_reason() {
        let event = AuditEvent::denied("policy not matched", None);
        assert_eq!(event.event, "oauth.denied");
        assert_eq!(event.reason.as_deref(), Some("policy not matched"));
    }

    #[test]
    fn device_resolved_reflects_approval_state() {
        let approved = AuditEvent::device_resolved("client-1", true);
        assert_eq!(approved.reason.as_deref(), Some("approved"));
        let denied = AuditEvent::device_resolved("client-1", false);
        assert_eq!(denied.reason.as_deref(), Some("denied"));
    }

    #[test]
    fn events_serialize_to_json() {
        let events = vec![
            AuditEvent::code_issued("alice", "client-1"),
            AuditEvent::token_issued("alice", "client-1", "jti-1", vec![]),
            AuditEvent::token_refreshed("alice", "client-1", "jti-2"),
            AuditEvent::device_resolved("client-1", true),
            AuditEvent::client_registered("client-1"),
            AuditEvent::denied("test", None),
            AuditEvent::invalid("bad token", None),
        ];
        for event in events {
            assert!(serde_json::to_string(&event).is_ok());
        }
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::client_registered("client-1"));
    }
}
