//! Dynamic client registration (RFC 7591) and the registered-client table.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A client registered with the gateway's authorization server, either
/// statically configured or created via `POST /oauth2/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    /// Assigned client identifier.
    pub client_id: String,
    /// Assigned client secret. `None` for public clients (PKCE-only).
    pub client_secret: Option<String>,
    /// Human-readable name, as submitted at registration.
    pub client_name: String,
    /// Registered redirect URIs; the token endpoint rejects any exchange
    /// whose `redirect_uri` isn't byte-for-byte one of these.
    pub redirect_uris: Vec<String>,
    /// Grant types this client may use.
    pub grant_types: Vec<String>,
    /// `token_endpoint_auth_method`: `client_secret_post` or `none`.
    pub token_endpoint_auth_method: String,
    /// Response types this client may request.
    pub response_types: Vec<String>,
    /// Space-delimited scope string the client may request.
    pub scope: String,
    /// Unix-seconds registration time.
    pub client_id_issued_at: u64,
}

/// Submitted registration request body (RFC 7591 `client-metadata`).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRegistrationRequest {
    /// Client display name.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Redirect URIs the client will use.
    pub redirect_uris: Vec<String>,
    /// Requested grant types; defaults to authorization_code plus
    /// device_code if omitted.
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<String>,
    /// Requested auth method; defaults to `client_secret_post`.
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,
    /// Requested response types; defaults to `["code"]`.
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    /// Requested scope string.
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_client_name() -> String {
    "unnamed-client".to_string()
}

fn default_grant_types() -> Vec<String> {
    vec![
        "authorization_code".to_string(),
        "urn:ietf:params:oauth:grant-type:device_code".to_string(),
    ]
}

fn default_auth_method() -> String {
    "client_secret_post".to_string()
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

/// The registered-client table. Statically configured clients (from the
/// scope policy file or environment) and dynamically registered ones share
/// the same map — nothing downstream distinguishes their provenance.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client and return its assigned credentials.
    pub fn register(&self, request: ClientRegistrationRequest, default_scope: &str) -> RegisteredClient {
        let client_id = format!("mcpgw_{}", Uuid::new_v4().simple());
        let client_secret = if request.token_endpoint_auth_method == "client_secret_post" {
            Some(format!("cs_{}", Uuid::new_v4().simple()))
        } else {
            None
        };

        let client = RegisteredClient {
            client_id: client_id.clone(),
            client_secret,
            client_name: request.client_name,
            redirect_uris: request.redirect_uris,
            grant_types: request.grant_types,
            token_endpoint_auth_method: request.token_endpoint_auth_method,
            response_types: request.response_types,
            scope: request.scope.unwrap_or_else(|| default_scope.to_string()),
            client_id_issued_at: now_secs(),
        };

        self.clients.insert(client_id, client.clone());
        client
    }

    /// Insert or replace a statically configured client.
    pub fn insert(&self, client: RegisteredClient) {
        self.clients.insert(client.client_id.clone(), client);
    }

    /// Look up a client by id.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.get(client_id).map(|e| e.clone())
    }

    /// Whether `redirect_uri` is one of `client_id`'s registered URIs.
    /// Exact match only, per RFC 6749 §3.1.2.3 — no prefix or wildcard
    /// matching, to close the open-redirect class of authorization-code
    /// interception.
    #[must_use]
    pub fn redirect_uri_is_registered(&self, client_id: &str, redirect_uri: &str) -> bool {
        self.get(client_id)
            .is_some_and(|c| c.redirect_uris.iter().any(|u| u == redirect_uri))
    }

    /// Authenticate a confidential client's credentials. Public clients
    /// (`token_endpoint_auth_method == "none"`) always pass this check since
    /// they authenticate via PKCE instead.
    #[must_use]
    pub fn authenticate(&self, client_id: &str, client_secret: Option<&str>) -> bool {
        let Some(client) = self.get(client_id) else {
            return false;
        };
        match &client.client_secret {
            None => true,
            Some(expected) => client_secret.is_some_and(|s| s == expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_pkce_only_client_with_no_secret() {
        let registry = ClientRegistry::new();
        let client = registry.register(
            ClientRegistrationRequest {
                client_name: "cli-tool".to_string(),
                redirect_uris: vec!["http://localhost:8765/cb".to_string()],
                grant_types: vec!["authorization_code".to_string()],
                token_endpoint_auth_method: "none".to_string(),
                response_types: vec!["code".to_string()],
                scope: None,
            },
            "mcp:read",
        );
        assert!(client.client_secret.is_none());
        assert!(registry.authenticate(&client.client_id, None));
    }

    #[test]
    fn register_assigns_confidential_client_with_secret() {
        let registry = ClientRegistry::new();
        let client = registry.register(
            ClientRegistrationRequest {
                client_name: "backend-service".to_string(),
                redirect_uris: vec!["https://service.example.com/cb".to_string()],
                grant_types: vec!["authorization_code".to_string()],
                token_endpoint_auth_method: "client_secret_post".to_string(),
                response_types: vec!["code".to_string()],
                scope: None,
            },
            "mcp:read",
        );
        let secret = client.client_secret.clone().unwrap();
        assert!(!registry.authenticate(&client.client_id, None));
        assert!(registry.authenticate(&client.client_id, Some(&secret)));
        assert!(!registry.authenticate(&client.client_id, Some("wrong")));
    }

    #[test]
    fn redirect_uri_must_match_exactly() {
        let registry = ClientRegistry::new();
        let client = registry.register(
            ClientRegistrationRequest {
                client_name: "cli-tool".to_string(),
                redirect_uris: vec!["http://localhost:8765/cb".to_string()],
                grant_types: vec!["authorization_code".to_string()],
                token_endpoint_auth_method: "none".to_string(),
                response_types: vec!["code".to_string()],
                scope: None,
            },
            "mcp:read",
        );
        assert!(registry.redirect_uri_is_registered(&client.client_id, "http://localhost:8765/cb"));
        assert!(!registry.redirect_uri_is_registered(&client.client_id, "http://localhost:8765/cb/evil"));
    }
}
