//! Configuration management.
//!
//! Layered the same way the upstream gateway resolves its own config:
//! a YAML file merged with `MCPGW_`-prefixed, `__`-nested environment
//! variables via `figment`, followed by `${VAR}` / `${VAR:-default}`
//! expansion and `.env`-style file loading via `dotenvy`.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config. Supports `~`
    /// expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// HTTP server bind/transport settings.
    pub server: ServerConfig,
    /// Auth-server routing identity (issuer, external URL, API prefix).
    pub auth_server: AuthServerConfig,
    /// Self-signed token service settings.
    pub token: TokenConfig,
    /// OAuth flow engine timeouts and rate limits.
    pub flow: FlowConfig,
    /// Identity provider adapters, keyed by provider name (`keycloak`, `cognito`, `entra`, ...).
    pub providers: HashMap<String, ProviderConfig>,
    /// Which configured provider is the default (`AUTH_PROVIDER`).
    pub default_provider: Option<String>,
    /// Scope policy location and inline override.
    pub scopes: ScopeConfig,
    /// Vector-store / discovery backend configuration.
    pub discovery: DiscoveryConfig,
    /// CORS origins allowed on the HTTP surface.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Logging level (`trace`..`error`) and format (`text`/`json`).
    pub log: LogConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Auth-server routing identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthServerConfig {
    /// Internal bind URL (`AUTH_SERVER_URL`).
    pub url: String,
    /// Externally visible URL used to build redirect/issuer values (`AUTH_SERVER_EXTERNAL_URL`).
    pub external_url: String,
    /// Path prefix under which the OAuth surface is mounted (`AUTH_SERVER_API_PREFIX`).
    pub api_prefix: String,
}

impl Default for AuthServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            external_url: "http://127.0.0.1:8080".to_string(),
            api_prefix: "/api".to_string(),
        }
    }
}

impl AuthServerConfig {
    /// RFC 8414 `issuer`: the root origin of `external_url`, with the API
    /// prefix stripped (the issuer is never prefixed).
    #[must_use]
    pub fn issuer(&self) -> String {
        self.external_url.trim_end_matches('/').to_string()
    }

    /// Build an operational endpoint URL: external origin + prefix + path.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.external_url.trim_end_matches('/'),
            self.api_prefix,
            path
        )
    }
}

/// Self-signed token service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC signing secret (`SECRET_KEY`). Auto-generated at startup if empty
    /// (single-node only — never stable across restarts).
    pub secret_key: String,
    /// `iss` claim (`JWT_ISSUER`); falls back to `auth_server.issuer()` if empty.
    pub issuer: String,
    /// Default `aud` claim (`JWT_AUDIENCE`).
    pub audience: String,
    /// Fixed `kid` marking self-issued tokens (`JWT_SELF_SIGNED_KID`).
    pub self_signed_kid: String,
    /// Default lifetime for IdP-mediated access tokens.
    #[serde(with = "humantime_serde")]
    pub default_lifetime: Duration,
    /// Default lifetime for user-generated tokens (`DEFAULT_TOKEN_LIFETIME_HOURS`).
    #[serde(with = "humantime_serde")]
    pub default_user_lifetime: Duration,
    /// Maximum lifetime a caller may request for a user-generated token
    /// (`MAX_TOKEN_LIFETIME_HOURS`).
    #[serde(with = "humantime_serde")]
    pub max_user_lifetime: Duration,
    /// Clock-skew leeway applied to `exp`/`iat` checks.
    #[serde(with = "humantime_serde")]
    pub clock_skew_leeway: Duration,
    /// Per-user token-mint rate limit (`MAX_TOKENS_PER_USER_PER_HOUR`).
    pub max_tokens_per_user_per_hour: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            issuer: String::new(),
            audience: "mcp-gateway".to_string(),
            self_signed_kid: "mcpgw-self-signed".to_string(),
            default_lifetime: Duration::from_secs(3600),
            default_user_lifetime: Duration::from_secs(8 * 3600),
            max_user_lifetime: Duration::from_secs(24 * 3600),
            clock_skew_leeway: Duration::from_secs(30),
            max_tokens_per_user_per_hour: 100,
        }
    }
}

/// OAuth flow engine timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Device-code / user-code expiry (`DEVICE_CODE_EXPIRY_SECONDS`).
    #[serde(with = "humantime_serde")]
    pub device_code_expiry: Duration,
    /// Advertised device-flow poll interval (`DEVICE_CODE_POLL_INTERVAL`).
    #[serde(with = "humantime_serde")]
    pub device_code_poll_interval: Duration,
    /// Temporary OAuth session cookie TTL (`OAUTH_SESSION_TTL_SECONDS`).
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Authorization-code TTL (≤10 min).
    #[serde(with = "humantime_serde")]
    pub auth_code_ttl: Duration,
    /// Refresh-token TTL.
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            device_code_expiry: Duration::from_secs(600),
            device_code_poll_interval: Duration::from_secs(5),
            session_ttl: Duration::from_secs(600),
            auth_code_ttl: Duration::from_secs(600),
            refresh_token_ttl: Duration::from_secs(14 * 24 * 3600),
        }
    }
}

/// Per-identity-provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider kind (`keycloak`, `cognito`, `entra`) — selects adapter behavior.
    pub kind: String,
    /// Base issuer/authority URL (realm URL for Keycloak, user-pool URL for
    /// Cognito, tenant authority for Entra).
    pub issuer_url: String,
    /// OAuth client id registered with the IdP.
    pub client_id: String,
    /// OAuth client secret, supports `env:VAR_NAME`.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Machine-to-machine client id/secret, if distinct from the interactive client.
    #[serde(default)]
    pub m2m_client_id: Option<String>,
    #[serde(default)]
    /// M2M client secret.
    pub m2m_client_secret: Option<String>,
    /// Whether this provider is currently enabled (`/oauth2/providers`).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Claim name carrying the username.
    #[serde(default = "default_username_claim")]
    pub username_claim: String,
    /// Claim name carrying the email.
    #[serde(default = "default_email_claim")]
    pub email_claim: String,
    /// Claim name carrying the display name.
    #[serde(default = "default_name_claim")]
    pub name_claim: String,
    /// Claim name carrying group membership.
    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,
}

fn default_true() -> bool {
    true
}
fn default_username_claim() -> String {
    "preferred_username".to_string()
}
fn default_email_claim() -> String {
    "email".to_string()
}
fn default_name_claim() -> String {
    "name".to_string()
}
fn default_groups_claim() -> String {
    "groups".to_string()
}

impl ProviderConfig {
    /// Resolve a secret-ish field honoring the `env:VAR_NAME` indirection
    /// convention carried over from the teacher's `ApiKeyConfig::resolve_key`.
    #[must_use]
    pub fn resolve(value: &str) -> String {
        if let Some(var_name) = value.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }
}

/// Scope policy location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Path to the scope-policy YAML file (`SCOPES_CONFIG_PATH`).
    pub config_path: Option<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            config_path: Some("scopes.yaml".to_string()),
        }
    }
}

/// Discovery subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Vector store backend.
    pub vector_store: VectorStoreConfig,
    /// Embedding provider.
    pub embeddings: EmbeddingsConfig,
    /// Maximum results any single query may request.
    pub max_results: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            vector_store: VectorStoreConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            max_results: 50,
        }
    }
}

/// Vector store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// `memory` (default, in-process) or `http` (Qdrant-shaped REST backend).
    pub kind: String,
    /// Host for the `http` backend.
    pub host: String,
    /// Port for the `http` backend.
    pub port: u16,
    /// API key for the `http` backend, supports `env:VAR_NAME`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Collection name prefix, to namespace multiple gateways on one store.
    pub collection_prefix: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6333,
            api_key: None,
            collection_prefix: "mcpgw".to_string(),
        }
    }
}

/// Embedding provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// `bedrock`, `openai`, or `none` (deterministic hashing embedding, tests only).
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// API key / credential, supports `env:VAR_NAME`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Embedding vector dimensionality.
    pub dimensions: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            model: String::new(),
            api_key: None,
            dimensions: 384,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a provided config file does not exist or cannot
    /// be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCPGW_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        if config.token.secret_key.is_empty() {
            config.token.secret_key = Self::generate_secret();
            tracing::warn!(
                "SECRET_KEY not configured; generated an ephemeral one. Tokens will not \
                 validate across restarts — set token.secret_key (or SECRET_KEY) for \
                 anything beyond single-node development."
            );
        }
        if config.token.issuer.is_empty() {
            config.token.issuer = config.auth_server.issuer();
        }

        Ok(config)
    }

    fn generate_secret() -> String {
        use rand::Rng;
        let bytes: [u8; 32] = rand::rng().random();
        hex::encode(bytes)
    }

    /// Load `.env`-style files into the process environment. Supports `~`
    /// expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                if let Some(home) = env::var_os("HOME") {
                    format!("{}{}", home.to_string_lossy(), rest)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` patterns across string fields
    /// that commonly carry secrets/URLs sourced from the environment.
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        self.token.secret_key = Self::expand_string(&re, &self.token.secret_key);
        for provider in self.providers.values_mut() {
            provider.client_id = Self::expand_string(&re, &provider.client_id);
            if let Some(secret) = provider.client_secret.as_mut() {
                *secret = Self::expand_string(&re, secret);
            }
        }
        if let Some(key) = self.discovery.vector_store.api_key.as_mut() {
            *key = Self::expand_string(&re, key);
        }
        if let Some(key) = self.discovery.embeddings.api_key.as_mut() {
            *key = Self::expand_string(&re, key);
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime-ish serde module for `Duration`: accepts `"30s"`,
/// `"5m"`, `"100ms"`, or a bare integer (seconds).
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize `Duration` as a `"<secs>s"` string.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "MCPGW_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("MCPGW_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_issuer_is_prefix_stripped_external_url() {
        let auth = AuthServerConfig {
            url: "http://127.0.0.1:8080".to_string(),
            external_url: "https://gateway.example.com/".to_string(),
            api_prefix: "/api".to_string(),
        };
        assert_eq!(auth.issuer(), "https://gateway.example.com");
        assert_eq!(
            auth.endpoint("/oauth2/token"),
            "https://gateway.example.com/api/oauth2/token"
        );
    }

    #[test]
    fn test_generated_secret_not_empty_and_loads_without_file() {
        let config = Config::load(None).unwrap();
        assert!(!config.token.secret_key.is_empty());
        assert_eq!(config.token.issuer, config.auth_server.issuer());
    }

    #[test]
    fn test_env_var_expansion_in_client_secret() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("secret.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "MCPGW_TEST_CLIENT_SECRET=shh").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let expanded = Config::expand_string(&re, "${MCPGW_TEST_CLIENT_SECRET}");
        assert_eq!(expanded, "shh");
        let with_default = Config::expand_string(&re, "${MCPGW_UNSET_VAR:-fallback}");
        assert_eq!(with_default, "fallback");
    }
}
