//! MCP Gateway Auth & Discovery Plane
//!
//! Identity/authorization and tool-discovery plane for a Model Context
//! Protocol gateway: an OAuth 2.0 / OIDC façade in front of external
//! identity providers, a self-signed token service, a scope-based policy
//! engine, and a vector-search engine over the MCP tool/server catalog.
//!
//! # Components
//!
//! - **`oauth`** — identity provider adapters, the OAuth flow engine
//!   (Authorization Code + PKCE, Device Authorization Grant, dynamic client
//!   registration, refresh), and well-known metadata serving.
//! - **`key_server`** — the self-signed token service, scope & policy
//!   engine, and the `/validate` access-enforcement endpoint.
//! - **`discovery`** — the vector-search index, catalog sync, and query API.
//! - **`http`** — router assembly, middleware, graceful shutdown.
//! - **`config`** — layered `figment` configuration.
//! - **`cli`** — the `clap` entry point.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod key_server;
pub mod oauth;
pub mod userstore;
pub mod wellknown;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
