//! User-store collaborator.
//!
//! The durable user record is treated as an external collaborator —
//! production deployments back it with Postgres or MongoDB. This module
//! only fixes the trait boundary and ships an in-memory reference adapter
//! so the crate runs standalone.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A resolved user record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable internal user id.
    pub user_id: String,
    /// Identity-provider identifier (`sub` or similar).
    pub idp_id: String,
    /// Username at the time of last resolution.
    pub username: String,
    /// Email at the time of last resolution.
    pub email: String,
}

/// Capability set for resolving/creating user records from IdP identity.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Resolve (and create if absent) the internal `user_id` for an IdP
    /// identity. Never fails in the reference design; a real adapter
    /// backed by a database may return `None` on outage, at which point
    /// callers treat `user_id` as unresolved rather than failing the flow.
    async fn resolve(&self, idp_id: &str, username: &str, email: &str) -> Option<String>;
}

/// `DashMap`-backed reference `UserStore`, keyed by `idp_id`.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    by_idp_id: DashMap<String, UserRecord>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserStore for InMemoryUserStore {
    async fn resolve(&self, idp_id: &str, username: &str, email: &str) -> Option<String> {
        if let Some(existing) = self.by_idp_id.get(idp_id) {
            return Some(existing.user_id.clone());
        }
        let user_id = format!("usr_{}", uuid::Uuid::new_v4().simple());
        self.by_idp_id.insert(
            idp_id.to_string(),
            UserRecord {
                user_id: user_id.clone(),
                idp_id: idp_id.to_string(),
                username: username.to_string(),
                email: email.to_string(),
            },
        );
        Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_is_idempotent_per_idp_id() {
        let store = InMemoryUserStore::new();
        let first = store.resolve("idp:alice", "alice", "alice@co.com").await;
        let second = store.resolve("idp:alice", "alice", "alice@co.com").await;
        assert_eq!(first, second);
        assert!(first.unwrap().starts_with("usr_"));
    }

    #[tokio::test]
    async fn distinct_identities_resolve_to_distinct_ids() {
        let store = InMemoryUserStore::new();
        let a = store.resolve("idp:a", "a", "a@co.com").await.unwrap();
        let b = store.resolve("idp:b", "b", "b@co.com").await.unwrap();
        assert_ne!(a, b);
    }
}
