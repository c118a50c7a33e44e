//! The registry interface's API-key side: resolving a presented key to a
//! backend identity is the one piece of the admin-plane collaborator that
//! the control session needs to call synchronously during registration.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

/// A backend's identity as known to the core: just the id the registry
/// indexes sessions and tunnels by. Everything else about a backend
/// (owner, plan, persisted record) lives with the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIdentity {
    pub backend_id: String,
}

/// Resolves an API key presented on `register` to a backend identity.
///
/// Implemented by the admin-plane collaborator in a full deployment (e.g.
/// backed by the JSON persistence file or a database); the core only ever
/// calls `resolve`.
#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    async fn resolve(&self, api_key: &str) -> Option<BackendIdentity>;
}

/// An in-memory resolver keyed by exact API key match, for embedding and
/// for tests that don't need a real backend collaborator.
#[derive(Debug, Default)]
pub struct StaticApiKeyResolver {
    keys: RwLock<HashMap<String, String>>,
}

impl StaticApiKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `api_key` as authorizing `backend_id`. A later call with
    /// the same key overwrites the mapping.
    pub fn insert(&self, api_key: impl Into<String>, backend_id: impl Into<String>) {
        self.keys
            .write()
            .expect("static resolver lock poisoned")
            .insert(api_key.into(), backend_id.into());
    }

    pub fn remove(&self, api_key: &str) {
        self.keys
            .write()
            .expect("static resolver lock poisoned")
            .remove(api_key);
    }
}

#[async_trait]
impl ApiKeyResolver for StaticApiKeyResolver {
    async fn resolve(&self, api_key: &str) -> Option<BackendIdentity> {
        self.keys
            .read()
            .expect("static resolver lock poisoned")
            .get(api_key)
            .map(|backend_id| BackendIdentity {
                backend_id: backend_id.clone(),
            })
    }
}
