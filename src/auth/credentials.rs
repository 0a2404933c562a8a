// Refresh material persistence

use dashmap::DashMap;

use super::types::RefreshMaterial;
use crate::connection::ConnectionId;
use crate::error::Result;

/// Key-value persistence of long-lived refresh material, keyed by connection id
pub trait CredentialStore: Send + Sync {
    fn get(&self, id: &ConnectionId) -> Result<Option<RefreshMaterial>>;
    fn put(&self, id: &ConnectionId, material: &RefreshMaterial) -> Result<()>;
    /// Returns true when something was deleted
    fn remove(&self, id: &ConnectionId) -> Result<bool>;
}

/// In-memory store for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<ConnectionId, RefreshMaterial>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: &ConnectionId) -> Result<Option<RefreshMaterial>> {
        Ok(self.entries.get(id).map(|entry| entry.value().clone()))
    }

    fn put(&self, id: &ConnectionId, material: &RefreshMaterial) -> Result<()> {
        self.entries.insert(id.clone(), material.clone());
        Ok(())
    }

    fn remove(&self, id: &ConnectionId) -> Result<bool> {
        Ok(self.entries.remove(id).is_some())
    }
}

/// Storage key for a connection's refresh material
pub fn token_key(id: &ConnectionId) -> String {
    format!("toolkit:sso:token:{}", id)
}
