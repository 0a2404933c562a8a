// Connection registry
// Tracks known connections and which connection each feature is bound to

use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::auth::{
    BearerTokenProvider, CredentialStore, RetryPolicy, TokenBackend, TokenState, TokenStateStore,
};
use crate::connection::{Connection, ConnectionId, ConnectionKind, FeatureId};
use crate::error::{AuthError, Result};
use crate::notifier::{ChangeNotifier, Event};

/// Point-in-time copy of the registered connections
///
/// Iterating does not observe later registry changes and can be repeated.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    connections: Vec<Connection>,
}

impl ConnectionSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Connection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl IntoIterator for ConnectionSnapshot {
    type Item = Connection;
    type IntoIter = std::vec::IntoIter<Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.connections.into_iter()
    }
}

impl<'a> IntoIterator for &'a ConnectionSnapshot {
    type Item = &'a Connection;
    type IntoIter = std::slice::Iter<'a, Connection>;

    fn into_iter(self) -> Self::IntoIter {
        self.connections.iter()
    }
}

/// Registry of connections, their token providers and feature bindings
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Connection>>,
    providers: DashMap<ConnectionId, Arc<BearerTokenProvider>>,
    bindings: DashMap<FeatureId, ConnectionId>,

    /// Serializes rebinds so active-connection events go out in commit order
    rebind: Mutex<()>,

    store: Arc<TokenStateStore>,
    notifier: Arc<ChangeNotifier>,
    backend: Arc<dyn TokenBackend>,
    credentials: Arc<dyn CredentialStore>,
    refresh_threshold: u64,
    retry: RetryPolicy,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<TokenStateStore>,
        notifier: Arc<ChangeNotifier>,
        backend: Arc<dyn TokenBackend>,
        credentials: Arc<dyn CredentialStore>,
        refresh_threshold: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            providers: DashMap::new(),
            bindings: DashMap::new(),
            rebind: Mutex::new(()),
            store,
            notifier,
            backend,
            credentials,
            refresh_threshold,
            retry,
        }
    }

    /// Register a connection
    /// Returns the token provider for bearer connections
    pub fn add_connection(&self, connection: Connection) -> Option<Arc<BearerTokenProvider>> {
        {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            if connections.contains_key(&connection.id) {
                tracing::warn!(connection = %connection.id, "Connection already registered");
                drop(connections);
                return self.provider(&connection.id);
            }
            connections.insert(connection.id.clone(), connection.clone());
        }

        tracing::info!(
            connection = %connection.id,
            kind = connection.kind.name(),
            "Registered connection: {}",
            connection.label
        );

        match connection.kind {
            ConnectionKind::StaticCredentials { .. } => {
                // Long-lived credentials are usable as soon as they are configured
                self.store.commit(&connection.id, TokenState::Authorized, |change| {
                    self.notifier.publish(Event::StateChanged(change.clone()));
                });
                None
            }
            ConnectionKind::BearerToken { .. } => {
                let id = connection.id.clone();
                let provider = Arc::new(BearerTokenProvider::new(
                    connection,
                    Arc::clone(&self.store),
                    Arc::clone(&self.notifier),
                    Arc::clone(&self.backend),
                    Arc::clone(&self.credentials),
                    self.refresh_threshold,
                    self.retry.clone(),
                ));
                self.providers.insert(id, Arc::clone(&provider));
                Some(provider)
            }
        }
    }

    /// Log out and forget a connection, unbinding every feature that used it
    pub async fn remove_connection(&self, id: &ConnectionId) -> Result<Option<Connection>> {
        if self.connection(id).is_none() {
            return Ok(None);
        }

        if let Some(provider) = self.provider(id) {
            provider.logout().await?;
        } else {
            self.store.commit(id, TokenState::NotAuthenticated, |change| {
                self.notifier.publish(Event::StateChanged(change.clone()));
            });
        }

        // Removal and unbinding happen under the rebind lock so no feature can
        // bind to the connection between the two
        let removed = {
            let _rebind = self.rebind.lock().unwrap_or_else(|e| e.into_inner());
            let removed = {
                let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
                connections.remove(id)
            };
            self.providers.remove(id);

            let bound: Vec<FeatureId> = self
                .bindings
                .iter()
                .filter(|entry| entry.value() == id)
                .map(|entry| entry.key().clone())
                .collect();
            for feature in bound {
                if self.bindings.remove_if(&feature, |_, bound_id| bound_id == id).is_some() {
                    tracing::info!(feature = %feature, connection = %id, "Feature unbound");
                    self.notifier.publish(Event::ActiveConnectionChanged {
                        feature,
                        connection: None,
                    });
                }
            }
            removed
        };

        self.store.remove(id);
        tracing::info!(connection = %id, "Connection removed");
        Ok(removed)
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections.get(id).cloned()
    }

    pub fn provider(&self, id: &ConnectionId) -> Option<Arc<BearerTokenProvider>> {
        self.providers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn active_connection_for_feature(&self, feature: &FeatureId) -> Option<Connection> {
        let id = self.bindings.get(feature).map(|entry| entry.value().clone())?;
        self.connection(&id)
    }

    /// `NotAuthenticated` when the feature has no connection
    pub fn connection_state_for_feature(&self, feature: &FeatureId) -> TokenState {
        match self.active_connection_for_feature(feature) {
            Some(connection) => self.store.get(&connection.id),
            None => TokenState::NotAuthenticated,
        }
    }

    /// Bind (or with `None`, unbind) the active connection of a feature
    ///
    /// Publishes an active-connection-changed event when the binding changes.
    /// Listeners must not rebind synchronously from inside the event.
    pub fn set_active_connection(&self, feature: FeatureId, connection_id: Option<ConnectionId>) -> Result<()> {
        let _rebind = self.rebind.lock().unwrap_or_else(|e| e.into_inner());
        let connection = match connection_id {
            Some(id) => Some(self.connection(&id).ok_or(AuthError::ConnectionNotFound(id))?),
            None => None,
        };

        let previous = match connection {
            Some(ref c) => self.bindings.insert(feature.clone(), c.id.clone()),
            None => self.bindings.remove(&feature).map(|(_, id)| id),
        };

        if previous.as_ref() == connection.as_ref().map(|c| &c.id) {
            return Ok(());
        }

        tracing::info!(
            feature = %feature,
            connection = connection.as_ref().map(|c| c.id.as_str()).unwrap_or("<none>"),
            "Active connection changed"
        );
        self.notifier.publish(Event::ActiveConnectionChanged { feature, connection });
        Ok(())
    }

    pub fn list_connections(&self) -> ConnectionSnapshot {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        ConnectionSnapshot {
            connections: connections.values().cloned().collect(),
        }
    }

    /// Replace the granted scopes of a connection
    ///
    /// The token state is kept as is; the next refresh re-validates the grant.
    pub fn update_scopes(&self, id: &ConnectionId, scopes: BTreeSet<String>) -> Result<Connection> {
        let updated = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            let connection = connections
                .get_mut(id)
                .ok_or_else(|| AuthError::ConnectionNotFound(id.clone()))?;
            if connection.scopes == scopes {
                return Ok(connection.clone());
            }
            connection.scopes = scopes;
            connection.clone()
        };

        tracing::info!(connection = %id, scopes = ?updated.scopes, "Connection scopes changed");
        self.notifier.publish(Event::ScopesChanged {
            connection_id: id.clone(),
            scopes: updated.scopes.iter().cloned().collect(),
        });
        Ok(updated)
    }

    /// Current feature bindings, sorted by feature
    pub fn bindings(&self) -> Vec<(FeatureId, ConnectionId)> {
        let mut bindings: Vec<(FeatureId, ConnectionId)> = self
            .bindings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        bindings.sort();
        bindings
    }
}
