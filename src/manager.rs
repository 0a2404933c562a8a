// Credential management API
// Wires the registry, token providers, reauthentication and event delivery
// into one explicitly constructed context

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::auth::{
    BearerTokenProvider, CredentialStore, LoginPrompt, ReauthCoordinator, RetryPolicy, TokenBackend,
    TokenState, TokenStateStore,
};
use crate::connection::{Connection, ConnectionId, FeatureId};
use crate::error::{AuthError, Result};
use crate::notifier::{ChangeNotifier, Dispatcher, Event, Subscription, Topic};
use crate::registry::{ConnectionRegistry, ConnectionSnapshot};
use crate::storage::SqliteStore;

/// Token lifecycle tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    /// Seconds before expiry at which an access token is refreshed
    pub refresh_threshold: u64,
    pub retry: RetryPolicy,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            refresh_threshold: 300,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything needed to talk to a service on behalf of a feature
#[derive(Clone)]
pub struct ConnectionSettings {
    pub connection: Connection,
    provider: Option<Arc<BearerTokenProvider>>,
}

impl ConnectionSettings {
    pub fn provider(&self) -> Option<&Arc<BearerTokenProvider>> {
        self.provider.as_ref()
    }

    /// Current access token, refreshed if it is about to expire
    pub async fn bearer_token(&self) -> Result<String> {
        match &self.provider {
            Some(provider) => provider.access_token().await,
            None => Err(AuthError::UnsupportedConnection(self.connection.id.clone())),
        }
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("connection", &self.connection)
            .field("bearer", &self.provider.is_some())
            .finish()
    }
}

/// Root of the credential subsystem
pub struct AuthContext {
    store: Arc<TokenStateStore>,
    notifier: Arc<ChangeNotifier>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<ReauthCoordinator>,
}

impl AuthContext {
    pub fn new(
        settings: AuthSettings,
        backend: Arc<dyn TokenBackend>,
        credentials: Arc<dyn CredentialStore>,
        prompt: Arc<dyn LoginPrompt>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let store = Arc::new(TokenStateStore::new());
        let notifier = Arc::new(ChangeNotifier::new(dispatcher));
        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            backend,
            credentials,
            settings.refresh_threshold,
            settings.retry.clone(),
        ));
        let coordinator = Arc::new(ReauthCoordinator::new(Arc::clone(&registry), prompt, settings.retry));

        Self {
            store,
            notifier,
            registry,
            coordinator,
        }
    }

    pub fn store(&self) -> &Arc<TokenStateStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ReauthCoordinator> {
        &self.coordinator
    }

    /// Per-feature view of this context
    pub fn feature(self: &Arc<Self>, feature: impl Into<FeatureId>) -> FeatureCredentialManager {
        FeatureCredentialManager {
            context: Arc::clone(self),
            feature: feature.into(),
        }
    }

    /// Register a connection and restore its persisted tokens
    pub async fn add_connection(&self, connection: Connection) -> TokenState {
        let id = connection.id.clone();
        if let Some(provider) = self.registry.add_connection(connection) {
            return provider.restore().await;
        }
        self.store.get(&id)
    }

    /// Log out of a connection; it stays registered and bound
    pub async fn close_connection(&self, id: &ConnectionId) -> Result<()> {
        let connection = self
            .registry
            .connection(id)
            .ok_or_else(|| AuthError::ConnectionNotFound(id.clone()))?;
        let provider = self
            .registry
            .provider(id)
            .ok_or_else(|| AuthError::UnsupportedConnection(connection.id.clone()))?;

        // A login still open on screen must not re-authorize after logout
        self.coordinator.forget(id);
        provider.logout().await?;
        Ok(())
    }

    /// Log out of and unregister a connection
    pub async fn remove_connection(&self, id: &ConnectionId) -> Result<Option<Connection>> {
        self.coordinator.forget(id);
        self.registry.remove_connection(id).await
    }

    pub fn list_connections(&self) -> ConnectionSnapshot {
        self.registry.list_connections()
    }

    pub fn set_active_connection(&self, feature: FeatureId, connection_id: Option<ConnectionId>) -> Result<()> {
        self.registry.set_active_connection(feature, connection_id)
    }

    pub fn active_connection_for_feature(&self, feature: &FeatureId) -> Option<Connection> {
        self.registry.active_connection_for_feature(feature)
    }

    pub fn connection_state_for_feature(&self, feature: &FeatureId) -> TokenState {
        self.registry.connection_state_for_feature(feature)
    }

    pub fn update_scopes(&self, id: &ConnectionId, scopes: BTreeSet<String>) -> Result<Connection> {
        self.registry.update_scopes(id, scopes)
    }

    pub async fn prompt_auth(&self, id: &ConnectionId) -> Result<Arc<BearerTokenProvider>> {
        self.coordinator.prompt_auth(id).await
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.notifier.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.notifier.unsubscribe(subscription)
    }

    /// Register every stored connection and re-create the stored bindings
    pub async fn load_from(&self, storage: &SqliteStore) -> Result<usize> {
        let connections = storage.load_connections()?;
        let count = connections.len();
        for connection in connections {
            let id = connection.id.clone();
            let state = self.add_connection(connection).await;
            tracing::debug!(connection = %id, state = %state, "Restored connection");
        }

        for (feature, connection_id) in storage.load_bindings()? {
            if let Err(e) = self.registry.set_active_connection(feature.clone(), Some(connection_id)) {
                tracing::warn!(feature = %feature, "Dropping stored binding: {}", e);
            }
        }

        tracing::info!("Loaded {} connections", count);
        Ok(count)
    }

    pub fn persist_to(&self, storage: &SqliteStore) -> Result<()> {
        let snapshot = self.registry.list_connections();
        let connections: Vec<Connection> = snapshot.into_iter().collect();
        storage.save_connections(&connections)?;
        storage.save_bindings(&self.registry.bindings())?;
        tracing::debug!("Persisted {} connections", connections.len());
        Ok(())
    }
}

/// Credential access for one logical feature
#[derive(Clone)]
pub struct FeatureCredentialManager {
    context: Arc<AuthContext>,
    feature: FeatureId,
}

impl FeatureCredentialManager {
    pub fn feature(&self) -> &FeatureId {
        &self.feature
    }

    pub fn active_connection(&self) -> Option<Connection> {
        self.context.active_connection_for_feature(&self.feature)
    }

    pub fn connection_state(&self) -> TokenState {
        self.context.connection_state_for_feature(&self.feature)
    }

    /// Settings for the active connection
    ///
    /// With `passive_only`, never prompts: returns `None` whenever the
    /// connection is not usable right now.
    pub async fn connection_settings(&self, passive_only: bool) -> Result<Option<ConnectionSettings>> {
        let connection = match self.active_connection() {
            Some(connection) => connection,
            None if passive_only => return Ok(None),
            None => return Err(AuthError::NoActiveConnection(self.feature.clone())),
        };

        let settings = ConnectionSettings {
            provider: self.context.registry.provider(&connection.id),
            connection,
        };

        match self.context.store.get(&settings.connection.id) {
            TokenState::NotAuthenticated => Ok(None),
            TokenState::Authorized => Ok(Some(settings)),
            _ if passive_only => Ok(None),
            state => {
                tracing::debug!(feature = %self.feature, state = %state, "Connection not usable, prompting");
                let provider = self.context.prompt_auth(&settings.connection.id).await?;
                Ok(Some(ConnectionSettings {
                    connection: provider.connection().clone(),
                    provider: Some(provider),
                }))
            }
        }
    }

    pub async fn prompt_auth(&self) -> Result<Arc<BearerTokenProvider>> {
        let connection = self
            .active_connection()
            .ok_or_else(|| AuthError::NoActiveConnection(self.feature.clone()))?;
        self.context.prompt_auth(&connection.id).await
    }

    /// Log out of the active connection, if any
    pub async fn close_connection(&self) -> Result<()> {
        match self.active_connection() {
            Some(connection) => self.context.close_connection(&connection.id).await,
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active_connection().is_some() && self.connection_state() != TokenState::NotAuthenticated
    }
}
