use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::credentials::CredentialStore;
use super::refresh::TokenBackend;
use super::store::TokenStateStore;
use super::types::{AccessToken, RefreshMaterial, StateChange, TokenState};
use crate::connection::{Connection, ConnectionId};
use crate::error::{AuthError, Result};
use crate::notifier::{ChangeNotifier, Event};

/// Retry policy for transient refresh failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, 0)
    }

    /// Exponential backoff: base_delay * 2^attempt, plus up to 10% jitter
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
        let jitter = (delay as f64 * 0.1 * jitter::random()) as u64;
        delay + jitter
    }
}

mod jitter {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let state = RandomState::new();
        let mut hasher = state.build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}

/// Obtains, refreshes and validates the bearer token of one connection
///
/// All state changes go through the shared [`TokenStateStore`] and are
/// published on the [`ChangeNotifier`] before the store's commit lock is
/// released, so subscribers see transitions in commit order.
pub struct BearerTokenProvider {
    connection: Connection,
    store: Arc<TokenStateStore>,
    notifier: Arc<ChangeNotifier>,
    backend: Arc<dyn TokenBackend>,
    credentials: Arc<dyn CredentialStore>,

    /// Current access token
    access_token: RwLock<Option<AccessToken>>,

    /// Serializes refresh-token exchanges for this connection
    refresh_lock: Mutex<()>,

    /// Set once the server revoked the grant; cleared by a new login
    revoked: AtomicBool,

    /// Token refresh threshold in seconds
    refresh_threshold: i64,

    retry: RetryPolicy,
}

impl std::fmt::Debug for BearerTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokenProvider")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl BearerTokenProvider {
    pub fn new(
        connection: Connection,
        store: Arc<TokenStateStore>,
        notifier: Arc<ChangeNotifier>,
        backend: Arc<dyn TokenBackend>,
        credentials: Arc<dyn CredentialStore>,
        refresh_threshold: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connection,
            store,
            notifier,
            backend,
            credentials,
            access_token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            revoked: AtomicBool::new(false),
            refresh_threshold: refresh_threshold as i64,
            retry,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.connection.id
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Last known state; no I/O
    pub fn state(&self) -> TokenState {
        self.store.get(self.id())
    }

    fn transition(&self, new_state: TokenState) -> Option<StateChange> {
        self.store.commit(self.id(), new_state, |change| {
            tracing::info!(
                connection = %change.connection_id,
                "Token state: {} -> {}",
                change.old,
                change.new
            );
            self.notifier.publish(Event::StateChanged(change.clone()));
        })
    }

    /// Check if token is expiring soon (within threshold)
    async fn is_token_expiring_soon(&self) -> bool {
        let token = self.access_token.read().await;
        match *token {
            None => true,
            Some(ref t) => t.expires_at <= Utc::now() + Duration::seconds(self.refresh_threshold),
        }
    }

    /// Check if token is actually expired (not just expiring soon)
    async fn is_token_expired(&self) -> bool {
        let token = self.access_token.read().await;
        match *token {
            None => true,
            Some(ref t) => Utc::now() >= t.expires_at,
        }
    }

    /// One silent renewal attempt using the stored refresh material
    pub async fn refresh(&self) -> Result<TokenState> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Body of `refresh`; the caller holds `refresh_lock`
    async fn refresh_locked(&self) -> Result<TokenState> {
        if self.revoked.load(Ordering::SeqCst) {
            tracing::debug!(connection = %self.id(), "Grant revoked, skipping refresh");
            // Retry a removal that failed when the revocation was first seen
            self.discard_material();
            return Err(AuthError::Revoked);
        }

        let mut material = match self.credentials.get(self.id())? {
            Some(material) => material,
            None => {
                // A connection that never logged in stays NotAuthenticated
                if self.state() != TokenState::NotAuthenticated {
                    self.transition(TokenState::ExpiredNeedsReauth);
                }
                return Err(AuthError::ExpiredRefreshToken);
            }
        };

        tracing::debug!(connection = %self.id(), "Refreshing access token...");
        match self.backend.refresh(&self.connection, &material).await {
            Ok(data) => {
                material.apply(&data);
                self.credentials.put(self.id(), &material)?;
                {
                    let mut token = self.access_token.write().await;
                    *token = Some(AccessToken {
                        token: data.access_token,
                        expires_at: data.expires_at,
                    });
                }
                self.transition(TokenState::Authorized);
                Ok(TokenState::Authorized)
            }
            Err(AuthError::ExpiredRefreshToken) => {
                tracing::warn!(connection = %self.id(), "Refresh token expired, reauthentication required");
                self.transition(TokenState::ExpiredNeedsReauth);
                Err(AuthError::ExpiredRefreshToken)
            }
            Err(AuthError::Revoked) => {
                tracing::warn!(connection = %self.id(), "Authorization revoked, discarding credentials");
                self.access_token.write().await.take();
                self.transition(TokenState::NotAuthenticated);
                self.revoked.store(true, Ordering::SeqCst);
                self.discard_material();
                Err(AuthError::Revoked)
            }
            Err(e) => {
                tracing::warn!(connection = %self.id(), error = %e, "Token refresh failed");
                Err(e)
            }
        }
    }

    /// Best-effort removal of revoked refresh material
    fn discard_material(&self) {
        if let Err(e) = self.credentials.remove(self.id()) {
            tracing::error!(connection = %self.id(), error = %e, "Failed to delete revoked credentials");
        }
    }

    /// Refresh, retrying transient network failures with backoff
    pub async fn refresh_with_retry(&self, policy: &RetryPolicy) -> Result<TokenState> {
        let mut attempt = 0;
        loop {
            match self.refresh().await {
                Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                    let delay = policy.backoff_delay_ms(attempt);
                    tracing::warn!(
                        "Refresh failed: {}, retrying after {}ms (attempt {}/{})",
                        e,
                        delay,
                        attempt + 1,
                        policy.max_retries
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            connection = %self.id(),
                            total_attempts = attempt + 1,
                            "Token refresh failed after all retries"
                        );
                    }
                    return Err(e);
                }
                Ok(state) => return Ok(state),
            }
        }
    }

    /// Get a valid access token, refreshing if necessary
    pub async fn access_token(&self) -> Result<String> {
        if self.is_token_expiring_soon().await {
            if let Err(e) = self.refresh_with_retry(&self.retry).await {
                tracing::error!("Token refresh failed: {}", e);

                // Graceful degradation: if token isn't actually expired yet, use it
                if !self.is_token_expired().await {
                    tracing::warn!("Using existing token despite refresh failure (not yet expired)");
                    let token = self.access_token.read().await;
                    if let Some(ref t) = *token {
                        return Ok(t.token.clone());
                    }
                }

                return Err(e);
            }
        }

        let token = self.access_token.read().await;
        token
            .as_ref()
            .map(|t| t.token.clone())
            .ok_or_else(|| AuthError::Internal("No access token available".to_string()))
    }

    /// Mark an authorized connection whose token has lapsed as expired
    pub async fn validate(&self) -> TokenState {
        if self.state().is_authorized() && self.is_token_expired().await {
            let next = match self.credentials.get(self.id()) {
                Ok(Some(_)) => TokenState::ExpiredRefreshable,
                Ok(None) => TokenState::ExpiredNeedsReauth,
                Err(e) => TokenState::Error(e.to_string()),
            };
            self.transition(next);
        }
        self.state()
    }

    /// Initial transition from persisted refresh material
    pub async fn restore(&self) -> TokenState {
        match self.credentials.get(self.id()) {
            Ok(Some(material)) => match material.live_access_token() {
                Some(token) => {
                    *self.access_token.write().await = Some(token);
                    self.transition(TokenState::Authorized);
                }
                None => {
                    self.transition(TokenState::ExpiredRefreshable);
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::error!(connection = %self.id(), error = %e, "Failed to load stored credentials");
                self.transition(TokenState::Error(e.to_string()));
            }
        }
        self.state()
    }

    /// Persist material from a completed interactive login
    ///
    /// Material without a live access token is exchanged right away, so the
    /// connection only reports `Authorized` once it holds a usable token.
    pub async fn complete_login(&self, material: RefreshMaterial) -> Result<TokenState> {
        let _guard = self.refresh_lock.lock().await;

        self.credentials.put(self.id(), &material)?;
        self.revoked.store(false, Ordering::SeqCst);

        if let Some(token) = material.live_access_token() {
            *self.access_token.write().await = Some(token);
            self.transition(TokenState::Authorized);
            return Ok(TokenState::Authorized);
        }

        self.access_token.write().await.take();
        match self.refresh_locked().await {
            Err(e) if e.is_retryable() => {
                // Stored material is good; the next refresh can finish the job
                self.transition(TokenState::ExpiredRefreshable);
                Err(e)
            }
            result => result,
        }
    }

    /// Discard credentials and return to NotAuthenticated
    pub async fn logout(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        self.credentials.remove(self.id())?;
        self.access_token.write().await.take();
        self.transition(TokenState::NotAuthenticated);
        tracing::info!(connection = %self.id(), "Logged out");
        Ok(())
    }
}
