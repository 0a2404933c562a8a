// Reauthentication coordination
// At most one interactive login in flight per connection

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::provider::{BearerTokenProvider, RetryPolicy};
use super::types::{RefreshMaterial, ReauthRequest, TokenState};
use crate::connection::{Connection, ConnectionId};
use crate::error::{AuthError, Result};
use crate::registry::ConnectionRegistry;

/// Result of an interactive login
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Completed(RefreshMaterial),
    Cancelled,
}

/// Interactive login flow supplied by the UI layer
///
/// `login` blocks until the user finishes or dismisses the flow. It runs on
/// the blocking pool, never on an async worker.
pub trait LoginPrompt: Send + Sync {
    fn login(&self, connection: &Connection) -> Result<LoginOutcome>;

    /// Ask an open login flow for `connection` to close
    ///
    /// A flow that honours this returns `LoginOutcome::Cancelled` from
    /// `login`. Until `login` returns, the prompt still counts as in flight.
    fn cancel(&self, _connection: &Connection) {}
}

/// How the last prompt for a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReauthOutcome {
    Success,
    Cancelled,
    Failed(AuthError),
}

impl ReauthOutcome {
    fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ReauthOutcome::Success,
            Err(AuthError::UserCancelled) => ReauthOutcome::Cancelled,
            Err(e) => ReauthOutcome::Failed(e.clone()),
        }
    }
}

/// Observable per-connection phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReauthPhase {
    Idle,
    PromptInFlight(ReauthRequest),
    Resolved(ReauthOutcome),
}

type PromptResult = Result<Arc<BearerTokenProvider>>;
type SharedPrompt = Shared<BoxFuture<'static, PromptResult>>;

type Slots = DashMap<ConnectionId, Slot>;

enum Slot {
    InFlight {
        request: ReauthRequest,
        /// Outcome of the login itself; cancellation never drops it
        login: SharedPrompt,
        /// What callers wait on; resolves early on cancellation
        result: SharedPrompt,
        cancel: Option<oneshot::Sender<()>>,
        /// Set when the connection is closed; a late login result is discarded
        closed: bool,
    },
    Resolved(ReauthOutcome),
}

fn owns_slot(slots: &Slots, owner: &ReauthRequest) -> bool {
    matches!(
        slots.get(&owner.connection_id).as_deref(),
        Some(Slot::InFlight { request, closed: false, .. }) if request.id == owner.id
    )
}

/// Decides between silent refresh and an interactive prompt, and
/// de-duplicates concurrent prompts for the same connection
pub struct ReauthCoordinator {
    registry: Arc<ConnectionRegistry>,
    prompt: Arc<dyn LoginPrompt>,
    retry: RetryPolicy,
    slots: Arc<Slots>,
}

impl ReauthCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, prompt: Arc<dyn LoginPrompt>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            prompt,
            retry,
            slots: Arc::new(DashMap::new()),
        }
    }

    fn provider_for(&self, id: &ConnectionId) -> Result<Arc<BearerTokenProvider>> {
        let connection = self
            .registry
            .connection(id)
            .ok_or_else(|| AuthError::ConnectionNotFound(id.clone()))?;
        if !connection.kind.is_bearer() {
            return Err(AuthError::UnsupportedConnection(id.clone()));
        }
        self.registry
            .provider(id)
            .ok_or_else(|| AuthError::ConnectionNotFound(id.clone()))
    }

    /// Make `id` usable, prompting the user only when silent refresh cannot
    ///
    /// Concurrent callers for the same connection share one prompt and all
    /// receive its result.
    pub async fn prompt_auth(&self, id: &ConnectionId) -> PromptResult {
        let provider = self.provider_for(id)?;

        // The entry guard is released before awaiting; nothing below it touches the store
        let shared = match self.slots.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let joined = match entry.get() {
                    Slot::InFlight { request, result, .. } => {
                        tracing::debug!(connection = %id, request = %request.id, "Joining in-flight reauthentication");
                        Some(result.clone())
                    }
                    Slot::Resolved(_) => None,
                };
                match joined {
                    Some(shared) => shared,
                    None => {
                        let (slot, shared) = self.start(provider);
                        entry.insert(slot);
                        shared
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (slot, shared) = self.start(provider);
                entry.insert(slot);
                shared
            }
        };

        shared.await
    }

    fn start(&self, provider: Arc<BearerTokenProvider>) -> (Slot, SharedPrompt) {
        let request = ReauthRequest::new(provider.id().clone());
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let slots = Arc::clone(&self.slots);
        let prompt = Arc::clone(&self.prompt);
        let retry = self.retry.clone();
        let owner = request.clone();

        tracing::info!(connection = %request.connection_id, request = %request.id, "Starting reauthentication");

        let driver = tokio::spawn(async move {
            let result = reauthenticate(provider, prompt, retry, &slots, &owner).await;

            let outcome = ReauthOutcome::of(&result);
            tracing::info!(connection = %owner.connection_id, outcome = ?outcome, "Reauthentication resolved");

            if let Entry::Occupied(mut entry) = slots.entry(owner.connection_id.clone()) {
                let (ours, closed) = match entry.get() {
                    Slot::InFlight { request, closed, .. } => (request.id == owner.id, *closed),
                    Slot::Resolved(_) => (false, false),
                };
                if ours {
                    if closed || outcome == ReauthOutcome::Success {
                        entry.remove();
                    } else {
                        entry.insert(Slot::Resolved(outcome));
                    }
                }
            }
            result
        });

        let login = async move {
            driver.await.unwrap_or_else(|e| {
                Err(AuthError::Internal(format!("Reauthentication task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        let joined = login.clone();
        let result = async move {
            tokio::select! {
                biased;
                result = joined => result,
                // Only an explicit cancel; the sender is dropped when the slot resolves
                Ok(()) = cancel_rx => Err(AuthError::UserCancelled),
            }
        }
        .boxed()
        .shared();

        let slot = Slot::InFlight {
            request,
            login,
            result: result.clone(),
            cancel: Some(cancel_tx),
            closed: false,
        };
        (slot, result)
    }

    /// Cancel the in-flight prompt for `id`; every waiter gets `UserCancelled`
    ///
    /// The login flow is asked to close. Until it returns the prompt stays in
    /// flight, and later callers wait for that flow instead of opening another.
    pub fn cancel(&self, id: &ConnectionId) -> bool {
        let cancelled = match self.slots.get_mut(id) {
            Some(mut slot) => match &mut *slot {
                Slot::InFlight {
                    request,
                    login,
                    result,
                    cancel,
                    ..
                } => match cancel.take() {
                    Some(tx) => {
                        tracing::info!(connection = %id, request = %request.id, "Cancelling reauthentication");
                        // No receiver left just means nobody is waiting
                        let _ = tx.send(());
                        *result = login.clone();
                        true
                    }
                    None => false,
                },
                Slot::Resolved(_) => false,
            },
            None => false,
        };

        if cancelled {
            if let Some(connection) = self.registry.connection(id) {
                self.prompt.cancel(&connection);
            }
        }
        cancelled
    }

    pub fn phase(&self, id: &ConnectionId) -> ReauthPhase {
        match self.slots.get(id) {
            None => ReauthPhase::Idle,
            Some(slot) => match &*slot {
                Slot::InFlight { request, .. } => ReauthPhase::PromptInFlight(request.clone()),
                Slot::Resolved(outcome) => ReauthPhase::Resolved(outcome.clone()),
            },
        }
    }

    /// Forget the connection's prompt state when it is closed or removed
    ///
    /// A login still open on screen keeps the slot until it returns, and its
    /// result is discarded.
    pub fn forget(&self, id: &ConnectionId) {
        self.cancel(id);
        if let Entry::Occupied(mut entry) = self.slots.entry(id.clone()) {
            let in_flight = match entry.get_mut() {
                Slot::InFlight { closed, .. } => {
                    *closed = true;
                    true
                }
                Slot::Resolved(_) => false,
            };
            if !in_flight {
                entry.remove();
            }
        }
    }
}

async fn reauthenticate(
    provider: Arc<BearerTokenProvider>,
    prompt: Arc<dyn LoginPrompt>,
    retry: RetryPolicy,
    slots: &Slots,
    owner: &ReauthRequest,
) -> PromptResult {
    match provider.validate().await {
        TokenState::Authorized => return Ok(provider),
        TokenState::ExpiredRefreshable => match provider.refresh_with_retry(&retry).await {
            Ok(_) => return Ok(provider),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::info!(connection = %provider.id(), "Silent refresh failed ({}), prompting for login", e)
            }
        },
        _ => {}
    }

    let connection = provider.connection().clone();
    tracing::info!(connection = %connection.id, "Requesting interactive login");
    let outcome = tokio::task::spawn_blocking(move || prompt.login(&connection))
        .await
        .map_err(|e| AuthError::Internal(format!("Login prompt panicked: {}", e)))??;

    match outcome {
        LoginOutcome::Completed(material) => {
            if !owns_slot(slots, owner) {
                tracing::warn!(connection = %provider.id(), "Connection was closed during login, discarding the result");
                return Err(AuthError::UserCancelled);
            }
            provider.complete_login(material).await?;
            Ok(provider)
        }
        LoginOutcome::Cancelled => Err(AuthError::UserCancelled),
    }
}
