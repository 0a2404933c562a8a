// Scripted collaborators for tests

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use super::credentials::{CredentialStore, MemoryCredentialStore};
use super::reauth::{LoginOutcome, LoginPrompt};
use super::refresh::TokenBackend;
use super::types::{RefreshMaterial, TokenData};
use crate::connection::{Connection, ConnectionId};
use crate::error::{AuthError, Result};

/// Refresh material with a live access token
pub fn material(refresh_token: &str) -> RefreshMaterial {
    RefreshMaterial {
        refresh_token: refresh_token.to_string(),
        client_id: "test-client-id".to_string(),
        client_secret: "test-client-secret".to_string(),
        access_token: Some(format!("access-for-{}", refresh_token)),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        scopes: vec![],
    }
}

pub fn token_data(access_token: &str) -> TokenData {
    TokenData {
        access_token: access_token.to_string(),
        refresh_token: None,
        expires_at: Utc::now() + Duration::hours(1),
    }
}

/// Backend returning queued results, then `fallback` once the queue is empty
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<TokenData>>>,
    fallback: Result<TokenData>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<TokenData>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Ok(token_data("fallback-access")),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(result: Result<TokenData>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: result,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenBackend for ScriptedBackend {
    async fn refresh(&self, _connection: &Connection, _material: &RefreshMaterial) -> Result<TokenData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Prompt that waits, then returns a fixed outcome
pub struct ScriptedPrompt {
    outcome: std::result::Result<LoginOutcome, AuthError>,
    delay: std::time::Duration,
    honor_cancel: bool,
    cancelled: AtomicBool,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(outcome: std::result::Result<LoginOutcome, AuthError>) -> Self {
        Self {
            outcome,
            delay: std::time::Duration::from_millis(0),
            honor_cancel: false,
            cancelled: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn completing(refresh_token: &str) -> Self {
        Self::new(Ok(LoginOutcome::Completed(material(refresh_token))))
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Close the flow with `Cancelled` as soon as `cancel` is called
    pub fn cancellable(mut self) -> Self {
        self.honor_cancel = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of logins that were open at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn wait(&self) -> bool {
        let deadline = Instant::now() + self.delay;
        loop {
            if self.honor_cancel && self.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(std::time::Duration::from_millis(5)));
        }
    }
}

impl LoginPrompt for ScriptedPrompt {
    fn login(&self, _connection: &Connection) -> std::result::Result<LoginOutcome, AuthError> {
        self.cancelled.store(false, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let open = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(open, Ordering::SeqCst);

        let finished = self.wait();
        self.active.fetch_sub(1, Ordering::SeqCst);
        if finished {
            self.outcome.clone()
        } else {
            Ok(LoginOutcome::Cancelled)
        }
    }

    fn cancel(&self, _connection: &Connection) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// In-memory credential store whose next `get` / `remove` calls can be made to fail
#[derive(Default)]
pub struct FlakyCredentialStore {
    pub inner: MemoryCredentialStore,
    get_failures: AtomicUsize,
    remove_failures: AtomicUsize,
}

impl FlakyCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_gets(&self, count: usize) {
        self.get_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_removes(&self, count: usize) {
        self.remove_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl CredentialStore for FlakyCredentialStore {
    fn get(&self, id: &ConnectionId) -> Result<Option<RefreshMaterial>> {
        if Self::take_failure(&self.get_failures) {
            return Err(AuthError::Storage("disk busy".to_string()));
        }
        self.inner.get(id)
    }

    fn put(&self, id: &ConnectionId, material: &RefreshMaterial) -> Result<()> {
        self.inner.put(id, material)
    }

    fn remove(&self, id: &ConnectionId) -> Result<bool> {
        if Self::take_failure(&self.remove_failures) {
            return Err(AuthError::Storage("disk busy".to_string()));
        }
        self.inner.remove(id)
    }
}
