// Per-connection token state store
// Single source of truth for authentication state

use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::types::{StateChange, TokenState};
use crate::connection::ConnectionId;

/// Per-connection cell
/// `commit` serializes writers, `state` is what readers see
#[derive(Default)]
struct StateCell {
    commit: Mutex<()>,
    state: RwLock<TokenState>,
}

/// Thread-safe store of the current `TokenState` per connection
///
/// Locking is per connection id: writers for different connections never
/// contend, and readers only take the short value lock, so a reader is
/// never blocked behind a writer that is still publishing its change.
#[derive(Default)]
pub struct TokenStateStore {
    cells: DashMap<ConnectionId, Arc<StateCell>>,
}

impl TokenStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: &ConnectionId) -> Arc<StateCell> {
        if let Some(cell) = self.cells.get(id) {
            return Arc::clone(cell.value());
        }
        Arc::clone(self.cells.entry(id.clone()).or_default().value())
    }

    /// Last committed state, `NotAuthenticated` for unknown ids
    pub fn get(&self, id: &ConnectionId) -> TokenState {
        let cell = match self.cells.get(id) {
            Some(cell) => Arc::clone(cell.value()),
            None => return TokenState::NotAuthenticated,
        };
        let state = cell.state.read().unwrap_or_else(|e| e.into_inner());
        state.clone()
    }

    /// Replace the state, returning the previous one if it changed
    pub fn set(&self, id: &ConnectionId, new_state: TokenState) -> Option<TokenState> {
        self.commit(id, new_state, |_| {}).map(|change| change.old)
    }

    /// Replace the state and run `on_change` before releasing the commit lock
    ///
    /// Two commits on the same connection run their `on_change` callbacks in
    /// the order the states were written. `on_change` may read the store but
    /// must not commit to the same connection.
    pub fn commit<F>(&self, id: &ConnectionId, new_state: TokenState, on_change: F) -> Option<StateChange>
    where
        F: FnOnce(&StateChange),
    {
        let cell = self.cell(id);
        let _commit = cell.commit.lock().unwrap_or_else(|e| e.into_inner());

        let old = {
            let mut state = cell.state.write().unwrap_or_else(|e| e.into_inner());
            if *state == new_state {
                return None;
            }
            std::mem::replace(&mut *state, new_state.clone())
        };

        let change = StateChange {
            connection_id: id.clone(),
            old,
            new: new_state,
        };
        tracing::debug!(
            connection = %change.connection_id,
            old = %change.old,
            new = %change.new,
            "Token state committed"
        );
        on_change(&change);
        Some(change)
    }

    /// Forget a connection entirely
    pub fn remove(&self, id: &ConnectionId) -> Option<TokenState> {
        self.cells.remove(id).map(|(_, cell)| {
            let state = cell.state.read().unwrap_or_else(|e| e.into_inner());
            state.clone()
        })
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.cells.contains_key(id)
    }

    /// Copy of every known state, sorted by connection id
    pub fn snapshot(&self) -> Vec<(ConnectionId, TokenState)> {
        let cells: Vec<(ConnectionId, Arc<StateCell>)> = self
            .cells
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut states: Vec<(ConnectionId, TokenState)> = cells
            .into_iter()
            .map(|(id, cell)| {
                let state = cell.state.read().unwrap_or_else(|e| e.into_inner());
                (id, state.clone())
            })
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
