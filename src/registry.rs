use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::exchange::AbortHandle;

#[derive(Debug, Default)]
struct ScopeState {
    aborted: bool,
    active: Option<AbortHandle>,
}

/// Cancellation scope of one correlation id. The OAuth call and the main
/// call attach to it in turn, so a single abort reaches whichever is active.
#[derive(Clone, Debug)]
pub struct CancelScope {
    id: String,
    state: Arc<Mutex<ScopeState>>,
}

impl CancelScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(ScopeState::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attaching to an aborted scope aborts the call right away.
    pub fn attach(&self, handle: AbortHandle) {
        let mut state = self.state.lock();
        if state.aborted {
            tracing::debug!("scope {} already aborted", self.id);
            handle.abort();
        }
        state.active = Some(handle);
    }

    pub fn detach(&self) {
        self.state.lock().active = None;
    }

    pub fn active(&self) -> Option<AbortHandle> {
        self.state.lock().active.clone()
    }

    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        if let Some(handle) = state.active.as_ref() {
            handle.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

/// In-flight calls by correlation id. Entries are removed when the owning
/// send finishes.
#[derive(Clone, Debug, Default)]
pub struct InFlightRegistry {
    scopes: Arc<Mutex<HashMap<String, CancelScope>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing scope for `id`, or registers a new one.
    pub fn open(&self, id: &str) -> CancelScope {
        self.scopes
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| CancelScope::new(id))
            .clone()
    }

    pub fn close(&self, id: &str) {
        if self.scopes.lock().remove(id).is_some() {
            tracing::trace!("closed scope {}", id);
        }
    }

    /// Returns false when nothing is in flight under `id`.
    pub fn abort(&self, id: &str) -> bool {
        let scope = self.scopes.lock().get(id).cloned();
        match scope {
            Some(scope) => {
                tracing::debug!("aborting {}", id);
                scope.abort();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scopes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.scopes.lock().contains_key(id)
    }
}
