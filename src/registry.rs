//! Scopes that outlive a single invocation, keyed by a caller memory id.

use crate::Scope;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Keeps one scope alive per memory id so repeated invocations for the same
/// conversation see each other's state.
///
/// Nothing is persisted; evicted or never-registered ids start empty.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: Mutex<HashMap<String, Scope>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scope registered for `id`, creating an empty one on first use.
    pub fn get_or_create(&self, id: &str) -> Scope {
        self.scopes
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!(memory_id = id, "creating scope");
                Scope::with_label(id)
            })
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Scope> {
        self.scopes.lock().get(id).cloned()
    }

    /// Forget the scope for `id`. Destroy hooks run once the last handle
    /// held elsewhere is dropped too.
    pub fn evict(&self, id: &str) -> Option<Scope> {
        self.scopes.lock().remove(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scopes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.lock().is_empty()
    }
}
