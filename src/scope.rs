//! The shared blackboard threaded through one workflow execution.
//!
//! A [`Scope`] holds the variable map every agent reads from and writes to,
//! plus an append-only log of [`Invocation`]s. Child scopes share the
//! variable map with their parent but keep their own log, so a nested
//! workflow can report its history without mixing it into the caller's.

use crate::invocation::PendingInvocation;
use crate::value::TypeMismatch;
use crate::{Invocation, Value};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type DestroyHook = Box<dyn FnOnce(&ScopeSnapshot) + Send>;

/// Everything a scope held, captured when the scope is torn down.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeSnapshot {
    pub state: BTreeMap<String, Value>,
    pub invocations: Vec<Invocation>,
}

/// Handle to a shared scope. Clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    shared: Arc<Shared>,
    log: Arc<LogNode>,
}

struct Shared {
    vars: RwLock<HashMap<String, Value>>,
    sequence: AtomicU64,
    root_log: Arc<LogNode>,
    destroy_hooks: Mutex<Vec<DestroyHook>>,
}

struct LogNode {
    label: String,
    entries: Mutex<Vec<Invocation>>,
    children: Mutex<Vec<Arc<LogNode>>>,
}

impl LogNode {
    fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            entries: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
        })
    }

    fn collect(&self, out: &mut Vec<Invocation>) {
        out.extend(self.entries.lock().iter().cloned());
        for child in self.children.lock().iter() {
            child.collect(out);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let hooks = std::mem::take(self.destroy_hooks.get_mut());
        if hooks.is_empty() {
            return;
        }
        let mut invocations = Vec::new();
        self.root_log.collect(&mut invocations);
        invocations.sort_by_key(|i| i.sequence);
        let snapshot = ScopeSnapshot {
            state: self
                .vars
                .get_mut()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            invocations,
        };
        for hook in hooks {
            hook(&snapshot);
        }
    }
}

impl Scope {
    pub fn new() -> Self {
        Self::with_label("root")
    }

    pub fn with_label(label: impl Into<String>) -> Self {
        let log = LogNode::new(label);
        Self {
            shared: Arc::new(Shared {
                vars: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                root_log: Arc::clone(&log),
                destroy_hooks: Mutex::new(Vec::new()),
            }),
            log,
        }
    }

    /// Create a child that shares this scope's variables but logs separately.
    pub fn child(&self, label: impl Into<String>) -> Scope {
        let log = LogNode::new(label);
        self.log.children.lock().push(Arc::clone(&log));
        Scope {
            shared: Arc::clone(&self.shared),
            log,
        }
    }

    pub fn label(&self) -> &str {
        &self.log.label
    }

    // --- variables ---

    pub fn read(&self, key: &str) -> Option<Value> {
        self.shared.vars.read().get(key).cloned()
    }

    pub fn read_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.read(key).unwrap_or_else(|| default.into())
    }

    pub fn read_text(&self, key: &str) -> Result<Option<String>, TypeMismatch> {
        self.read(key)
            .map(|v| v.as_text().map(str::to_string))
            .transpose()
    }

    pub fn read_number(&self, key: &str) -> Result<Option<f64>, TypeMismatch> {
        self.read(key).map(|v| v.as_number()).transpose()
    }

    pub fn read_bool(&self, key: &str) -> Result<Option<bool>, TypeMismatch> {
        self.read(key).map(|v| v.as_bool()).transpose()
    }

    pub fn write(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.shared.vars.write().insert(key.into(), value.into());
    }

    /// Write several variables under one lock acquisition.
    pub fn write_all<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let mut vars = self.shared.vars.write();
        for (k, v) in entries {
            vars.insert(k.into(), v.into());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.shared.vars.write().remove(key)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.shared.vars.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.vars.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of the current variables, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.shared
            .vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // --- invocation log ---

    pub(crate) fn append_invocation(&self, pending: PendingInvocation) -> Invocation {
        // Sequence assignment and push happen under the entries lock so this
        // node's log is always ordered by sequence.
        let mut entries = self.log.entries.lock();
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        let record = pending.seal(sequence);
        entries.push(record.clone());
        record
    }

    /// Invocations recorded directly in this scope, oldest first.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.entries.lock().clone()
    }

    pub fn invocations_of(&self, agent: &str) -> Vec<Invocation> {
        self.log
            .entries
            .lock()
            .iter()
            .filter(|i| i.agent == agent)
            .cloned()
            .collect()
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.log.entries.lock().last().cloned()
    }

    /// Invocations of this scope and every descendant, merged by sequence.
    pub fn all_invocations(&self) -> Vec<Invocation> {
        let mut out = Vec::new();
        self.log.collect(&mut out);
        out.sort_by_key(|i| i.sequence);
        out
    }

    /// Register a hook that runs when the last handle to this scope tree drops.
    pub fn on_destroy(&self, hook: impl FnOnce(&ScopeSnapshot) + Send + 'static) {
        self.shared.destroy_hooks.lock().push(Box::new(hook));
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("label", &self.log.label)
            .field("keys", &self.keys())
            .finish()
    }
}
