use crate::agent::{AgentError, Inputs};
use crate::{Invocation, RecoveryAction, Scope};
use std::sync::Arc;
use std::time::Duration;

/// Passed to the `before_invocation` hook once inputs are resolved, right
/// before each attempt.
pub struct AgentStartEvent<'a> {
    pub workflow: &'a str,
    pub agent: &'a str,
    pub inputs: &'a Inputs,
    /// 1 for the first attempt.
    pub attempt: usize,
}

/// Passed to the `on_invocation` hook after each recorded agent call.
pub struct InvocationEvent<'a> {
    pub workflow: &'a str,
    pub invocation: &'a Invocation,
    pub duration: Duration,
}

/// Passed to the `on_error` hook when an agent call fails.
pub struct ErrorEvent<'a> {
    pub workflow: &'a str,
    pub agent: &'a str,
    pub error: &'a AgentError,
    /// 1 for the first attempt.
    pub attempt: usize,
    pub recovery: &'a RecoveryAction,
}

type StartHook = Arc<dyn Fn(&AgentStartEvent) + Send + Sync>;
type InvocationHook = Arc<dyn Fn(&InvocationEvent) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;
type ScopeHook = Arc<dyn Fn(&Scope) + Send + Sync>;

/// Observer callbacks attached to a workflow. Hooks may fire from worker
/// threads, so they must be `Send + Sync`.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) before_invocation: Option<StartHook>,
    pub(crate) on_invocation: Option<InvocationHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) before_call: Option<ScopeHook>,
}

impl Hooks {
    pub(crate) fn agent_start(&self, event: &AgentStartEvent) {
        if let Some(cb) = &self.before_invocation {
            cb(event);
        }
    }

    pub(crate) fn invocation(&self, event: &InvocationEvent) {
        if let Some(cb) = &self.on_invocation {
            cb(event);
        }
    }

    pub(crate) fn error(&self, event: &ErrorEvent) {
        if let Some(cb) = &self.on_error {
            cb(event);
        }
    }

    pub(crate) fn before_call(&self, scope: &Scope) {
        if let Some(cb) = &self.before_call {
            cb(scope);
        }
    }
}
