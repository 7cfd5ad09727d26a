use crate::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Immutable record of one agent execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    /// Position in the scope tree's log. Strictly increasing in append order.
    pub sequence: u64,
    pub agent: String,
    /// The inputs the agent was called with.
    pub inputs: BTreeMap<String, Value>,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum InvocationOutcome {
    Completed(Value),
    Failed {
        error: String,
        recovery: RecoveryAction,
    },
}

/// What the error handler decided after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecoveryAction {
    Retried,
    Substituted(Value),
    Aborted,
}

impl Invocation {
    /// The value downstream agents observe from this invocation, if any.
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            InvocationOutcome::Completed(v) => Some(v),
            InvocationOutcome::Failed {
                recovery: RecoveryAction::Substituted(v),
                ..
            } => Some(v),
            InvocationOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Failed { .. })
    }

    /// True when the two executions overlapped in wall-clock time.
    pub fn overlaps(&self, other: &Invocation) -> bool {
        self.started_at < other.finished_at && other.started_at < self.finished_at
    }
}

/// An invocation before the scope assigned its sequence number.
pub(crate) struct PendingInvocation {
    pub agent: String,
    pub inputs: BTreeMap<String, Value>,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
}

impl PendingInvocation {
    pub fn seal(self, sequence: u64) -> Invocation {
        Invocation {
            sequence,
            agent: self.agent,
            inputs: self.inputs,
            outcome: self.outcome,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
