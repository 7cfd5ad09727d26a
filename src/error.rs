//! Runtime error taxonomy for workflow execution.

use crate::Value;
use crate::agent::AgentError;
use crate::value::TypeMismatch;
use std::collections::BTreeMap;

/// Errors raised while a workflow is executing.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A required input was absent from the scope. A wiring bug; never
    /// routed through the error handler.
    #[error("agent '{agent}' is missing required input '{key}'")]
    MissingInput { agent: String, key: String },

    /// The agent call itself failed and the error handler chose to abort.
    #[error("agent '{agent}' failed: {source}")]
    AgentExecution {
        agent: String,
        #[source]
        source: AgentError,
    },

    /// A planner asked for something the engine cannot do.
    #[error("planner contract violated: {0}")]
    PlannerContract(String),

    /// Only raised when strict budgets are enabled.
    #[error("budget of {limit} {unit} exceeded")]
    BudgetExceeded { limit: usize, unit: &'static str },

    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    #[error("workflow cancelled")]
    Cancelled,
}

impl ExecError {
    /// Name of the agent the error originated from, when there is one.
    pub fn agent(&self) -> Option<&str> {
        match self {
            Self::MissingInput { agent, .. } | Self::AgentExecution { agent, .. } => Some(agent),
            _ => None,
        }
    }

    /// Programming errors propagate immediately and skip error recovery.
    pub fn is_wiring_error(&self) -> bool {
        matches!(self, Self::MissingInput { .. } | Self::PlannerContract(_))
    }

    pub fn missing(agent: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingInput {
            agent: agent.into(),
            key: key.into(),
        }
    }
}

/// A failed workflow invocation, as seen by the caller.
///
/// Wraps the originating [`ExecError`] with the workflow and agent names and
/// the scope's variables at the moment of failure.
#[derive(Debug, thiserror::Error)]
#[error("workflow '{workflow}' failed{}: {source}", .agent.as_deref().map(|a| format!(" in agent '{a}'")).unwrap_or_default())]
pub struct InvokeError {
    pub workflow: String,
    pub agent: Option<String>,
    pub snapshot: BTreeMap<String, Value>,
    #[source]
    pub source: ExecError,
}

impl InvokeError {
    pub(crate) fn new(workflow: &str, snapshot: BTreeMap<String, Value>, source: ExecError) -> Self {
        Self {
            workflow: workflow.to_string(),
            agent: source.agent().map(str::to_string),
            snapshot,
            source,
        }
    }

    pub fn kind(&self) -> &ExecError {
        &self.source
    }

    pub fn into_kind(self) -> ExecError {
        self.source
    }
}
