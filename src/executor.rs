//! Runs a single agent against a scope and applies error recovery.

use crate::agent::{Agent, AgentError, Inputs};
use crate::error::ExecError;
use crate::hooks::{AgentStartEvent, ErrorEvent, Hooks, InvocationEvent};
use crate::invocation::{InvocationOutcome, PendingInvocation, RecoveryAction};
use crate::{Invocation, Scope, Value};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// What to do after an agent call failed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorRecovery {
    /// Call the same agent again, re-reading its inputs from the scope.
    Retry,
    /// Carry on as if the agent had produced this value.
    SubstituteOutput(Value),
    /// Fail the whole workflow.
    #[default]
    Abort,
}

/// Everything an error handler gets to look at.
pub struct ErrorContext<'a> {
    pub agent: &'a str,
    pub inputs: &'a Inputs,
    pub error: &'a AgentError,
    /// 1 for the first attempt.
    pub attempt: usize,
    /// The live scope. A handler may write missing state before retrying.
    pub scope: &'a Scope,
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorContext) -> ErrorRecovery + Send + Sync>;

/// Per-workflow settings every executor of that workflow shares.
pub(crate) struct ExecPolicy {
    pub workflow: String,
    pub error_handler: Option<ErrorHandler>,
    pub max_retries: usize,
    pub hooks: Hooks,
}

/// Wraps one agent for execution inside a workflow.
#[derive(Clone)]
pub struct AgentExecutor {
    agent: Arc<dyn Agent>,
    policy: Arc<ExecPolicy>,
}

impl AgentExecutor {
    pub(crate) fn new(agent: Arc<dyn Agent>, policy: Arc<ExecPolicy>) -> Self {
        Self { agent, policy }
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }

    pub fn argument_names(&self) -> Vec<&str> {
        self.agent.argument_names()
    }

    pub fn output_name(&self) -> &str {
        self.agent.output_name()
    }

    /// True when every required input is present in `scope`.
    pub fn can_run(&self, scope: &Scope) -> bool {
        self.agent
            .spec()
            .required_arguments()
            .all(|arg| scope.has_key(arg))
    }

    fn resolve_inputs(&self, scope: &Scope) -> Result<Inputs, ExecError> {
        let mut inputs = Inputs::new();
        for arg in &self.agent.spec().arguments {
            match (scope.read(&arg.name), &arg.default) {
                (Some(value), _) => inputs.insert(arg.name.clone(), value),
                (None, Some(default)) => inputs.insert(arg.name.clone(), default.clone()),
                (None, None) => return Err(ExecError::missing(self.name(), &arg.name)),
            }
        }
        Ok(inputs)
    }

    /// Invoke the agent, write its output into `scope`, and record the call.
    ///
    /// Returns the invocation the next planning step should look at: either
    /// the completed call or the failure whose output was substituted.
    pub fn run(&self, scope: &Scope) -> Result<Invocation, ExecError> {
        let name = self.name();
        let mut attempt = 1;

        loop {
            let inputs = self.resolve_inputs(scope)?;
            let started_at = Utc::now();
            let clock = Instant::now();
            tracing::debug!(workflow = %self.policy.workflow, agent = name, attempt, "invoking agent");
            self.policy.hooks.agent_start(&AgentStartEvent {
                workflow: &self.policy.workflow,
                agent: name,
                inputs: &inputs,
                attempt,
            });

            let error = match self.agent.invoke_in_scope(scope, &inputs) {
                Ok(value) => {
                    scope.write(self.output_name(), value.clone());
                    let record = scope.append_invocation(PendingInvocation {
                        agent: name.to_string(),
                        inputs: inputs.into_map(),
                        outcome: InvocationOutcome::Completed(value),
                        started_at,
                    });
                    self.policy.hooks.invocation(&InvocationEvent {
                        workflow: &self.policy.workflow,
                        invocation: &record,
                        duration: clock.elapsed(),
                    });
                    return Ok(record);
                }
                Err(AgentError::Workflow(inner)) if inner.is_wiring_error() => return Err(*inner),
                Err(error) => error,
            };

            let mut decision = match &self.policy.error_handler {
                Some(handler) => handler(&ErrorContext {
                    agent: name,
                    inputs: &inputs,
                    error: &error,
                    attempt,
                    scope,
                }),
                None => ErrorRecovery::Abort,
            };
            if decision == ErrorRecovery::Retry && attempt > self.policy.max_retries {
                tracing::warn!(
                    workflow = %self.policy.workflow,
                    agent = name,
                    max_retries = self.policy.max_retries,
                    "retries exhausted, aborting"
                );
                decision = ErrorRecovery::Abort;
            }

            let recovery = match &decision {
                ErrorRecovery::Retry => RecoveryAction::Retried,
                ErrorRecovery::SubstituteOutput(v) => RecoveryAction::Substituted(v.clone()),
                ErrorRecovery::Abort => RecoveryAction::Aborted,
            };
            self.policy.hooks.error(&ErrorEvent {
                workflow: &self.policy.workflow,
                agent: name,
                error: &error,
                attempt,
                recovery: &recovery,
            });

            if let ErrorRecovery::SubstituteOutput(value) = &decision {
                scope.write(self.output_name(), value.clone());
            }
            let record = scope.append_invocation(PendingInvocation {
                agent: name.to_string(),
                inputs: inputs.into_map(),
                outcome: InvocationOutcome::Failed {
                    error: error.to_string(),
                    recovery,
                },
                started_at,
            });

            match decision {
                ErrorRecovery::Retry => {
                    tracing::info!(workflow = %self.policy.workflow, agent = name, attempt, %error, "retrying agent");
                    attempt += 1;
                }
                ErrorRecovery::SubstituteOutput(_) => {
                    tracing::info!(workflow = %self.policy.workflow, agent = name, %error, "substituted agent output");
                    self.policy.hooks.invocation(&InvocationEvent {
                        workflow: &self.policy.workflow,
                        invocation: &record,
                        duration: clock.elapsed(),
                    });
                    return Ok(record);
                }
                ErrorRecovery::Abort => {
                    return Err(ExecError::AgentExecution {
                        agent: name.to_string(),
                        source: error,
                    });
                }
            }
        }
    }
}

impl fmt::Debug for AgentExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentExecutor")
            .field("agent", &self.name())
            .field("arguments", &self.argument_names())
            .field("output", &self.output_name())
            .finish()
    }
}
