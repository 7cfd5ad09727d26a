//! Planners decide, after every agent call, what the workflow does next.
//!
//! A planner never runs agents itself. It returns an [`Action`] and the
//! runner carries it out, then reports the resulting [`Invocation`] back
//! through [`Planner::next_action`]. The workflow ends the first time a
//! planner returns [`Action::Done`] or [`Action::DoneWithResult`].

mod conditional;
mod looping;
mod parallel;
mod sequence;

pub use conditional::ConditionalPlanner;
pub use looping::{ExitCheck, LoopPlanner};
pub use parallel::ParallelPlanner;
pub use sequence::SequencePlanner;

use crate::error::ExecError;
use crate::executor::AgentExecutor;
use crate::{Invocation, Scope, Value};
use std::sync::Arc;

/// Predicate over the scope and a count (loop iterations or P2P invocations)
/// used to end a workflow early.
pub type ExitCondition = Arc<dyn Fn(&Scope, usize) -> bool + Send + Sync>;

/// Predicate gating a conditional agent.
pub type Condition = Arc<dyn Fn(&Scope) -> bool + Send + Sync>;

/// Computes a workflow result from the settled scope.
pub type OutputFn = Arc<dyn Fn(&Scope) -> Result<Value, ExecError> + Send + Sync>;

/// The planner's instruction for what happens next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Stop without a result of the planner's own.
    Done,
    /// Stop and use this value as the workflow result.
    DoneWithResult(Value),
    /// Run these agents next. More than one name fans out concurrently.
    Call(Vec<String>),
    /// Nothing to do for this report.
    NoOp,
}

impl Action {
    pub fn call(name: impl Into<String>) -> Self {
        Self::Call(vec![name.into()])
    }

    pub fn call_all<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Call(names.into_iter().map(Into::into).collect())
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done | Self::DoneWithResult(_))
    }
}

/// What a planner learns once, before the first action.
pub struct InitContext<'a> {
    /// Every agent the planner may call, in declaration order.
    pub agents: &'a [AgentExecutor],
    pub scope: &'a Scope,
}

impl InitContext<'_> {
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.name().to_string()).collect()
    }
}

/// Pluggable control-flow strategy.
///
/// `next_action` should depend only on the scope, the reported invocation,
/// and state the planner set up in `init`, so a run can be replayed from a
/// scope snapshot.
pub trait Planner: Send {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), ExecError> {
        let _ = ctx;
        Ok(())
    }

    /// Called exactly once, before any agent has run.
    fn first_action(&mut self, scope: &Scope) -> Result<Action, ExecError> {
        self.next_action(scope, None)
    }

    /// Called after every agent invocation.
    fn next_action(
        &mut self,
        scope: &Scope,
        previous: Option<&Invocation>,
    ) -> Result<Action, ExecError>;
}
