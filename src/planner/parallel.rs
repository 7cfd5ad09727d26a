use super::{Action, InitContext, OutputFn, Planner};
use crate::error::ExecError;
use crate::{Invocation, Scope};

/// Fans out to every agent at once and finishes when all have reported.
#[derive(Default, Clone)]
pub struct ParallelPlanner {
    agents: Vec<String>,
    pending: usize,
    merge: Option<OutputFn>,
}

impl ParallelPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine the branch outputs into the workflow result once all are in.
    pub fn with_merge(merge: OutputFn) -> Self {
        Self {
            merge: Some(merge),
            ..Self::default()
        }
    }

    fn finish(&self, scope: &Scope) -> Result<Action, ExecError> {
        match &self.merge {
            Some(merge) => Ok(Action::DoneWithResult(merge(scope)?)),
            None => Ok(Action::Done),
        }
    }
}

impl Planner for ParallelPlanner {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), ExecError> {
        self.agents = ctx.agent_names();
        self.pending = 0;
        Ok(())
    }

    fn first_action(&mut self, scope: &Scope) -> Result<Action, ExecError> {
        if self.agents.is_empty() {
            return self.finish(scope);
        }
        self.pending = self.agents.len();
        Ok(Action::Call(self.agents.clone()))
    }

    fn next_action(
        &mut self,
        scope: &Scope,
        _previous: Option<&Invocation>,
    ) -> Result<Action, ExecError> {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.finish(scope)
        } else {
            Ok(Action::NoOp)
        }
    }
}
