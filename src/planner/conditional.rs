use super::{Action, Condition, InitContext, Planner};
use crate::error::ExecError;
use crate::{Invocation, Scope};

/// Walks a list of guarded agents in order, calling each one whose
/// condition holds when its turn comes.
///
/// Conditions are evaluated lazily, so an earlier agent can change the scope
/// a later condition looks at.
#[derive(Default, Clone)]
pub struct ConditionalPlanner {
    branches: Vec<(Condition, String)>,
    cursor: usize,
}

impl ConditionalPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(mut self, condition: Condition, agent: impl Into<String>) -> Self {
        self.branches.push((condition, agent.into()));
        self
    }
}

impl Planner for ConditionalPlanner {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), ExecError> {
        let known = ctx.agent_names();
        if let Some((_, unknown)) = self.branches.iter().find(|(_, name)| !known.contains(name)) {
            return Err(ExecError::PlannerContract(format!(
                "conditional branch targets unknown agent '{unknown}'"
            )));
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_action(
        &mut self,
        scope: &Scope,
        _previous: Option<&Invocation>,
    ) -> Result<Action, ExecError> {
        while let Some((condition, agent)) = self.branches.get(self.cursor) {
            self.cursor += 1;
            if condition(scope) {
                return Ok(Action::call(agent.clone()));
            }
            tracing::trace!(agent = %agent, "condition not met, skipping");
        }
        Ok(Action::Done)
    }
}
