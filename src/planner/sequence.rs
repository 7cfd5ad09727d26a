use super::{Action, InitContext, Planner};
use crate::error::ExecError;
use crate::{Invocation, Scope};

/// Calls agents one after another in a fixed order.
///
/// Each agent sees the outputs of the ones before it through the scope.
#[derive(Debug, Default, Clone)]
pub struct SequencePlanner {
    order: Vec<String>,
    cursor: usize,
}

impl SequencePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit order instead of the declaration order.
    pub fn with_order<I, S>(order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
            cursor: 0,
        }
    }
}

impl Planner for SequencePlanner {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), ExecError> {
        if self.order.is_empty() {
            self.order = ctx.agent_names();
        }
        self.cursor = 0;
        Ok(())
    }

    fn next_action(
        &mut self,
        _scope: &Scope,
        _previous: Option<&Invocation>,
    ) -> Result<Action, ExecError> {
        let Some(next) = self.order.get(self.cursor) else {
            return Ok(Action::Done);
        };
        self.cursor += 1;
        Ok(Action::call(next.clone()))
    }
}
