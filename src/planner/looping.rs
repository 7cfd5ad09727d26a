use super::{Action, ExitCondition, InitContext, Planner};
use crate::error::ExecError;
use crate::executor::AgentExecutor;
use crate::{Invocation, Scope};

/// When a loop evaluates its exit condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCheck {
    /// Once per completed iteration of the body.
    #[default]
    AfterIteration,
    /// After every agent call inside the body as well.
    AfterEachAgent,
}

/// Repeats a body planner until an exit condition holds or the iteration
/// cap is reached.
///
/// The cap is checked before the condition, so a condition that never
/// becomes true cannot keep the loop alive.
pub struct LoopPlanner {
    body: Box<dyn Planner>,
    agents: Vec<AgentExecutor>,
    max_iterations: usize,
    exit: Option<ExitCondition>,
    check: ExitCheck,
    iteration: usize,
}

impl LoopPlanner {
    pub fn new(body: Box<dyn Planner>, max_iterations: usize) -> Self {
        Self {
            body,
            agents: Vec::new(),
            max_iterations,
            exit: None,
            check: ExitCheck::default(),
            iteration: 0,
        }
    }

    pub fn exit_condition(mut self, exit: ExitCondition) -> Self {
        self.exit = Some(exit);
        self
    }

    pub fn exit_check(mut self, check: ExitCheck) -> Self {
        self.check = check;
        self
    }

    /// Completed iterations so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    fn should_exit(&self, scope: &Scope) -> bool {
        self.exit
            .as_ref()
            .is_some_and(|exit| exit(scope, self.iteration))
    }

    fn restart_body(&mut self, scope: &Scope) -> Result<Action, ExecError> {
        self.body.init(&InitContext {
            agents: &self.agents,
            scope,
        })?;
        self.body.first_action(scope)
    }
}

impl Planner for LoopPlanner {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), ExecError> {
        self.agents = ctx.agents.to_vec();
        self.iteration = 0;
        self.body.init(ctx)
    }

    fn first_action(&mut self, scope: &Scope) -> Result<Action, ExecError> {
        if self.max_iterations == 0 {
            return Ok(Action::Done);
        }
        self.body.first_action(scope)
    }

    fn next_action(
        &mut self,
        scope: &Scope,
        previous: Option<&Invocation>,
    ) -> Result<Action, ExecError> {
        if self.check == ExitCheck::AfterEachAgent && self.should_exit(scope) {
            tracing::debug!(iteration = self.iteration, "loop exit condition met mid-iteration");
            return Ok(Action::Done);
        }

        let action = self.body.next_action(scope, previous)?;
        if !action.is_done() {
            return Ok(action);
        }

        self.iteration += 1;
        if self.iteration >= self.max_iterations {
            tracing::debug!(iteration = self.iteration, "loop reached max iterations");
            return Ok(Action::Done);
        }
        if self.should_exit(scope) {
            tracing::debug!(iteration = self.iteration, "loop exit condition met");
            return Ok(Action::Done);
        }
        self.restart_body(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::SequencePlanner;
    use crate::planner::test_support::{executors, run};
    use std::sync::Arc;

    /// Drive the planner to completion and return the agents it called.
    fn drive(planner: &mut LoopPlanner, names: &[&str], scope: &Scope) -> Vec<String> {
        let execs = executors(names);
        planner
            .init(&InitContext {
                agents: &execs,
                scope,
            })
            .unwrap();
        let mut called = Vec::new();
        let mut action = planner.first_action(scope).unwrap();
        while let Action::Call(batch) = action {
            let record = run(&execs, &batch[0], scope);
            called.push(record.agent.clone());
            action = planner.next_action(scope, Some(&record)).unwrap();
        }
        called
    }

    #[test]
    fn stops_at_cap_when_condition_never_holds() {
        let scope = Scope::new();
        let mut planner = LoopPlanner::new(Box::new(SequencePlanner::new()), 4)
            .exit_condition(Arc::new(|_: &Scope, _: usize| false));
        let called = drive(&mut planner, &["body"], &scope);
        assert_eq!(called.len(), 4);
        assert_eq!(planner.iteration(), 4);
    }

    #[test]
    fn stops_when_condition_holds() {
        let scope = Scope::new();
        let mut planner = LoopPlanner::new(Box::new(SequencePlanner::new()), 10)
            .exit_condition(Arc::new(|_: &Scope, iteration: usize| iteration >= 3));
        let called = drive(&mut planner, &["writer", "scorer"], &scope);
        assert_eq!(called.len(), 6);
        assert_eq!(planner.iteration(), 3);
    }

    #[test]
    fn cap_checked_before_condition() {
        let scope = Scope::new();
        let evaluated = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&evaluated);
        let mut planner = LoopPlanner::new(Box::new(SequencePlanner::new()), 1).exit_condition(
            Arc::new(move |_: &Scope, _: usize| {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                false
            }),
        );
        drive(&mut planner, &["body"], &scope);
        assert_eq!(evaluated.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn after_each_agent_can_exit_mid_body() {
        let scope = Scope::new();
        let mut planner = LoopPlanner::new(Box::new(SequencePlanner::new()), 10)
            .exit_condition(Arc::new(|scope: &Scope, _: usize| scope.has_key("writer_out")))
            .exit_check(ExitCheck::AfterEachAgent);
        let called = drive(&mut planner, &["writer", "scorer"], &scope);
        assert_eq!(called, vec!["writer"]);
    }
}
