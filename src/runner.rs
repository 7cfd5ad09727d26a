//! Drives a [`Planner`] until it reports that the workflow is done.

use crate::agent::AgentError;
use crate::cancel::CancellationToken;
use crate::error::ExecError;
use crate::executor::AgentExecutor;
use crate::planner::{Action, InitContext, Planner};
use crate::pool::Executor;
use crate::{Invocation, Scope, Value};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Limits and plumbing for one planner run.
pub(crate) struct RunSettings {
    pub max_steps: usize,
    pub strict_budget: bool,
    pub cancellation: Option<CancellationToken>,
    pub executor: Arc<dyn Executor>,
}

/// Run `planner` over `agents` until it returns a terminal action.
///
/// Returns the planner's own result when it ended with
/// [`Action::DoneWithResult`], `None` when it ended with [`Action::Done`]
/// or was cut off by the step budget.
pub(crate) fn run_planner(
    workflow: &str,
    planner: &mut dyn Planner,
    agents: &[AgentExecutor],
    scope: &Scope,
    settings: &RunSettings,
) -> Result<Option<Value>, ExecError> {
    planner.init(&InitContext { agents, scope })?;
    let mut action = planner.first_action(scope)?;
    let mut step_number: usize = 0;

    loop {
        let names = match action {
            Action::Done => return Ok(None),
            Action::DoneWithResult(value) => return Ok(Some(value)),
            Action::NoOp => Vec::new(),
            Action::Call(names) => names,
        };

        if step_number >= settings.max_steps {
            if settings.strict_budget {
                return Err(ExecError::BudgetExceeded {
                    limit: settings.max_steps,
                    unit: "steps",
                });
            }
            tracing::warn!(
                workflow,
                max_steps = settings.max_steps,
                "max_steps reached (possible infinite loop), stopping"
            );
            return Ok(None);
        }
        step_number += 1;

        if names.is_empty() {
            // Nothing is in flight in a planner run, so just ask again.
            action = planner.next_action(scope, None)?;
            continue;
        }

        if settings
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            tracing::info!(workflow, step_number, "workflow cancelled");
            return Err(ExecError::Cancelled);
        }

        let batch = resolve(agents, &names)?;
        tracing::debug!(workflow, step_number, agents = ?names, "dispatching");

        action = if let [single] = batch.as_slice() {
            let record = single.run(scope)?;
            planner.next_action(scope, Some(&record))?
        } else {
            let records = fan_out(&batch, scope, settings.executor.as_ref())?;
            let mut composed = Action::NoOp;
            for record in &records {
                let next = planner.next_action(scope, Some(record))?;
                composed = compose(composed, next)?;
            }
            composed
        };
    }
}

fn resolve(agents: &[AgentExecutor], names: &[String]) -> Result<Vec<AgentExecutor>, ExecError> {
    let mut batch: Vec<AgentExecutor> = Vec::with_capacity(names.len());
    for name in names {
        if batch.iter().any(|a| a.name() == name) {
            continue;
        }
        let exec = agents
            .iter()
            .find(|a| a.name() == name)
            .ok_or_else(|| ExecError::PlannerContract(format!("unknown agent '{name}'")))?;
        batch.push(exec.clone());
    }
    Ok(batch)
}

/// Run every executor concurrently and wait for all of them.
///
/// Records come back in completion order. If any branch fails, the first
/// failure is returned once every branch has finished.
fn fan_out(
    batch: &[AgentExecutor],
    scope: &Scope,
    executor: &dyn Executor,
) -> Result<Vec<Invocation>, ExecError> {
    let (tx, rx) = crossbeam_channel::unbounded();
    for exec in batch {
        let exec = exec.clone();
        let scope = scope.clone();
        let tx = tx.clone();
        executor.execute(Box::new(move || {
            let result = run_guarded(&exec, &scope);
            let _ = tx.send(result);
        }));
    }
    drop(tx);

    let mut records = Vec::with_capacity(batch.len());
    let mut failure = None;
    for result in rx.iter() {
        match result {
            Ok(record) => records.push(record),
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(records),
    }
}

/// Run one executor, turning a panicking agent into an execution error.
pub(crate) fn run_guarded(exec: &AgentExecutor, scope: &Scope) -> Result<Invocation, ExecError> {
    catch_unwind(AssertUnwindSafe(|| exec.run(scope))).unwrap_or_else(|_| {
        Err(ExecError::AgentExecution {
            agent: exec.name().to_string(),
            source: AgentError::other("agent panicked"),
        })
    })
}

/// Fold the actions produced by one fan-out batch, in completion order.
///
/// The first terminal action wins; asking for more agents after it is a
/// contract violation.
fn compose(current: Action, next: Action) -> Result<Action, ExecError> {
    match (current, next) {
        (current, Action::NoOp) => Ok(current),
        (current, Action::Call(names)) if current.is_done() => Err(ExecError::PlannerContract(
            format!("planner asked for {names:?} after signalling done"),
        )),
        (current, _) if current.is_done() => Ok(current),
        (Action::Call(mut pending), Action::Call(more)) => {
            // An agent asked for twice in one batch still runs once.
            for name in more {
                if !pending.contains(&name) {
                    pending.push(name);
                }
            }
            Ok(Action::Call(pending))
        }
        (_, next) => Ok(next),
    }
}
