//! Peer-to-peer activation: agents run whenever their inputs change.
//!
//! Every agent is wrapped in an activator. Writing an output notifies every
//! peer that lists it as an input, and a notified peer runs again as soon as
//! it is idle and all of its required inputs are present. The run ends when
//! nothing is in flight, or earlier on an exit condition, the invocation
//! budget, cancellation, or an aborted failure.

use crate::agent::AgentError;
use crate::cancel::CancellationToken;
use crate::error::ExecError;
use crate::executor::AgentExecutor;
use crate::planner::ExitCondition;
use crate::pool::Executor;
use crate::runner::run_guarded;
use crate::Scope;
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Limits and plumbing for one peer-to-peer run.
pub(crate) struct P2pSettings {
    pub max_invocations: usize,
    pub strict_budget: bool,
    pub exit: Option<ExitCondition>,
    pub cancellation: Option<CancellationToken>,
    pub executor: Arc<dyn Executor>,
}

struct Activator {
    exec: AgentExecutor,
    inputs: Vec<String>,
    state: Mutex<ActivatorState>,
}

#[derive(Default)]
struct ActivatorState {
    /// Owed another run.
    should_execute: bool,
    /// A loop for this activator is live. At most one at a time.
    running: bool,
}

#[derive(Default)]
struct Settle {
    in_flight: usize,
    terminating: bool,
}

struct Engine {
    workflow: String,
    scope: Scope,
    activators: Vec<Activator>,
    max_invocations: usize,
    exit: Option<ExitCondition>,
    cancellation: Option<CancellationToken>,
    executor: Arc<dyn Executor>,
    // Lock order: `settle` before any activator `state`.
    settle: Mutex<Settle>,
    settled: Condvar,
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    budget_hit: AtomicBool,
    cancelled: AtomicBool,
    failure: Mutex<Option<ExecError>>,
}

/// Run `agents` as peers over `scope` until they settle.
///
/// Returns the number of completed invocations.
pub(crate) fn run_p2p(
    workflow: &str,
    agents: &[AgentExecutor],
    scope: &Scope,
    settings: &P2pSettings,
) -> Result<usize, ExecError> {
    let engine = Arc::new(Engine {
        workflow: workflow.to_string(),
        scope: scope.clone(),
        activators: agents
            .iter()
            .map(|exec| Activator {
                exec: exec.clone(),
                inputs: exec.argument_names().into_iter().map(str::to_string).collect(),
                state: Mutex::new(ActivatorState {
                    should_execute: true,
                    running: false,
                }),
            })
            .collect(),
        max_invocations: settings.max_invocations,
        exit: settings.exit.clone(),
        cancellation: settings.cancellation.clone(),
        executor: Arc::clone(&settings.executor),
        settle: Mutex::new(Settle::default()),
        settled: Condvar::new(),
        dispatched: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        budget_hit: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        failure: Mutex::new(None),
    });

    for idx in 0..engine.activators.len() {
        engine.try_launch(idx);
    }
    engine.wait_settled();

    let completed = engine.completed.load(Ordering::SeqCst);
    if let Some(err) = engine.failure.lock().take() {
        return Err(err);
    }
    if engine.cancelled.load(Ordering::SeqCst) {
        return Err(ExecError::Cancelled);
    }
    if engine.budget_hit.load(Ordering::SeqCst) {
        if settings.strict_budget {
            return Err(ExecError::BudgetExceeded {
                limit: settings.max_invocations,
                unit: "invocations",
            });
        }
        tracing::warn!(
            workflow,
            max_invocations = settings.max_invocations,
            "invocation budget reached, stopping"
        );
    }
    tracing::debug!(workflow, completed, "peers settled");
    Ok(completed)
}

impl Engine {
    /// Start the activator's loop if it is owed a run, idle and runnable.
    ///
    /// The run-right is taken under the same lock that publishes
    /// `terminating`, so nothing launches once shutdown has begun.
    fn try_launch(self: &Arc<Self>, idx: usize) {
        let activator = &self.activators[idx];
        {
            let mut settle = self.settle.lock();
            if settle.terminating {
                return;
            }
            let mut state = activator.state.lock();
            if state.running || !state.should_execute || !activator.exec.can_run(&self.scope) {
                return;
            }
            state.running = true;
            state.should_execute = false;
            settle.in_flight += 1;
        }
        tracing::debug!(workflow = %self.workflow, agent = activator.exec.name(), "activating");
        let engine = Arc::clone(self);
        self.executor
            .execute(Box::new(move || engine.activation_loop(idx)));
    }

    /// Runs on a worker. A panic outside the agent call (in the exit
    /// condition, say) still hands back the run-right so the caller's wait
    /// ends.
    fn activation_loop(self: Arc<Self>, idx: usize) {
        if catch_unwind(AssertUnwindSafe(|| self.drive(idx))).is_err() {
            let agent = self.activators[idx].exec.name();
            tracing::warn!(workflow = %self.workflow, agent, "activation loop panicked");
            self.failure.lock().get_or_insert(ExecError::AgentExecution {
                agent: agent.to_string(),
                source: AgentError::other("activation loop panicked"),
            });
            self.terminate("activation loop panicked");
            self.release(idx);
        }
    }

    fn drive(self: &Arc<Self>, idx: usize) {
        let activator = &self.activators[idx];
        loop {
            if self.is_cancelled() {
                self.cancelled.store(true, Ordering::SeqCst);
                self.terminate("cancelled");
                break;
            }
            if !self.reserve_slot() {
                self.budget_hit.store(true, Ordering::SeqCst);
                self.terminate("invocation budget reached");
                break;
            }

            match run_guarded(&activator.exec, &self.scope) {
                Ok(_) => {
                    let count = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if self.exit.as_ref().is_some_and(|exit| exit(&self.scope, count)) {
                        self.terminate("exit condition met");
                        break;
                    }
                    self.notify(idx, activator.exec.output_name());
                }
                Err(err) => {
                    tracing::warn!(workflow = %self.workflow, agent = activator.exec.name(), %err, "peer aborted");
                    self.failure.lock().get_or_insert(err);
                    self.terminate("agent aborted");
                    break;
                }
            }

            if !self.continue_or_release(idx) {
                return;
            }
        }
        self.release(idx);
    }

    /// Mark every peer that reads `variable` as owed a run and launch the idle
    /// ones. The writer itself is skipped.
    fn notify(self: &Arc<Self>, writer: usize, variable: &str) {
        for (idx, peer) in self.activators.iter().enumerate() {
            if idx == writer || !peer.inputs.iter().any(|input| input == variable) {
                continue;
            }
            peer.state.lock().should_execute = true;
            self.try_launch(idx);
        }
    }

    /// Either claim the next owed run for this loop or go idle.
    fn continue_or_release(&self, idx: usize) -> bool {
        let activator = &self.activators[idx];
        let mut settle = self.settle.lock();
        let mut state = activator.state.lock();
        if state.should_execute && !settle.terminating && activator.exec.can_run(&self.scope) {
            state.should_execute = false;
            return true;
        }
        state.running = false;
        Self::leave(&mut settle, &self.settled);
        false
    }

    fn release(&self, idx: usize) {
        let mut settle = self.settle.lock();
        self.activators[idx].state.lock().running = false;
        Self::leave(&mut settle, &self.settled);
    }

    fn leave(settle: &mut Settle, settled: &Condvar) {
        settle.in_flight -= 1;
        if settle.in_flight == 0 {
            settled.notify_all();
        }
    }

    fn terminate(&self, reason: &str) {
        let mut settle = self.settle.lock();
        if !settle.terminating {
            tracing::debug!(workflow = %self.workflow, reason, "terminating peers");
            settle.terminating = true;
        }
    }

    fn wait_settled(&self) {
        let mut settle = self.settle.lock();
        while settle.in_flight > 0 {
            self.settled.wait(&mut settle);
        }
        settle.terminating = true;
    }

    fn reserve_slot(&self) -> bool {
        self.dispatched
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_invocations).then_some(n + 1)
            })
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
