use crate::agent::{Agent, AgentError, AgentSpec, Argument, Inputs};
use crate::cancel::CancellationToken;
use crate::config::{ConfigError, EngineConfig};
use crate::error::{ExecError, InvokeError};
use crate::executor::{AgentExecutor, ErrorContext, ErrorHandler, ErrorRecovery, ExecPolicy};
use crate::hooks::{AgentStartEvent, ErrorEvent, Hooks, InvocationEvent};
use crate::p2p::{P2pSettings, run_p2p};
use crate::planner::{
    Condition, ConditionalPlanner, ExitCheck, ExitCondition, LoopPlanner, OutputFn,
    ParallelPlanner, Planner, SequencePlanner,
};
use crate::pool::{Executor, ThreadExecutor};
use crate::registry::ScopeRegistry;
use crate::runner::{RunSettings, run_planner};
use crate::{Scope, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Builds a fresh planner for every invocation of a custom workflow.
pub type PlannerFactory = Arc<dyn Fn() -> Box<dyn Planner> + Send + Sync>;

#[derive(Clone)]
enum Kind {
    Sequence,
    Parallel,
    Loop,
    Conditional,
    P2p,
    Custom(PlannerFactory),
}

impl Kind {
    fn label(&self) -> &'static str {
        match self {
            Kind::Sequence => "sequence",
            Kind::Parallel => "parallel",
            Kind::Loop => "loop",
            Kind::Conditional => "conditional",
            Kind::P2p => "p2p",
            Kind::Custom(_) => "custom",
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowError
// ---------------------------------------------------------------------------

/// Reasons [`WorkflowBuilder::build`] refuses a workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),
    #[error("workflow '{0}' has no agents")]
    NoAgents(String),
    #[error("{field} must be greater than zero")]
    ZeroBound { field: &'static str },
    #[error(transparent)]
    Config(ConfigError),
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

pub struct WorkflowBuilder {
    name: String,
    kind: Kind,
    agents: Vec<Arc<dyn Agent>>,
    branches: Vec<(Condition, String)>,
    arguments: Vec<Argument>,
    description: String,
    output_key: Option<String>,
    output: Option<OutputFn>,
    merge: Option<OutputFn>,
    error_handler: Option<ErrorHandler>,
    config: EngineConfig,
    exit: Option<ExitCondition>,
    exit_check: ExitCheck,
    parallel_body: bool,
    executor: Option<Arc<dyn Executor>>,
    cancellation: Option<CancellationToken>,
    hooks: Hooks,
}

impl WorkflowBuilder {
    fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            agents: Vec::new(),
            branches: Vec::new(),
            arguments: Vec::new(),
            description: String::new(),
            output_key: None,
            output: None,
            merge: None,
            error_handler: None,
            config: EngineConfig::default(),
            exit: None,
            exit_check: ExitCheck::default(),
            parallel_body: false,
            executor: None,
            cancellation: None,
            hooks: Hooks::default(),
        }
    }

    /// Add an agent. In a conditional workflow it always runs when its turn
    /// comes.
    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        if matches!(self.kind, Kind::Conditional) {
            let always: Condition = Arc::new(|_: &Scope| true);
            self.branches.push((always, agent.name().to_string()));
        }
        self.agents.push(agent);
        self
    }

    pub fn agents(self, agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Self {
        agents.into_iter().fold(self, Self::agent)
    }

    /// Add an agent that only runs when `condition` holds at its turn.
    pub fn when<F>(mut self, condition: F, agent: Arc<dyn Agent>) -> Self
    where
        F: Fn(&Scope) -> bool + Send + Sync + 'static,
    {
        let condition: Condition = Arc::new(condition);
        self.branches.push((condition, agent.name().to_string()));
        self.agents.push(agent);
        self
    }

    /// Required inputs when this workflow is nested inside another.
    pub fn arguments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments
            .extend(names.into_iter().map(Argument::required));
        self
    }

    pub fn optional_argument(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.arguments.push(Argument::optional(name, default));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Scope variable holding the workflow result. Also the output name when
    /// the workflow is nested.
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Compute the result from the final scope. Takes precedence over
    /// everything else.
    pub fn output<F>(mut self, output: F) -> Self
    where
        F: Fn(&Scope) -> Result<Value, ExecError> + Send + Sync + 'static,
    {
        self.output = Some(Arc::new(output));
        self
    }

    /// Combine parallel branch outputs once all branches have reported.
    pub fn merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&Scope) -> Result<Value, ExecError> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ErrorContext) -> ErrorRecovery + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Replace every bound at once. Later setters still override fields.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_iterations(mut self, n: usize) -> Self {
        self.config.max_iterations = n;
        self
    }

    pub fn max_invocations(mut self, n: usize) -> Self {
        self.config.max_invocations = n;
        self
    }

    pub fn max_steps(mut self, n: usize) -> Self {
        self.config.max_steps = n;
        self
    }

    pub fn max_retries(mut self, n: usize) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn strict_budget(mut self, strict: bool) -> Self {
        self.config.strict_budget = strict;
        self
    }

    /// End a loop (given completed iterations) or a peer-to-peer run (given
    /// completed invocations) early.
    pub fn exit_condition<F>(mut self, exit: F) -> Self
    where
        F: Fn(&Scope, usize) -> bool + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(exit));
        self
    }

    pub fn exit_check(mut self, check: ExitCheck) -> Self {
        self.exit_check = check;
        self
    }

    /// Run the loop body as a parallel fan-out instead of a sequence.
    pub fn parallel_body(mut self) -> Self {
        self.parallel_body = true;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Runs against the scope before any agent, on every invocation.
    pub fn before_call<F>(mut self, f: F) -> Self
    where
        F: Fn(&Scope) + Send + Sync + 'static,
    {
        self.hooks.before_call = Some(Arc::new(f));
        self
    }

    /// Fires before every agent attempt, retries included, with the inputs
    /// the agent is about to receive.
    pub fn before_invocation<F>(mut self, f: F) -> Self
    where
        F: Fn(&AgentStartEvent) + Send + Sync + 'static,
    {
        self.hooks.before_invocation = Some(Arc::new(f));
        self
    }

    pub fn on_invocation<F>(mut self, f: F) -> Self
    where
        F: Fn(&InvocationEvent) + Send + Sync + 'static,
    {
        self.hooks.on_invocation = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if self.agents.is_empty() {
            return Err(WorkflowError::NoAgents(self.name));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name()) {
                return Err(WorkflowError::DuplicateAgent(agent.name().to_string()));
            }
        }

        self.config.validate().map_err(|err| match err {
            ConfigError::Zero { field } => WorkflowError::ZeroBound { field },
            other => WorkflowError::Config(other),
        })?;

        let policy = Arc::new(ExecPolicy {
            workflow: self.name.clone(),
            error_handler: self.error_handler,
            max_retries: self.config.max_retries,
            hooks: self.hooks.clone(),
        });
        let executors = self
            .agents
            .into_iter()
            .map(|agent| AgentExecutor::new(agent, Arc::clone(&policy)))
            .collect();

        let output_name = self.output_key.clone().unwrap_or_else(|| self.name.clone());
        let mut spec = AgentSpec::new(self.name, output_name).description(self.description);
        spec.arguments = self.arguments;

        Ok(Workflow {
            spec,
            kind: self.kind,
            executors,
            branches: self.branches,
            output_key: self.output_key,
            output: self.output,
            merge: self.merge,
            config: self.config,
            exit: self.exit,
            exit_check: self.exit_check,
            parallel_body: self.parallel_body,
            executor: self.executor.unwrap_or_else(|| Arc::new(ThreadExecutor)),
            cancellation: self.cancellation,
            hooks: self.hooks,
            memory: ScopeRegistry::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Workflow (validated, only constructed via build())
// ---------------------------------------------------------------------------

/// A validated set of agents plus the strategy that schedules them.
///
/// A `Workflow` is itself an [`Agent`], so it can be nested inside another
/// workflow. Nested workflows run on a child of the caller's scope.
pub struct Workflow {
    spec: AgentSpec,
    kind: Kind,
    executors: Vec<AgentExecutor>,
    branches: Vec<(Condition, String)>,
    output_key: Option<String>,
    output: Option<OutputFn>,
    merge: Option<OutputFn>,
    config: EngineConfig,
    exit: Option<ExitCondition>,
    exit_check: ExitCheck,
    parallel_body: bool,
    executor: Arc<dyn Executor>,
    cancellation: Option<CancellationToken>,
    hooks: Hooks,
    memory: ScopeRegistry,
}

/// Result of [`Workflow::invoke_with_scope`]: the value plus the scope it was
/// computed in, for inspecting state and the invocation log.
#[derive(Debug)]
pub struct WorkflowOutput {
    pub value: Value,
    pub scope: Scope,
}

impl Workflow {
    /// Agents run one after another in declaration order.
    pub fn sequence(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name, Kind::Sequence)
    }

    /// Agents run concurrently; the workflow finishes when all have reported.
    pub fn parallel(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name, Kind::Parallel)
    }

    /// The agents form a body that repeats until the exit condition holds or
    /// `max_iterations` is reached.
    pub fn looping(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name, Kind::Loop)
    }

    /// Agents run in order, each only if its condition holds when reached.
    pub fn conditional(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name, Kind::Conditional)
    }

    /// Agents run whenever their inputs are (re)written by a peer.
    pub fn p2p(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name, Kind::P2p)
    }

    /// Scheduling is delegated to planners produced by `factory`.
    pub fn custom<F>(name: impl Into<String>, factory: F) -> WorkflowBuilder
    where
        F: Fn() -> Box<dyn Planner> + Send + Sync + 'static,
    {
        WorkflowBuilder::new(name, Kind::Custom(Arc::new(factory)))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.executors.iter().map(AgentExecutor::name).collect()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run on a fresh scope seeded with `inputs` and return the result.
    pub fn invoke<I, K, V>(&self, inputs: I) -> Result<Value, InvokeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Ok(self.invoke_with_scope(inputs)?.value)
    }

    /// Like [`invoke`](Self::invoke) but also hands back the scope.
    pub fn invoke_with_scope<I, K, V>(&self, inputs: I) -> Result<WorkflowOutput, InvokeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let scope = Scope::with_label(self.name());
        let value = self.invoke_in(&scope, inputs)?;
        Ok(WorkflowOutput { value, scope })
    }

    /// Run on a caller supplied scope.
    pub fn invoke_in<I, K, V>(&self, scope: &Scope, inputs: I) -> Result<Value, InvokeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        scope.write_all(inputs);
        self.execute(scope).map_err(|err| {
            tracing::warn!(workflow = self.name(), %err, "workflow failed");
            InvokeError::new(self.name(), scope.snapshot(), err)
        })
    }

    /// Run on the scope registered for `memory_id`, so state carries over
    /// between invocations with the same id.
    pub fn invoke_with_memory<I, K, V>(&self, memory_id: &str, inputs: I) -> Result<Value, InvokeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let scope = self.memory.get_or_create(memory_id);
        self.invoke_in(&scope, inputs)
    }

    pub fn scope(&self, memory_id: &str) -> Option<Scope> {
        self.memory.get(memory_id)
    }

    pub fn evict_scope(&self, memory_id: &str) -> Option<Scope> {
        self.memory.evict(memory_id)
    }

    fn planner(&self) -> Option<Box<dyn Planner>> {
        let planner: Box<dyn Planner> = match &self.kind {
            Kind::Sequence => Box::new(SequencePlanner::new()),
            Kind::Parallel => match &self.merge {
                Some(merge) => Box::new(ParallelPlanner::with_merge(Arc::clone(merge))),
                None => Box::new(ParallelPlanner::new()),
            },
            Kind::Loop => {
                let body: Box<dyn Planner> = if self.parallel_body {
                    Box::new(ParallelPlanner::new())
                } else {
                    Box::new(SequencePlanner::new())
                };
                let mut planner =
                    LoopPlanner::new(body, self.config.max_iterations).exit_check(self.exit_check);
                if let Some(exit) = &self.exit {
                    planner = planner.exit_condition(Arc::clone(exit));
                }
                Box::new(planner)
            }
            Kind::Conditional => Box::new(
                self.branches
                    .iter()
                    .fold(ConditionalPlanner::new(), |planner, (condition, agent)| {
                        planner.branch(Arc::clone(condition), agent.clone())
                    }),
            ),
            Kind::Custom(factory) => factory(),
            Kind::P2p => return None,
        };
        Some(planner)
    }

    fn execute(&self, scope: &Scope) -> Result<Value, ExecError> {
        let span = tracing::info_span!("workflow", name = self.name(), kind = self.kind.label());
        let _enter = span.enter();

        self.hooks.before_call(scope);

        let planned = match self.planner() {
            Some(mut planner) => {
                let settings = RunSettings {
                    max_steps: self.config.max_steps,
                    strict_budget: self.config.strict_budget,
                    cancellation: self.cancellation.clone(),
                    executor: Arc::clone(&self.executor),
                };
                run_planner(self.name(), planner.as_mut(), &self.executors, scope, &settings)?
            }
            None => {
                let settings = P2pSettings {
                    max_invocations: self.config.max_invocations,
                    strict_budget: self.config.strict_budget,
                    exit: self.exit.clone(),
                    cancellation: self.cancellation.clone(),
                    executor: Arc::clone(&self.executor),
                };
                run_p2p(self.name(), &self.executors, scope, &settings)?;
                None
            }
        };

        let value = self.result(scope, planned)?;
        if let Some(key) = &self.output_key {
            scope.write(key.clone(), value.clone());
        }
        tracing::info!(invocations = scope.invocations().len(), "workflow finished");
        Ok(value)
    }

    fn result(&self, scope: &Scope, planned: Option<Value>) -> Result<Value, ExecError> {
        if let Some(output) = &self.output {
            return output(scope);
        }
        if let Some(value) = planned {
            return Ok(value);
        }
        match &self.output_key {
            Some(key) => scope
                .read(key)
                .ok_or_else(|| ExecError::missing(self.name(), key)),
            None => Ok(Value::Null),
        }
    }
}

impl Agent for Workflow {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn invoke(&self, inputs: &Inputs) -> Result<Value, AgentError> {
        self.invoke_in_scope(&Scope::with_label(self.name()), inputs)
    }

    fn invoke_in_scope(&self, scope: &Scope, inputs: &Inputs) -> Result<Value, AgentError> {
        let child = scope.child(self.name());
        child.write_all(inputs.clone());
        self.execute(&child)
            .map_err(|err| AgentError::Workflow(Box::new(err)))
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name())
            .field("kind", &self.kind.label())
            .field("agents", &self.agent_names())
            .field("output_key", &self.output_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::agent_fn;
    use crate::pool::WorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Reads `input` and writes `<name>(<input>)` to `output`.
    fn wrap(name: &str, input: &str, output: &str) -> Arc<dyn Agent> {
        let (label, key) = (name.to_string(), input.to_string());
        agent_fn(AgentSpec::new(name, output).argument(input), move |inputs| {
            Ok(Value::from(format!("{label}({})", inputs.text(&key)?)))
        })
    }

    /// Writes a constant after `delay_ms`.
    fn constant(name: &str, output: &str, value: &'static str, delay_ms: u64) -> Arc<dyn Agent> {
        agent_fn(AgentSpec::new(name, output), move |_| {
            thread::sleep(Duration::from_millis(delay_ms));
            Ok(Value::from(value))
        })
    }

    fn broken(name: &str, output: &str) -> Arc<dyn Agent> {
        agent_fn(AgentSpec::new(name, output), |_| {
            Err(AgentError::failed("model unavailable"))
        })
    }

    /// Adds one to `score` every call.
    fn scorer() -> Arc<dyn Agent> {
        agent_fn(
            AgentSpec::new("scorer", "score").optional_argument("score", 0.0),
            |inputs| Ok(Value::from(inputs.number("score")? + 1.0)),
        )
    }

    fn score_at_least(target: f64) -> impl Fn(&Scope, usize) -> bool + Send + Sync + 'static {
        move |scope, _| scope.read_number("score").ok().flatten().unwrap_or(0.0) >= target
    }

    fn agents_called(scope: &Scope) -> Vec<String> {
        scope.invocations().into_iter().map(|i| i.agent).collect()
    }

    // --- build ---

    #[test]
    fn duplicate_agent_rejected() {
        let err = Workflow::sequence("test")
            .agent(wrap("a", "x", "y"))
            .agent(wrap("a", "y", "z"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::DuplicateAgent(ref name) if name == "a"));
    }

    #[test]
    fn empty_workflow_rejected() {
        let err = Workflow::parallel("empty").build().err().unwrap();
        assert!(matches!(err, WorkflowError::NoAgents(_)));
    }

    #[test]
    fn zero_bound_rejected() {
        let err = Workflow::looping("test")
            .agent(scorer())
            .max_iterations(0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WorkflowError::ZeroBound { field: "max_iterations" }));
    }

    #[test]
    fn nested_spec_uses_output_key() {
        let wf = Workflow::sequence("inner")
            .agent(wrap("a", "x", "y"))
            .arguments(["x"])
            .output_key("y")
            .build()
            .unwrap();
        assert_eq!(wf.output_name(), "y");
        assert_eq!(wf.argument_names(), vec!["x"]);

        let unnamed = Workflow::sequence("inner").agent(wrap("a", "x", "y")).build().unwrap();
        assert_eq!(unnamed.output_name(), "inner");
    }

    // --- sequence ---

    #[test]
    fn sequence_passes_outputs_downstream() {
        let wf = Workflow::sequence("story")
            .agent(wrap("writer", "topic", "story"))
            .agent(wrap("editor", "story", "edited"))
            .output_key("edited")
            .build()
            .unwrap();
        let result = wf.invoke([("topic", "dragons")]).unwrap();
        assert_eq!(result, Value::from("editor(writer(dragons))"));
    }

    #[test]
    fn sequence_is_deterministic() {
        let wf = Workflow::sequence("story")
            .agent(wrap("writer", "topic", "story"))
            .agent(wrap("editor", "story", "edited"))
            .agent(wrap("critic", "edited", "review"))
            .build()
            .unwrap();

        let runs: Vec<Vec<(String, Option<Value>)>> = (0..2)
            .map(|_| {
                let out = wf.invoke_with_scope([("topic", "dragons")]).unwrap();
                out.scope
                    .invocations()
                    .into_iter()
                    .map(|i| (i.agent.clone(), i.output().cloned()))
                    .collect()
            })
            .collect();
        assert_eq!(runs[0].len(), 3);
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn no_output_configured_yields_null() {
        let wf = Workflow::sequence("t").agent(wrap("a", "x", "y")).build().unwrap();
        assert_eq!(wf.invoke([("x", "1")]).unwrap(), Value::Null);
    }

    #[test]
    fn missing_output_key_is_missing_input() {
        let wf = Workflow::sequence("t")
            .agent(wrap("a", "x", "y"))
            .output_key("nope")
            .build()
            .unwrap();
        let err = wf.invoke([("x", "1")]).unwrap_err();
        assert!(matches!(err.kind(), ExecError::MissingInput { key, .. } if key == "nope"));
    }

    #[test]
    fn output_fn_wins_and_is_written_back() {
        let wf = Workflow::sequence("t")
            .agent(wrap("a", "x", "y"))
            .output_key("summary")
            .output(|scope| Ok(Value::from(format!("got {}", scope.read_text("y")?.unwrap_or_default()))))
            .build()
            .unwrap();
        let out = wf.invoke_with_scope([("x", "1")]).unwrap();
        assert_eq!(out.value, Value::from("got a(1)"));
        assert_eq!(out.scope.read("summary"), Some(out.value.clone()));
    }

    #[test]
    fn strict_step_budget_raises() {
        let wf = Workflow::sequence("t")
            .agent(constant("a", "x", "1", 0))
            .agent(constant("b", "y", "2", 0))
            .max_steps(1)
            .strict_budget(true)
            .build()
            .unwrap();
        let err = wf.invoke(Inputs::new()).unwrap_err();
        assert!(matches!(err.kind(), ExecError::BudgetExceeded { limit: 1, .. }));
    }

    #[test]
    fn custom_planner_controls_order() {
        let wf = Workflow::custom("reversed", || -> Box<dyn Planner> {
            Box::new(SequencePlanner::with_order(["b", "a"]))
        })
            .agent(constant("a", "x", "1", 0))
            .agent(constant("b", "y", "2", 0))
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(agents_called(&out.scope), vec!["b", "a"]);
    }

    // --- parallel ---

    #[test]
    fn parallel_fans_out_and_merges() {
        let wf = Workflow::parallel("research")
            .agent(constant("slow", "a", "A", 30))
            .agent(constant("medium", "b", "B", 15))
            .agent(constant("fast", "c", "C", 0))
            .merge(|scope| {
                let parts = ["a", "b", "c"]
                    .iter()
                    .map(|key| -> Result<String, ExecError> {
                        scope
                            .read_text(key)?
                            .ok_or_else(|| ExecError::missing("merge", *key))
                    })
                    .collect::<Result<Vec<_>, ExecError>>()?;
                Ok(Value::from(parts.join(",")))
            })
            .executor(WorkerPool::new(3).unwrap())
            .build()
            .unwrap();

        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.value, Value::from("A,B,C"));
        assert_eq!(out.scope.invocations().len(), 3);
    }

    // --- loop ---

    #[test]
    fn loop_stops_when_predicate_holds() {
        let wf = Workflow::looping("refine")
            .agent(scorer())
            .max_iterations(10)
            .exit_condition(score_at_least(3.0))
            .output_key("score")
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.value, Value::from(3.0));
        assert_eq!(out.scope.invocations_of("scorer").len(), 3);
    }

    #[test]
    fn loop_stops_at_cap() {
        let wf = Workflow::looping("refine")
            .agent(scorer())
            .max_iterations(5)
            .exit_condition(|_, _| false)
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.scope.invocations().len(), 5);
    }

    #[test]
    fn loop_bound_from_config() {
        let config = EngineConfig::from_json(r#"{ "max_iterations": 2 }"#).unwrap();
        let wf = Workflow::looping("refine")
            .agent(scorer())
            .config(config)
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.scope.invocations().len(), 2);
    }

    #[test]
    fn loop_with_parallel_body() {
        let wf = Workflow::looping("both")
            .agent(constant("a", "x", "1", 0))
            .agent(constant("b", "y", "2", 5))
            .parallel_body()
            .max_iterations(2)
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.scope.invocations_of("a").len(), 2);
        assert_eq!(out.scope.invocations_of("b").len(), 2);
    }

    // --- conditional ---

    #[test]
    fn conditional_routes_on_scope() {
        let wf = Workflow::conditional("router")
            .agent(constant("classifier", "category", "legal", 0))
            .when(
                |scope| scope.read("category") == Some(Value::from("medical")),
                constant("medical", "answer", "see a doctor", 0),
            )
            .when(
                |scope| scope.read("category") == Some(Value::from("legal")),
                constant("legal", "answer", "see a lawyer", 0),
            )
            .output_key("answer")
            .build()
            .unwrap();
        let out = wf.invoke_with_scope(Inputs::new()).unwrap();
        assert_eq!(out.value, Value::from("see a lawyer"));
        assert_eq!(agents_called(&out.scope), vec!["classifier", "legal"]);
    }

    // --- p2p ---

    #[test]
    fn p2p_converges() {
        let wf = Workflow::p2p("peers")
            .agent(wrap("y", "a", "b"))
            .agent(wrap("x", "seed", "a"))
            .output_key("b")
            .build()
            .unwrap();
        let out = wf.invoke_with_scope([("seed", "s")]).unwrap();
        assert_eq!(out.value, Value::from("y(x(s))"));
        assert_eq!(agents_called(&out.scope), vec!["x", "y"]);
    }

    #[test]
    fn p2p_exit_condition_sees_invocation_count() {
        let writer = agent_fn(
            AgentSpec::new("writer", "draft")
                .argument("topic")
                .optional_argument("critique", ""),
            |inputs| Ok(Value::from(format!("{} draft", inputs.text("topic")?))),
        );
        let wf = Workflow::p2p("review")
            .agent(writer)
            .agent(wrap("critic", "draft", "critique"))
            .exit_condition(|_, count| count >= 3)
            .build()
            .unwrap();
        let out = wf.invoke_with_scope([("topic", "dragons")]).unwrap();
        assert_eq!(out.scope.invocations().len(), 3);
    }

    // --- error recovery ---

    #[test]
    fn abort_stops_sequence() {
        let wf = Workflow::sequence("t")
            .agent(constant("first", "x", "1", 0))
            .agent(broken("broken", "y"))
            .agent(wrap("after", "y", "z"))
            .build()
            .unwrap();
        let err = wf.invoke(Inputs::new()).unwrap_err();

        assert!(matches!(err.kind(), ExecError::AgentExecution { .. }));
        assert_eq!(err.agent.as_deref(), Some("broken"));
        assert_eq!(err.workflow, "t");
        assert!(err.snapshot.contains_key("x"));
        assert!(!err.snapshot.contains_key("z"));
    }

    #[test]
    fn substitute_is_visible_downstream() {
        let wf = Workflow::sequence("t")
            .agent(broken("broken", "y"))
            .agent(wrap("after", "y", "z"))
            .error_handler(|_| ErrorRecovery::SubstituteOutput(Value::from("fallback")))
            .output_key("z")
            .build()
            .unwrap();
        assert_eq!(wf.invoke(Inputs::new()).unwrap(), Value::from("after(fallback)"));
    }

    #[test]
    fn cancelled_workflow_fails() {
        let token = CancellationToken::new();
        token.cancel();
        let wf = Workflow::sequence("t")
            .agent(constant("a", "x", "1", 0))
            .cancellation(token)
            .build()
            .unwrap();
        let err = wf.invoke(Inputs::new()).unwrap_err();
        assert!(matches!(err.kind(), ExecError::Cancelled));
    }

    // --- nesting ---

    #[test]
    fn nested_workflow_logs_in_child_scope() {
        let inner = Workflow::sequence("inner")
            .agent(wrap("a", "x", "y"))
            .agent(wrap("b", "y", "z"))
            .arguments(["x"])
            .output_key("z")
            .build()
            .unwrap();
        let outer = Workflow::sequence("outer")
            .agent(Arc::new(inner))
            .agent(wrap("c", "z", "result"))
            .output_key("result")
            .build()
            .unwrap();

        let out = outer.invoke_with_scope([("x", "1")]).unwrap();
        assert_eq!(out.value, Value::from("c(b(a(1)))"));
        assert_eq!(agents_called(&out.scope), vec!["inner", "c"]);
        let all: Vec<_> = out.scope.all_invocations().into_iter().map(|i| i.agent).collect();
        assert_eq!(all, vec!["a", "b", "inner", "c"]);
    }

    #[test]
    fn nested_wiring_error_bypasses_handler() {
        let inner = Workflow::sequence("inner")
            .agent(wrap("a", "never_set", "y"))
            .build()
            .unwrap();
        let outer = Workflow::sequence("outer")
            .agent(Arc::new(inner))
            .error_handler(|_| ErrorRecovery::SubstituteOutput(Value::from("patched")))
            .build()
            .unwrap();
        let err = outer.invoke(Inputs::new()).unwrap_err();
        assert!(matches!(err.kind(), ExecError::MissingInput { agent, .. } if agent == "a"));
    }

    // --- memory and hooks ---

    #[test]
    fn memory_scope_persists_between_invocations() {
        let greeter = agent_fn(
            AgentSpec::new("greeter", "greeting").optional_argument("name", "stranger"),
            |inputs| Ok(Value::from(format!("hello {}", inputs.text("name")?))),
        );
        let wf = Workflow::sequence("chat")
            .agent(greeter)
            .output_key("greeting")
            .build()
            .unwrap();

        wf.invoke_with_memory("alice", [("name", "Alice")]).unwrap();
        let again = wf.invoke_with_memory("alice", Inputs::new()).unwrap();
        assert_eq!(again, Value::from("hello Alice"));
        assert_eq!(wf.invoke_with_memory("bob", Inputs::new()).unwrap(), Value::from("hello stranger"));

        assert_eq!(wf.scope("alice").unwrap().invocations().len(), 2);
        assert!(wf.evict_scope("alice").is_some());
        assert!(wf.scope("alice").is_none());
    }

    #[test]
    fn hooks_fire() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let wf = Workflow::sequence("t")
            .agent(wrap("writer", "topic", "story"))
            .agent(wrap("editor", "story", "edited"))
            .before_call(|scope| scope.write("topic", "seeded"))
            .on_invocation(move |event| {
                assert_eq!(event.workflow, "t");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .output_key("edited")
            .build()
            .unwrap();
        assert_eq!(
            wf.invoke(Inputs::new()).unwrap(),
            Value::from("editor(writer(seeded))")
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn before_invocation_sees_resolved_inputs() {
        let started = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&started);
        let wf = Workflow::sequence("t")
            .agent(wrap("writer", "topic", "story"))
            .agent(wrap("editor", "story", "edited"))
            .before_invocation(move |event| {
                assert_eq!(event.attempt, 1);
                let input = event.inputs.text(if event.agent == "writer" { "topic" } else { "story" });
                log.lock().push(format!("{}:{}", event.agent, input.unwrap()));
            })
            .output_key("edited")
            .build()
            .unwrap();
        wf.invoke([("topic", "dragons")]).unwrap();
        assert_eq!(
            *started.lock(),
            vec!["writer:dragons".to_string(), "editor:writer(dragons)".to_string()]
        );
    }
}
