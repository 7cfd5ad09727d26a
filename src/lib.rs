//! An orchestration engine for multi-agent workflows.
//!
//! Agents declare the scope variables they read and the one they write.
//! Workflows wire them together as a sequence, a parallel fan-out, a loop,
//! a conditional route, or a peer-to-peer network where agents re-run
//! whenever their inputs change. Everything an agent produces lands in a
//! shared [`Scope`], together with an append-only log of [`Invocation`]s.
//!
//! # Quick start
//!
//! ```rust
//! use agent_loom::{AgentSpec, Inputs, Value, Workflow, agent_fn};
//!
//! let writer = agent_fn(AgentSpec::new("writer", "story").argument("topic"), |inputs| {
//!     Ok(Value::from(format!("a story about {}", inputs.text("topic")?)))
//! });
//! let editor = agent_fn(AgentSpec::new("editor", "edited").argument("story"), |inputs| {
//!     Ok(Value::from(inputs.text("story")?.to_uppercase()))
//! });
//!
//! let wf = Workflow::sequence("story")
//!     .agent(writer)
//!     .agent(editor)
//!     .output_key("edited")
//!     .build()
//!     .unwrap();
//!
//! let result = wf.invoke([("topic", "dragons")]).unwrap();
//! assert_eq!(result, Value::from("A STORY ABOUT DRAGONS"));
//!
//! // Workflows without inputs take an empty `Inputs`.
//! assert!(wf.invoke(Inputs::new()).is_err());
//! ```

mod agent;
mod cancel;
mod config;
mod error;
mod executor;
mod hooks;
mod invocation;
mod p2p;
pub mod planner;
mod pool;
mod registry;
mod runner;
mod scope;
mod value;
mod workflow;

pub use agent::{Agent, AgentError, AgentSpec, Argument, FnAgent, Inputs, agent_fn};
pub use cancel::CancellationToken;
pub use config::{ConfigError, EngineConfig};
pub use error::{ExecError, InvokeError};
pub use executor::{AgentExecutor, ErrorContext, ErrorHandler, ErrorRecovery};
pub use hooks::{AgentStartEvent, ErrorEvent, InvocationEvent};
pub use invocation::{Invocation, InvocationOutcome, RecoveryAction};
pub use planner::{Action, ExitCheck, Planner};
pub use pool::{Executor, Job, ThreadExecutor, WorkerPool};
pub use registry::ScopeRegistry;
pub use scope::{Scope, ScopeSnapshot};
pub use value::{TypeMismatch, Value};
pub use workflow::{PlannerFactory, Workflow, WorkflowBuilder, WorkflowError, WorkflowOutput};
