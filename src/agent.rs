use crate::error::ExecError;
use crate::value::TypeMismatch;
use crate::{Scope, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A unit of computation the engine can orchestrate.
///
/// The engine only ever sees an agent through its [`AgentSpec`] and
/// [`Agent::invoke`]. How the agent produces its answer (model calls, tools,
/// provider retries) is entirely its own business.
pub trait Agent: Send + Sync + 'static {
    /// Static metadata: name, declared inputs and output variable.
    fn spec(&self) -> &AgentSpec;

    /// Run once with the resolved inputs and return the output value.
    fn invoke(&self, inputs: &Inputs) -> Result<Value, AgentError>;

    /// Run with access to the caller's scope.
    ///
    /// Plain agents ignore the scope. Nested workflows override this to run
    /// their sub-agents in a child of `scope`.
    fn invoke_in_scope(&self, scope: &Scope, inputs: &Inputs) -> Result<Value, AgentError> {
        let _ = scope;
        self.invoke(inputs)
    }

    fn name(&self) -> &str {
        &self.spec().name
    }

    fn argument_names(&self) -> Vec<&str> {
        self.spec().arguments.iter().map(|a| a.name.as_str()).collect()
    }

    fn output_name(&self) -> &str {
        &self.spec().output
    }

    fn description(&self) -> &str {
        &self.spec().description
    }
}

/// A declared input variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    /// Used when the variable is absent. `None` makes the argument required.
    pub default: Option<Value>,
}

impl Argument {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Metadata describing an agent, built once when the agent is declared.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub name: String,
    pub arguments: Vec<Argument>,
    pub output: String,
    /// Human readable summary, for planners that describe agents to a model.
    pub description: String,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
            output: output.into(),
            description: String::new(),
        }
    }

    pub fn argument(mut self, name: impl Into<String>) -> Self {
        self.arguments.push(Argument::required(name));
        self
    }

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

    /// Names of the arguments that must be present in the scope.
    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.arguments
            .iter()
            .filter(|a| a.is_required())
            .map(|a| a.name.as_str())
    }
}

/// Named inputs handed to an agent for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs(BTreeMap<String, Value>);

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a required input, failing with [`AgentError::Invalid`].
    pub fn require(&self, key: &str) -> Result<&Value, AgentError> {
        self.0
            .get(key)
            .ok_or_else(|| AgentError::invalid(format!("missing input '{key}'")))
    }

    pub fn text(&self, key: &str) -> Result<&str, AgentError> {
        Ok(self.require(key)?.as_text()?)
    }

    pub fn number(&self, key: &str) -> Result<f64, AgentError> {
        Ok(self.require(key)?.as_number()?)
    }

    pub fn flag(&self, key: &str) -> Result<bool, AgentError> {
        Ok(self.require(key)?.as_bool()?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.0
    }
}

impl From<BTreeMap<String, Value>> for Inputs {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Inputs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Inputs {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

type AgentFn = dyn Fn(&Inputs) -> Result<Value, AgentError> + Send + Sync;

/// An agent backed by a closure.
pub struct FnAgent {
    spec: AgentSpec,
    f: Box<AgentFn>,
}

impl Agent for FnAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn invoke(&self, inputs: &Inputs) -> Result<Value, AgentError> {
        (self.f)(inputs)
    }
}

/// Wrap a closure as an [`Agent`].
pub fn agent_fn<F>(spec: AgentSpec, f: F) -> Arc<dyn Agent>
where
    F: Fn(&Inputs) -> Result<Value, AgentError> + Send + Sync + 'static,
{
    Arc::new(FnAgent {
        spec,
        f: Box::new(f),
    })
}

/// Error type for agent calls, with variants designed around what the caller
/// can do about them.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bad input or agent logic error. Don't retry, fix the code.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Transient failure (network, rate limit). Retrying might help.
    #[error("transient: {0}")]
    Transient(String),
    /// Agent decided to fail explicitly.
    #[error("failed: {0}")]
    Failed(String),
    /// A nested workflow failed.
    #[error("nested workflow: {0}")]
    Workflow(Box<ExecError>),
    /// Everything else. Inspect the message for details.
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Other(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Invalid(e.to_string())
    }
}

impl From<TypeMismatch> for AgentError {
    fn from(e: TypeMismatch) -> Self {
        AgentError::Invalid(e.to_string())
    }
}

impl AgentError {
    /// Create an [`Invalid`](AgentError::Invalid) error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        AgentError::Invalid(msg.into())
    }

    /// Create an [`Other`](AgentError::Other) error.
    pub fn other(msg: impl Into<String>) -> Self {
        AgentError::Other(msg.into())
    }

    /// Create a [`Transient`](AgentError::Transient) error.
    pub fn transient(msg: impl Into<String>) -> Self {
        AgentError::Transient(msg.into())
    }

    /// Create a [`Failed`](AgentError::Failed) error.
    pub fn failed(msg: impl Into<String>) -> Self {
        AgentError::Failed(msg.into())
    }
}
