use serde::{Deserialize, Serialize};

/// Bounds and policies shared by every workflow kind.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Planner steps before a workflow is cut off. Prevents accidental
    /// infinite loops.
    pub max_steps: usize,
    /// Retries granted to one agent call when the error handler asks for them.
    pub max_retries: usize,
    /// Loop iterations before a loop workflow stops.
    pub max_iterations: usize,
    /// Peer-to-peer workflows start at most this many agent runs in total,
    /// counted across all peers.
    pub max_invocations: usize,
    /// Raise `BudgetExceeded` instead of silently stopping at a bound.
    pub strict_budget: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_retries: 3,
            max_iterations: 10,
            max_invocations: 100,
            strict_budget: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid engine config: {field} must be greater than zero")]
    Zero { field: &'static str },
}

impl EngineConfig {
    /// Parse a JSON document, filling missing fields with defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            ("max_steps", self.max_steps),
            ("max_iterations", self.max_iterations),
            ("max_invocations", self.max_invocations),
        ];
        for (field, value) in bounds {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }
}
