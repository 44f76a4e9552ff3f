//! Engine configuration.
//!
//! Every struct deserializes from a partial table (missing keys fall back to
//! their defaults) so the binary can read them straight out of a TOML file.

use std::time::Duration;

use deskpilot_kernel::CoordinatorConfig;
use serde::{Deserialize, Serialize};

use crate::fuzzy::ACCEPTANCE_THRESHOLD;

/// Penalty applied to confidence for every referring word ("it", "that
/// file") that could not be resolved from recent commands.
pub const CONTEXT_PENALTY: f64 = 0.15;

/// Tunables for the [`CommandInterpreter`](crate::interpreter::CommandInterpreter).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Minimum score for a fuzzy or strategy match to be accepted.
    pub acceptance_threshold: f64,
    /// How many recent commands context resolution looks back over.
    pub context_window: usize,
    /// How many alternatives to suggest.
    pub max_suggestions: usize,
    /// Confidence deducted per unresolved reference.
    pub context_penalty: f64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: ACCEPTANCE_THRESHOLD,
            context_window: 5,
            max_suggestions: 3,
            context_penalty: CONTEXT_PENALTY,
        }
    }
}

impl InterpreterConfig {
    pub fn with_acceptance_threshold(mut self, threshold: f64) -> Self {
        self.acceptance_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    pub fn with_max_suggestions(mut self, max: usize) -> Self {
        self.max_suggestions = max;
        self
    }
}

/// Tunables for the [`WorkflowEngine`](crate::workflow::WorkflowEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Upper bound on a single retry backoff, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_backoff_ms: 30_000,
        }
    }
}

impl WorkflowConfig {
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Everything the [`DeskPilot`](crate::service::DeskPilot) facade needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub coordinator: CoordinatorConfig,
    pub interpreter: InterpreterConfig,
    pub workflow: WorkflowConfig,
}
