//! Workflow documents.
//!
//! Definitions are plain data, loaded from JSON or TOML and never mutated by
//! the engine.  Every run gets its own execution state over the same shared
//! definition.

use std::path::Path;
use std::time::Duration;

use deskpilot_kernel::ToolParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IntentError, Result};
use crate::trigger;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A named graph of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Starts whole runs of this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            trigger: None,
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a `.toml` file as TOML and anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Whether the workflow or any of its steps declares a trigger.
    pub fn has_triggers(&self) -> bool {
        self.trigger.is_some() || self.steps.iter().any(|s| s.trigger.is_some())
    }
}

// ---------------------------------------------------------------------------
// WorkflowStep
// ---------------------------------------------------------------------------

/// One tool invocation within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub tool: String,
    /// Parameter template; strings may contain `{{...}}` references.
    #[serde(default)]
    pub params: ToolParams,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Starts single-step runs of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params: ToolParams::new(),
            depends_on: Vec::new(),
            condition: None,
            retry: RetryPolicy::default(),
            parallel_group: None,
            continue_on_error: false,
            trigger: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(ConditionSpec::Expr(expr.into()));
        self
    }

    pub fn with_retry(mut self, max: u32, backoff_ms: u64) -> Self {
        self.retry = RetryPolicy { max, backoff_ms };
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.trigger = Some(trigger);
        self
    }
}

/// A step condition as written: a JSON boolean or an expression string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Literal(bool),
    Expr(String),
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How often a failing step is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.  Must be at least 1.
    #[serde(default = "default_max_attempts")]
    pub max: u32,
    /// Base backoff before the second attempt.
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based):
    /// `backoff_ms * 2^(attempt - 1)`, capped at `cap`.
    pub fn backoff(&self, attempt: u32, cap: Duration) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor)).min(cap)
    }
}

// ---------------------------------------------------------------------------
// TriggerSpec
// ---------------------------------------------------------------------------

/// When a workflow or step starts on its own.
///
/// Written as exactly one of `{"delayMs": n}`, `{"intervalMs": n}` or
/// `{"cron": "expr"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTrigger", into = "RawTrigger")]
pub enum TriggerSpec {
    /// Fire once, this long after the scheduler starts.
    Delay { ms: u64 },
    /// Fire every `ms` milliseconds.
    Interval { ms: u64 },
    /// Fire on a cron schedule (5, 6 or 7 fields).
    Cron { expression: String },
}

impl TriggerSpec {
    /// Reject values that cannot be scheduled.
    pub fn check(&self) -> Result<()> {
        match self {
            Self::Delay { .. } => Ok(()),
            Self::Interval { ms: 0 } => Err(IntentError::InvalidTrigger {
                reason: "intervalMs must be greater than zero".into(),
            }),
            Self::Interval { .. } => Ok(()),
            Self::Cron { expression } => trigger::parse_schedule(expression).map(|_| ()),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Delay { .. })
    }
}

impl std::fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delay { ms } => write!(f, "delay({ms}ms)"),
            Self::Interval { ms } => write!(f, "every({ms}ms)"),
            Self::Cron { expression } => write!(f, "cron({expression})"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawTrigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cron: Option<String>,
}

impl TryFrom<RawTrigger> for TriggerSpec {
    type Error = IntentError;

    fn try_from(raw: RawTrigger) -> Result<Self> {
        let spec = match (raw.delay_ms, raw.interval_ms, raw.cron) {
            (Some(ms), None, None) => Self::Delay { ms },
            (None, Some(ms), None) => Self::Interval { ms },
            (None, None, Some(expression)) => Self::Cron { expression },
            _ => {
                return Err(IntentError::InvalidTrigger {
                    reason: "expected exactly one of delayMs, intervalMs, cron".into(),
                });
            }
        };
        spec.check()?;
        Ok(spec)
    }
}

impl From<TriggerSpec> for RawTrigger {
    fn from(spec: TriggerSpec) -> Self {
        match spec {
            TriggerSpec::Delay { ms } => Self {
                delay_ms: Some(ms),
                ..Self::default()
            },
            TriggerSpec::Interval { ms } => Self {
                interval_ms: Some(ms),
                ..Self::default()
            },
            TriggerSpec::Cron { expression } => Self {
                cron: Some(expression),
                ..Self::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
