//! Intent engine error types.
//!
//! Interpretation never fails (it degrades to an unresolved command), so
//! every variant here concerns workflow definitions, runs, and triggers.

/// Unified error type for the intent engine.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    // -- Definition errors ---------------------------------------------------
    /// The definition is structurally unusable (e.g. no steps).
    #[error("invalid workflow `{workflow}`: {reason}")]
    InvalidDefinition { workflow: String, reason: String },

    /// Two steps share an id.
    #[error("duplicate step id `{step}`")]
    DuplicateStep { step: String },

    /// A step refers to a step that does not exist, or to itself.
    #[error("step `{step}` references unknown step `{reference}`")]
    UnknownStep { step: String, reference: String },

    /// The step graph contains a cycle; `steps` lists the cycle in order.
    #[error("dependency cycle: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    /// A step condition could not be parsed.
    #[error("invalid condition on step `{step}`: {reason}")]
    InvalidCondition { step: String, reason: String },

    /// A trigger specification is malformed.
    #[error("invalid trigger: {reason}")]
    InvalidTrigger { reason: String },

    // -- Run errors ----------------------------------------------------------
    /// The referenced workflow is not loaded.
    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    /// The referenced step is not part of the workflow.
    #[error("step `{step}` not found in workflow `{workflow}`")]
    StepNotFound { workflow: String, step: String },

    /// The run was cancelled before it could start.
    #[error("run cancelled")]
    Cancelled,

    // -- Trigger scheduler ---------------------------------------------------
    /// `start` was called on a scheduler that is already running.
    #[error("trigger scheduler is already running")]
    SchedulerRunning,

    // -- Upstream crate errors -----------------------------------------------
    #[error("kernel error: {0}")]
    Kernel(#[from] deskpilot_kernel::KernelError),

    // -- Serialization and I/O -----------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal intent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the intent crate.
pub type Result<T> = std::result::Result<T, IntentError>;
