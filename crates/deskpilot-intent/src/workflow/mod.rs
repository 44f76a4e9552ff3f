//! Workflow definitions and their execution.
//!
//! A [`WorkflowDefinition`] is a graph of [`WorkflowStep`]s.  The
//! [`WorkflowEngine`] validates it into an [`ExecutionPlan`] and runs it,
//! dispatching each step through the kernel's execution coordinator.

pub mod condition;
pub mod definition;
pub mod engine;
pub mod template;

pub use condition::Condition;
pub use definition::{ConditionSpec, RetryPolicy, TriggerSpec, WorkflowDefinition, WorkflowStep};
pub use engine::{
    CancelToken, ExecutionPlan, SkipReason, StepReport, StepState, WorkflowEngine,
    WorkflowOutcome, WorkflowResult,
};
pub use template::{Reference, Scope};
