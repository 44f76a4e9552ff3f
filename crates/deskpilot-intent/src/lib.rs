//! DeskPilot intent engine.
//!
//! Turns what the user says or schedules into tool dispatches:
//!
//! - **[`interpreter`]** -- the [`CommandInterpreter`]: rule matching, an
//!   optional alternate [`MatchStrategy`], and the fuzzy fallback, followed
//!   by entity extraction and context resolution.
//! - **[`fuzzy`]**, **[`entities`]**, **[`context`]**, **[`strategy`]** --
//!   the pieces the interpreter is built from.
//! - **[`workflow`]** -- workflow definitions, the condition language,
//!   parameter templates, and the [`WorkflowEngine`].
//! - **[`trigger`]** -- the background [`TriggerScheduler`].
//! - **[`service`]** -- the [`DeskPilot`] facade tying it all together.
//!
//! Tool execution itself lives in `deskpilot-kernel`.

pub mod config;
pub mod context;
pub mod entities;
pub mod error;
pub mod fuzzy;
pub mod interpreter;
pub mod service;
pub mod strategy;
pub mod trigger;
pub mod workflow;

pub use config::{EngineConfig, InterpreterConfig, WorkflowConfig};
pub use entities::{Entity, EntityKind};
pub use error::{IntentError, Result};
pub use interpreter::{CommandInterpreter, MatchSource, ParsedCommand, Suggestion};
pub use service::{CommandOutcome, DeskPilot, LoadFailure, LoadReport};
pub use strategy::{Candidate, Catalog, ExampleStrategy, FuzzyStrategy, MatchStrategy};
pub use trigger::{TriggerBinding, TriggerScheduler, TriggeredRun};
pub use workflow::{
    CancelToken, RetryPolicy, StepReport, StepState, TriggerSpec, WorkflowDefinition,
    WorkflowEngine, WorkflowOutcome, WorkflowResult, WorkflowStep,
};
