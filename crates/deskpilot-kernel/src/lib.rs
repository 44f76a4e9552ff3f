//! DeskPilot kernel.
//!
//! Foundational services shared by the interpreter and the workflow engine:
//!
//! - **[`capability`]** -- the [`Capability`] trait every tool implements,
//!   plus tool metadata, parameter specs, and [`ToolResult`].
//! - **[`params`]** -- parameter coercion and all-errors validation.
//! - **[`registry`]** -- concurrent [`ToolRegistry`] backed by [`DashMap`]
//!   with discovery, atomic reload, and a generation counter.
//! - **[`discovery`]** -- tool sources, including manifest files resolved
//!   through [`CapabilityFactory`]s.
//! - **[`router`]** -- deterministic command rules: `{slot}` templates and
//!   regexes, prefiltered with aho-corasick.
//! - **[`coordinator`]** -- the [`ExecutionCoordinator`]: validation, bounded
//!   worker pool, timeouts, panic isolation.
//! - **[`history`]** -- bounded log of [`ExecutionRecord`]s.
//! - **[`ipc`]** -- broadcast [`EventBus`].
//! - **[`error`]** -- [`KernelError`] via [`thiserror`].
//!
//! [`DashMap`]: dashmap::DashMap

pub mod capability;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod history;
pub mod ipc;
pub mod params;
pub mod registry;
pub mod router;

pub use capability::{
    Capability, FnCapability, ParamType, ParameterSpec, ToolCategory, ToolError, ToolErrorKind,
    ToolMetadata, ToolParams, ToolResult,
};
pub use coordinator::{CoordinatorConfig, ExecutionCoordinator};
pub use discovery::{
    CapabilityFactory, FactorySet, ManifestDir, ManifestFile, StaticSource, ToolManifest,
    ToolSource,
};
pub use error::{KernelError, Result};
pub use history::{ExecutionHistory, ExecutionRecord, Origin};
pub use ipc::{Event, EventBus};
pub use params::{ParamError, ParamErrorKind};
pub use registry::{DiscoveryFailure, DiscoveryReport, ToolInfo, ToolRegistry};
pub use router::{CommandRule, RuleMatch, RuleSet};
