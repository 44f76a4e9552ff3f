//! Kernel error types.
//!
//! Every public API in this crate reports failures through [`KernelError`].
//! Variants carry the tool name and a structured reason so callers can map
//! them onto a [`ToolResult`](crate::capability::ToolResult) without parsing
//! strings.

use std::time::Duration;

use crate::params::ParamError;

/// Unified error type for the DeskPilot kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// No tool with this name is registered.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// A tool with this name is already registered.
    #[error("tool already registered: {name}")]
    Conflict { name: String },

    /// The metadata a capability reported failed the structural check.
    #[error("invalid metadata for tool `{name}`: {reason}")]
    InvalidMetadata { name: String, reason: String },

    /// The tool was registered directly and has no source to reload from.
    #[error("tool `{name}` has no discovery source to reload from")]
    ReloadUnavailable { name: String },

    /// A discovery source failed as a whole.
    #[error("discovery source `{source_name}` failed: {reason}")]
    Discovery { source_name: String, reason: String },

    // -- Dispatch errors ----------------------------------------------------
    /// One or more parameters failed validation.
    #[error("invalid parameters for `{tool}`: {}", join_errors(.errors))]
    Validation {
        tool: String,
        errors: Vec<ParamError>,
    },

    /// The tool call did not finish within the configured timeout.
    #[error("tool `{tool}` timed out after {}ms", .timeout.as_millis())]
    Timeout { tool: String, timeout: Duration },

    /// The tool call failed or panicked.
    #[error("tool `{tool}` failed: {reason}")]
    Execution { tool: String, reason: String },

    /// The operation was cancelled before it could run.
    #[error("operation cancelled")]
    Cancelled,

    // -- Rule errors --------------------------------------------------------
    /// A command template or regex could not be compiled.
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // -- I/O and serialization ----------------------------------------------
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[ParamError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
