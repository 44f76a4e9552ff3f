//! The capability contract every tool implements.
//!
//! A tool is a trait object implementing [`Capability`]: it describes itself
//! with [`ToolMetadata`], optionally overrides parameter validation, and
//! executes asynchronously, always producing a [`ToolResult`].  Failures are
//! reported inside the result rather than as a Rust error so that they can
//! cross the coordinator's fault-isolation boundary unchanged.

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelError, Result};
use crate::params::{self, ParamError};

/// Parameters passed to a tool: a JSON object keyed by parameter name.
pub type ToolParams = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Broad grouping used for listing and filtering tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileOperations,
    SystemControl,
    MediaProcessing,
    WebAutomation,
    Development,
    Communication,
    Productivity,
    Entertainment,
    Utilities,
    #[default]
    Custom,
}

impl ToolCategory {
    /// Every category, in declaration order.
    pub const ALL: [ToolCategory; 10] = [
        Self::FileOperations,
        Self::SystemControl,
        Self::MediaProcessing,
        Self::WebAutomation,
        Self::Development,
        Self::Communication,
        Self::Productivity,
        Self::Entertainment,
        Self::Utilities,
        Self::Custom,
    ];

    /// Wire name of the category (e.g. `file_operations`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileOperations => "file_operations",
            Self::SystemControl => "system_control",
            Self::MediaProcessing => "media_processing",
            Self::WebAutomation => "web_automation",
            Self::Development => "development",
            Self::Communication => "communication",
            Self::Productivity => "productivity",
            Self::Entertainment => "entertainment",
            Self::Utilities => "utilities",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolCategory {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| KernelError::Internal(format!("unknown tool category: {s}")))
    }
}

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    /// A filesystem path that must exist when the tool is called.
    File,
    /// One of a fixed set of string choices.
    Enum,
}

/// Declaration of a single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParameterSpec {
    /// A parameter the caller must always supply.
    pub fn required(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            choices: Vec::new(),
            description: String::new(),
        }
    }

    /// A parameter that may be omitted.
    pub fn optional(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Self-description of a tool.
///
/// `keywords` feed the fuzzy matcher, `patterns` are command templates such
/// as `copy {source} to {dest}` that become deterministic rules, and
/// `examples` are sample phrases used by the example-matching strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub category: ToolCategory,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl ToolMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            version: default_version(),
            keywords: Vec::new(),
            patterns: Vec::new(),
            examples: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples.extend(examples.into_iter().map(Into::into));
        self
    }

    pub fn with_parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    /// Look up a declared parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Structural check performed at registration time.
    pub fn check(&self) -> Result<()> {
        let invalid = |reason: String| KernelError::InvalidMetadata {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".into()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(invalid("name contains whitespace".into()));
        }
        if self.description.trim().is_empty() {
            return Err(invalid("description is empty".into()));
        }

        let mut seen = HashSet::new();
        for spec in &self.parameters {
            if spec.name.trim().is_empty() {
                return Err(invalid("parameter with empty name".into()));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(invalid(format!("duplicate parameter `{}`", spec.name)));
            }
            if spec.kind == ParamType::Enum && spec.choices.is_empty() {
                return Err(invalid(format!(
                    "enum parameter `{}` declares no choices",
                    spec.name
                )));
            }
            if let Some(default) = &spec.default
                && let Err(kind) = params::check_shape(spec, default)
            {
                return Err(invalid(format!(
                    "default for `{}` is invalid: {kind}",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Classification of a failed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Validation,
    NotFound,
    Timeout,
    Execution,
    Cancelled,
}

impl ToolErrorKind {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Execution)
    }
}

/// Structured error attached to a failed [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Outcome of a single tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    /// A successful result carrying `data`.
    pub fn ok(message: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: data.into(),
            error: None,
            duration_ms: 0,
        }
    }

    /// A failed result of the given kind.
    pub fn failure(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            message: message.clone(),
            data: Value::Null,
            error: Some(ToolError { kind, message }),
            duration_ms: 0,
        }
    }

    /// Map a kernel error onto a failed result.
    pub fn from_error(err: &KernelError) -> Self {
        let kind = match err {
            KernelError::Validation { .. } => ToolErrorKind::Validation,
            KernelError::ToolNotFound { .. } => ToolErrorKind::NotFound,
            KernelError::Timeout { .. } => ToolErrorKind::Timeout,
            KernelError::Cancelled => ToolErrorKind::Cancelled,
            _ => ToolErrorKind::Execution,
        };
        let mut message = err.to_string();
        if kind == ToolErrorKind::Timeout {
            message.push_str("; the action may still be running in the background");
        }
        Self::failure(kind, message)
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// The error kind, if this result is a failure.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// The contract every tool implements.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Static self-description.  Must be stable for the lifetime of the
    /// instance.
    fn metadata(&self) -> &ToolMetadata;

    /// Coerce and check raw parameters.
    ///
    /// The default implementation checks every declared [`ParameterSpec`] and
    /// reports all failures at once.
    fn validate(&self, raw: &ToolParams) -> std::result::Result<ToolParams, Vec<ParamError>> {
        params::validate(&self.metadata().parameters, raw)
    }

    /// Perform the action.  Called only with validated parameters.
    async fn execute(&self, params: ToolParams) -> ToolResult;
}

/// A [`Capability`] backed by an async closure.
pub struct FnCapability<F> {
    metadata: ToolMetadata,
    handler: F,
}

impl<F, Fut> FnCapability<F>
where
    F: Fn(ToolParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    pub fn new(metadata: ToolMetadata, handler: F) -> Self {
        Self { metadata, handler }
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(ToolParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn execute(&self, params: ToolParams) -> ToolResult {
        (self.handler)(params).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
