//! Built-in diagnostic tools and manifest factories.
//!
//! - `echo` returns its parameters as data.
//! - `wait` sleeps for `ms` milliseconds.
//! - `list_dir` lists the entries of a directory.
//!
//! Manifests can declare tools of kind `echo` (optionally with a fixed
//! `message` in `[config]`) and `wait` (with a default `ms`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deskpilot_kernel::{
    Capability, CapabilityFactory, FactorySet, FnCapability, KernelError, ParamError, ParamType,
    ParameterSpec, StaticSource, ToolCategory, ToolErrorKind, ToolMetadata, ToolParams, ToolResult,
    params,
};
use serde_json::{Value, json};

/// Upper bound on a single `wait` call.
const MAX_WAIT_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

/// Returns its parameters.  Tools without declared parameters accept any.
pub struct EchoTool {
    metadata: ToolMetadata,
    message: String,
}

impl EchoTool {
    pub fn new(metadata: ToolMetadata, message: impl Into<String>) -> Self {
        Self {
            metadata,
            message: message.into(),
        }
    }
}

#[async_trait]
impl Capability for EchoTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    fn validate(&self, raw: &ToolParams) -> std::result::Result<ToolParams, Vec<ParamError>> {
        if self.metadata.parameters.is_empty() {
            return Ok(raw.clone());
        }
        params::validate(&self.metadata.parameters, raw)
    }

    async fn execute(&self, params: ToolParams) -> ToolResult {
        ToolResult::ok(self.message.clone(), Value::Object(params))
    }
}

fn echo_metadata() -> ToolMetadata {
    ToolMetadata::new("echo", "Repeat the given text back", ToolCategory::Utilities)
        .with_keywords(["say", "repeat", "print"])
        .with_patterns(["echo {text...}", "say {text...}"])
        .with_examples(["echo hello world"])
}

// ---------------------------------------------------------------------------
// wait
// ---------------------------------------------------------------------------

fn wait_metadata(default_ms: Option<u64>) -> ToolMetadata {
    let ms = match default_ms {
        Some(ms) => ParameterSpec::optional("ms", ParamType::Number).with_default(ms),
        None => ParameterSpec::required("ms", ParamType::Number),
    };
    ToolMetadata::new("wait", "Pause for a number of milliseconds", ToolCategory::Utilities)
        .with_keywords(["sleep", "pause", "delay"])
        .with_patterns(["wait {ms} ms", "sleep {ms}"])
        .with_parameter(ms.with_description("Milliseconds to wait"))
}

fn wait_tool(metadata: ToolMetadata) -> Arc<dyn Capability> {
    Arc::new(FnCapability::new(metadata, |params: ToolParams| async move {
        let Some(ms) = params.get("ms").and_then(Value::as_u64) else {
            return ToolResult::failure(ToolErrorKind::Validation, "`ms` must be a non-negative integer");
        };
        if ms > MAX_WAIT_MS {
            return ToolResult::failure(
                ToolErrorKind::Validation,
                format!("`ms` may not exceed {MAX_WAIT_MS}"),
            );
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ToolResult::ok(format!("waited {ms} ms"), json!({ "ms": ms }))
    }))
}

// ---------------------------------------------------------------------------
// list_dir
// ---------------------------------------------------------------------------

fn list_dir_tool() -> Arc<dyn Capability> {
    let metadata = ToolMetadata::new("list_dir", "List the files in a directory", ToolCategory::FileOperations)
        .with_keywords(["list", "ls", "dir", "contents"])
        .with_patterns(["list {path}", "ls {path}"])
        .with_parameter(
            ParameterSpec::required("path", ParamType::File).with_description("Directory to list"),
        );

    Arc::new(FnCapability::new(metadata, |params: ToolParams| async move {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) => {
                return ToolResult::failure(ToolErrorKind::Execution, format!("cannot read {path}: {e}"));
            }
        };

        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => files.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => break,
                Err(e) => {
                    return ToolResult::failure(ToolErrorKind::Execution, format!("cannot read {path}: {e}"));
                }
            }
        }
        files.sort();

        let count = files.len();
        ToolResult::ok(
            format!("{count} entries in {path}"),
            json!({ "dir": path, "files": files, "count": count }),
        )
    }))
}

// ---------------------------------------------------------------------------
// Sources and factories
// ---------------------------------------------------------------------------

/// Every built-in tool.
pub fn source() -> StaticSource {
    StaticSource::new("builtin")
        .with_tool(Arc::new(EchoTool::new(echo_metadata(), "echoed")))
        .with_tool(wait_tool(wait_metadata(None)))
        .with_tool(list_dir_tool())
}

struct EchoFactory;

impl CapabilityFactory for EchoFactory {
    fn kind(&self) -> &str {
        "echo"
    }

    fn build(&self, metadata: ToolMetadata, config: &Value) -> deskpilot_kernel::Result<Arc<dyn Capability>> {
        let message = match config.get("message") {
            None | Some(Value::Null) => metadata.name.clone(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(KernelError::InvalidMetadata {
                    name: metadata.name.clone(),
                    reason: format!("`message` must be a string, got {other}"),
                });
            }
        };
        Ok(Arc::new(EchoTool::new(metadata, message)))
    }
}

struct WaitFactory;

impl CapabilityFactory for WaitFactory {
    fn kind(&self) -> &str {
        "wait"
    }

    fn build(&self, metadata: ToolMetadata, config: &Value) -> deskpilot_kernel::Result<Arc<dyn Capability>> {
        let default_ms = config.get("ms").and_then(Value::as_u64);
        let mut metadata = metadata;
        if metadata.parameters.is_empty() {
            metadata.parameters = wait_metadata(default_ms).parameters;
        }
        Ok(wait_tool(metadata))
    }
}

/// Factories for manifest-declared tools.
pub fn factories() -> FactorySet {
    FactorySet::new()
        .with_factory(Arc::new(EchoFactory))
        .with_factory(Arc::new(WaitFactory))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_kernel::{CoordinatorConfig, ExecutionCoordinator, ToolRegistry, ToolSource};

    fn coordinator() -> ExecutionCoordinator {
        let registry = ToolRegistry::new();
        let builtin: Arc<dyn ToolSource> = Arc::new(source());
        let report = registry.discover(&[builtin]);
        assert!(report.is_clean());
        ExecutionCoordinator::new(registry, CoordinatorConfig::default())
    }

    fn params(value: Value) -> ToolParams {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn echo_accepts_anything() {
        let result = coordinator()
            .dispatch("echo", params(json!({"text": "hi", "extra": 1})))
            .await;
        assert!(result.success);
        assert_eq!(result.data, json!({"text": "hi", "extra": 1}));
    }

    #[tokio::test]
    async fn wait_coerces_and_bounds_ms() {
        let coordinator = coordinator();
        let result = coordinator.dispatch("wait", params(json!({"ms": "5"}))).await;
        assert!(result.success, "{}", result.message);

        let result = coordinator.dispatch("wait", params(json!({"ms": 600_000}))).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Validation));

        let result = coordinator.dispatch("wait", ToolParams::new()).await;
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Validation));
    }

    #[tokio::test]
    async fn list_dir_lists_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();

        let path = dir.path().to_string_lossy().into_owned();
        let result = coordinator().dispatch("list_dir", params(json!({"path": path}))).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.data["files"], json!(["a.txt", "b.txt"]));
        assert_eq!(result.data["count"], json!(2));
    }

    #[test]
    fn echo_factory_checks_message_type() {
        let meta = ToolMetadata::new("greet", "Greet", ToolCategory::Utilities);
        assert!(EchoFactory.build(meta.clone(), &json!({"message": "hi"})).is_ok());
        assert!(EchoFactory.build(meta, &json!({"message": 3})).is_err());
    }

    #[tokio::test]
    async fn wait_factory_applies_default() {
        let meta = ToolMetadata::new("nap", "Short nap", ToolCategory::Utilities);
        let tool = WaitFactory.build(meta, &json!({"ms": 1})).unwrap();
        let validated = tool.validate(&ToolParams::new()).unwrap();
        assert_eq!(validated["ms"], json!(1));
        assert!(tool.execute(validated).await.success);
    }
}
