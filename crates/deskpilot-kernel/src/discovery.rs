//! Tool discovery sources.
//!
//! A [`ToolSource`] produces capabilities on demand; the registry calls it at
//! discovery time and again when a tool is reloaded.  Besides in-memory
//! [`StaticSource`]s, tools can be declared in manifest files: each manifest
//! names a `kind`, which is resolved against the registered
//! [`CapabilityFactory`]s.  No code is loaded dynamically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::{Capability, ParameterSpec, ToolCategory, ToolMetadata};
use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Anything that can produce tools for the registry.
pub trait ToolSource: Send + Sync {
    /// Name used in logs and discovery reports.
    fn name(&self) -> String;

    /// Build fresh capability instances.
    fn load(&self) -> Result<Vec<Arc<dyn Capability>>>;
}

/// Builds a capability from declared metadata and free-form config.
pub trait CapabilityFactory: Send + Sync {
    /// The manifest `kind` this factory handles.
    fn kind(&self) -> &str;

    fn build(&self, metadata: ToolMetadata, config: &Value) -> Result<Arc<dyn Capability>>;
}

// ---------------------------------------------------------------------------
// StaticSource
// ---------------------------------------------------------------------------

/// A fixed list of capability instances.
pub struct StaticSource {
    name: String,
    tools: Vec<Arc<dyn Capability>>,
}

impl StaticSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Capability>) -> Self {
        self.tools.push(tool);
        self
    }
}

impl ToolSource for StaticSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn load(&self) -> Result<Vec<Arc<dyn Capability>>> {
        Ok(self.tools.clone())
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Set of factories keyed by `kind`.  Cheaply cloneable.
#[derive(Clone, Default)]
pub struct FactorySet {
    factories: Arc<HashMap<String, Arc<dyn CapabilityFactory>>>,
}

impl FactorySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, factory: Arc<dyn CapabilityFactory>) -> Self {
        Arc::make_mut(&mut self.factories).insert(factory.kind().to_string(), factory);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn CapabilityFactory>> {
        self.factories.get(kind).cloned()
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

// ---------------------------------------------------------------------------
// Manifests
// ---------------------------------------------------------------------------

/// On-disk tool declaration (TOML or JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    /// Factory kind used to build the capability.
    pub kind: String,
    #[serde(default)]
    pub category: ToolCategory,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub config: Value,
}

impl ToolManifest {
    /// Parse a manifest, choosing the format by file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match extension(path).as_deref() {
            Some("json") => Ok(serde_json::from_str(&text)?),
            _ => Ok(toml::from_str(&text)?),
        }
    }

    pub fn metadata(&self) -> ToolMetadata {
        let mut metadata = ToolMetadata::new(&self.name, &self.description, self.category)
            .with_keywords(self.keywords.iter().cloned())
            .with_patterns(self.patterns.iter().cloned())
            .with_examples(self.examples.iter().cloned());
        if let Some(version) = &self.version {
            metadata = metadata.with_version(version);
        }
        metadata.parameters = self.parameters.clone();
        metadata
    }
}

/// A single manifest file as a discovery source.
pub struct ManifestFile {
    path: PathBuf,
    factories: FactorySet,
}

impl ManifestFile {
    pub fn new(path: impl Into<PathBuf>, factories: FactorySet) -> Self {
        Self {
            path: path.into(),
            factories,
        }
    }
}

impl ToolSource for ManifestFile {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<Vec<Arc<dyn Capability>>> {
        let manifest = ToolManifest::from_path(&self.path)?;
        let factory = self
            .factories
            .get(&manifest.kind)
            .ok_or_else(|| KernelError::Discovery {
                source_name: self.name(),
                reason: format!("unknown tool kind `{}`", manifest.kind),
            })?;
        let capability = factory.build(manifest.metadata(), &manifest.config)?;
        Ok(vec![capability])
    }
}

/// A directory of manifests; every `*.toml` and `*.json` file becomes its own
/// source so that one bad manifest cannot hide the others.
pub struct ManifestDir {
    dir: PathBuf,
    factories: FactorySet,
}

impl ManifestDir {
    pub fn new(dir: impl Into<PathBuf>, factories: FactorySet) -> Self {
        Self {
            dir: dir.into(),
            factories,
        }
    }

    /// One source per manifest file, sorted by path.  A missing directory
    /// yields no sources.
    pub fn sources(&self) -> Result<Vec<Arc<dyn ToolSource>>> {
        if !self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "manifest directory does not exist");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && matches!(extension(&path).as_deref(), Some("toml" | "json")) {
                paths.push(path);
            }
        }
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|p| Arc::new(ManifestFile::new(p, self.factories.clone())) as Arc<dyn ToolSource>)
            .collect())
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{FnCapability, ParamType, ToolResult};
    use crate::registry::ToolRegistry;

    struct ReplyFactory;

    impl CapabilityFactory for ReplyFactory {
        fn kind(&self) -> &str {
            "reply"
        }

        fn build(&self, metadata: ToolMetadata, config: &Value) -> Result<Arc<dyn Capability>> {
            let reply = config
                .get("reply")
                .and_then(Value::as_str)
                .unwrap_or("ok")
                .to_string();
            Ok(Arc::new(FnCapability::new(metadata, move |_| {
                let reply = reply.clone();
                async move { ToolResult::ok(reply, Value::Null) }
            })))
        }
    }

    fn factories() -> FactorySet {
        FactorySet::new().with_factory(Arc::new(ReplyFactory))
    }

    #[test]
    fn toml_manifest_builds_tool() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greet.toml"),
            r#"
name = "greet"
description = "Say hello"
kind = "reply"
category = "communication"
keywords = ["hello", "greet"]
patterns = ["greet {who}"]

[[parameters]]
name = "who"
type = "string"
required = true

[config]
reply = "hi there"
"#,
        )
        .unwrap();

        let source = ManifestFile::new(dir.path().join("greet.toml"), factories());
        let tools = source.load().unwrap();
        let meta = tools[0].metadata();
        assert_eq!(meta.name, "greet");
        assert_eq!(meta.category, ToolCategory::Communication);
        assert_eq!(meta.parameters[0].kind, ParamType::String);
        assert_eq!(meta.patterns, vec!["greet {who}"]);
    }

    #[test]
    fn unknown_kind_is_a_discovery_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.json");
        std::fs::write(
            &path,
            r#"{"name": "odd", "description": "odd", "kind": "teleport"}"#,
        )
        .unwrap();
        let err = ManifestFile::new(path, factories()).load().err().unwrap();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn manifest_dir_isolates_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"name": "alpha", "description": "first", "kind": "reply"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("b.toml"), "this is = = not toml").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sources = ManifestDir::new(dir.path(), factories()).sources().unwrap();
        assert_eq!(sources.len(), 2);

        let registry = ToolRegistry::new();
        let report = registry.discover(&sources);
        assert_eq!(report.loaded, vec!["alpha"]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].source.ends_with("b.toml"));
    }

    #[test]
    fn missing_dir_yields_no_sources() {
        let sources = ManifestDir::new("/no/such/manifest/dir", factories())
            .sources()
            .unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn factory_kinds_are_sorted() {
        assert_eq!(factories().kinds(), vec!["reply"]);
    }
}
