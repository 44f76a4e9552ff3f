//! Application configuration.
//!
//! Read from `config/default.toml` unless `--config` or `DESKPILOT_CONFIG`
//! names another file.  Every section is optional; missing keys keep their
//! defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use deskpilot_intent::{EngineConfig, InterpreterConfig, WorkflowConfig};
use deskpilot_kernel::CoordinatorConfig;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const CONFIG_ENV: &str = "DESKPILOT_CONFIG";

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[discovery]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directory of tool manifests loaded at startup.
    pub manifest_dir: Option<PathBuf>,
    /// Directory of workflow files loaded at startup.
    pub workflow_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub coordinator: CoordinatorConfig,
    pub interpreter: InterpreterConfig,
    pub workflow: WorkflowConfig,
    pub discovery: DiscoveryConfig,
}

impl AppConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            coordinator: self.coordinator.clone(),
            interpreter: self.interpreter.clone(),
            workflow: self.workflow.clone(),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse config")
    }
}

/// Load the config.  An explicitly named file must exist; a missing default
/// file yields the built-in defaults.
pub fn load(explicit: Option<&Path>) -> Result<AppConfig> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let path = match named {
        Some(path) => path,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                debug!("no config file, using defaults");
                return Ok(AppConfig::default());
            }
            default
        }
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    AppConfig::from_toml(&text).with_context(|| format!("in {}", path.display()))
}
