//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, engine construction, and output
//! formatting.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use deskpilot_intent::{DeskPilot, ParsedCommand, WorkflowResult};
use deskpilot_kernel::{FactorySet, ManifestDir, ToolParams, ToolResult, ToolSource};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::builtins;
use crate::config::AppConfig;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Build the facade: built-in tools, manifest tools, and startup workflows.
pub fn build_pilot(config: &AppConfig) -> Result<DeskPilot> {
    let pilot = DeskPilot::new(config.engine());

    let builtin: Arc<dyn ToolSource> = Arc::new(builtins::source());
    let mut sources = vec![builtin];
    if let Some(dir) = &config.discovery.manifest_dir {
        let factories: FactorySet = builtins::factories();
        let manifests = ManifestDir::new(dir, factories)
            .sources()
            .with_context(|| format!("failed to scan manifest directory {}", dir.display()))?;
        sources.extend(manifests);
    }

    let report = pilot.registry().discover(&sources);
    for failure in &report.failed {
        warn!(
            source = %failure.source,
            tool = ?failure.tool,
            reason = %failure.reason,
            "tool failed to load"
        );
    }
    info!(tools = report.loaded.len(), "tools registered");

    if let Some(dir) = &config.discovery.workflow_dir {
        load_workflow_dir(&pilot, dir)?;
    }
    Ok(pilot)
}

/// Load a workflow directory, logging files that were skipped.
pub fn load_workflow_dir(pilot: &DeskPilot, dir: &Path) -> Result<usize> {
    let report = pilot
        .load_workflows_from_dir(dir)
        .with_context(|| format!("failed to read workflow directory {}", dir.display()))?;
    for failure in &report.failures {
        eprintln!("  [!] {}: {}", failure.path.display(), failure.error);
    }
    Ok(report.loaded.len())
}

/// Parse a JSON object given on the command line.
pub fn parse_params(json: &str) -> Result<ToolParams> {
    let value: Value = serde_json::from_str(json).context("parameters are not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("parameters must be a JSON object, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_parsed(command: &ParsedCommand) {
    match &command.tool {
        Some(tool) => println!(
            "  -> {tool} (confidence: {:.0}%) {}",
            command.confidence * 100.0,
            Value::Object(command.parameters.clone())
        ),
        None => {
            println!("  I couldn't understand that.");
            if !command.suggestions.is_empty() {
                let names: Vec<&str> = command.suggestions.iter().map(|s| s.tool.as_str()).collect();
                println!("  Did you mean: {}?", names.join(", "));
            }
        }
    }
    if !command.unresolved_references.is_empty() {
        println!(
            "  (could not resolve: {})",
            command.unresolved_references.join(", ")
        );
    }
}

pub fn print_result(result: &ToolResult) {
    if result.success {
        println!("  [+] {} ({} ms)", result.message, result.duration_ms);
        if !result.data.is_null() {
            println!("{}", serde_json::to_string_pretty(&result.data).unwrap_or_default());
        }
    } else {
        let kind = result
            .error_kind()
            .map(|k| format!("{k:?}"))
            .unwrap_or_else(|| "error".to_string());
        println!("  [!] {kind}: {}", result.message);
    }
}

pub fn print_workflow(result: &WorkflowResult) {
    println!("  Workflow {} ({}): {}", result.workflow_id, result.run_id, result.outcome);
    for step in &result.steps {
        let detail = match (&step.reason, &step.result) {
            (Some(reason), _) => format!("{reason:?}"),
            (None, Some(r)) => r.message.clone(),
            (None, None) => String::new(),
        };
        println!(
            "    {:<20} {:<10} attempts={} {}",
            step.step_id, step.state, step.attempts, detail
        );
    }
}
