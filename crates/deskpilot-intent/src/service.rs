//! The `DeskPilot` service facade.
//!
//! Wires one registry, coordinator, interpreter, and workflow engine around
//! a shared [`EventBus`] and keeps the state a front end needs between calls:
//! loaded workflows, the window of recent commands used for context
//! resolution, and the one trigger scheduler.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use deskpilot_kernel::{
    EventBus, ExecutionCoordinator, ExecutionRecord, Origin, ToolMetadata, ToolParams,
    ToolRegistry, ToolResult,
};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{IntentError, Result};
use crate::interpreter::{CommandInterpreter, ParsedCommand};
use crate::trigger::TriggerScheduler;
use crate::workflow::{WorkflowDefinition, WorkflowEngine, WorkflowResult};

/// A workflow file that could not be loaded.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of [`DeskPilot::load_workflows_from_dir`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Ids of the workflows loaded, in file-name order.
    pub loaded: Vec<String>,
    pub failures: Vec<LoadFailure>,
}

/// Result of [`DeskPilot::execute_command`].
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub command: ParsedCommand,
    pub result: ToolResult,
}

/// Front door to the engine.  Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct DeskPilot {
    registry: ToolRegistry,
    coordinator: ExecutionCoordinator,
    interpreter: Arc<CommandInterpreter>,
    engine: WorkflowEngine,
    bus: EventBus,
    workflows: Arc<RwLock<BTreeMap<String, Arc<WorkflowDefinition>>>>,
    /// Successful commands, oldest first.
    recent: Arc<Mutex<VecDeque<ParsedCommand>>>,
    scheduler: Arc<tokio::sync::Mutex<TriggerScheduler>>,
}

impl DeskPilot {
    /// Build a facade around an empty registry.
    pub fn new(config: EngineConfig) -> Self {
        let bus = EventBus::default();
        Self::with_registry(ToolRegistry::with_bus(bus.clone()), bus, config)
    }

    /// Build a facade around an existing registry.  `bus` should be the one
    /// the registry publishes to, if any.
    pub fn with_registry(registry: ToolRegistry, bus: EventBus, config: EngineConfig) -> Self {
        let coordinator =
            ExecutionCoordinator::new(registry.clone(), config.coordinator).with_bus(bus.clone());
        let interpreter = CommandInterpreter::new(registry.clone(), config.interpreter);
        let engine = WorkflowEngine::new(coordinator.clone(), config.workflow).with_bus(bus.clone());
        let scheduler = TriggerScheduler::new(engine.clone()).with_bus(bus.clone());
        Self {
            registry,
            coordinator,
            interpreter: Arc::new(interpreter),
            engine,
            bus,
            workflows: Arc::new(RwLock::new(BTreeMap::new())),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            scheduler: Arc::new(tokio::sync::Mutex::new(scheduler)),
        }
    }

    /// Use a custom interpreter (e.g. one with an alternate strategy).  It
    /// should wrap this facade's registry.
    pub fn with_interpreter(mut self, interpreter: CommandInterpreter) -> Self {
        self.interpreter = Arc::new(interpreter);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn interpreter(&self) -> &CommandInterpreter {
        &self.interpreter
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Subscribe to registry, dispatch, workflow, and trigger events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Arc<deskpilot_kernel::Event>> {
        self.bus.subscribe()
    }

    // -- Tools --------------------------------------------------------------

    /// Metadata of every registered tool, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolMetadata> {
        let mut tools = self.registry.list_metadata();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Call a tool directly by name.
    pub async fn invoke_tool(&self, name: &str, params: ToolParams) -> ToolResult {
        self.coordinator
            .dispatch_with_origin(name, params, Origin::Direct)
            .await
    }

    // -- Commands -----------------------------------------------------------

    /// Interpret `text` against the recent-command window.  Nothing runs.
    pub fn interpret(&self, text: &str) -> ParsedCommand {
        let history: Vec<ParsedCommand> = self.recent().iter().cloned().collect();
        self.interpreter.parse(text, &history)
    }

    /// Interpret `text` and dispatch it if resolved.  Successful commands
    /// join the recent-command window.
    pub async fn execute_command(&self, text: &str) -> CommandOutcome {
        let command = self.interpret(text);
        let result = command.dispatch(&self.coordinator).await;

        if result.success {
            let window = self.interpreter.config().context_window;
            let mut recent = self.recent();
            recent.push_back(command.clone());
            while recent.len() > window {
                recent.pop_front();
            }
        }

        debug!(
            text = %text,
            tool = ?command.tool,
            confidence = command.confidence,
            success = result.success,
            "command executed"
        );
        CommandOutcome { command, result }
    }

    /// Recent successful commands, oldest first.
    pub fn recent_commands(&self) -> Vec<ParsedCommand> {
        self.recent().iter().cloned().collect()
    }

    pub fn clear_context(&self) {
        self.recent().clear();
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<ParsedCommand>> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Workflows ----------------------------------------------------------

    /// Validate and store a definition, replacing any with the same id.
    pub fn load_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let plan = self.engine.validate(&definition)?;
        info!(workflow_id = %definition.id, steps = plan.len(), "workflow loaded");
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Load every `.json` and `.toml` file in `dir`.  A file that fails to
    /// parse or validate is reported and skipped.
    pub fn load_workflows_from_dir(&self, dir: &Path) -> Result<LoadReport> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "json" || e == "toml")
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            let loaded = WorkflowDefinition::from_path(&path).and_then(|definition| {
                let id = definition.id.clone();
                self.load_workflow(definition).map(|()| id)
            });
            match loaded {
                Ok(id) => report.loaded.push(id),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping workflow file");
                    report.failures.push(LoadFailure {
                        path,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failures.len(),
            "workflow directory loaded"
        );
        Ok(report)
    }

    pub fn workflow(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Ids of the loaded workflows, sorted.
    pub fn list_workflows(&self) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Run a loaded workflow with `params` as its input.  A workflow with
    /// triggers waits for any triggered run of it to finish first.
    pub async fn run_workflow(&self, id: &str, params: ToolParams) -> Result<WorkflowResult> {
        let definition = self.workflow(id).ok_or_else(|| IntentError::WorkflowNotFound {
            workflow_id: id.to_string(),
        })?;
        self.engine.run(&definition, params).await
    }

    /// The facade's trigger scheduler, armed with every loaded workflow that
    /// declares triggers.  Every call returns the same scheduler; workflows
    /// loaded while it runs are armed on its next `start`.
    pub async fn trigger_scheduler(&self) -> Result<Arc<tokio::sync::Mutex<TriggerScheduler>>> {
        let scheduler = self.scheduler.lock().await;
        let definitions: Vec<Arc<WorkflowDefinition>> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for definition in definitions.into_iter().filter(|d| d.has_triggers()) {
            scheduler.add(definition.as_ref().clone()).await?;
        }
        drop(scheduler);
        Ok(Arc::clone(&self.scheduler))
    }

    // -- History ------------------------------------------------------------

    /// The `limit` most recent dispatches, oldest first.
    pub fn get_history(&self, limit: usize) -> Vec<ExecutionRecord> {
        self.coordinator.history().recent(limit)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowOutcome, WorkflowStep};
    use deskpilot_kernel::{FnCapability, ParamType, ParameterSpec, ToolCategory, ToolErrorKind};
    use serde_json::json;

    fn pilot() -> DeskPilot {
        let pilot = DeskPilot::new(EngineConfig::default());
        pilot
            .registry()
            .register(Arc::new(FnCapability::new(
                ToolMetadata::new("delete_file", "Delete a file", ToolCategory::FileOperations)
                    .with_keywords(["delete", "remove", "trash"])
                    .with_patterns(["delete {path}"])
                    .with_parameter(ParameterSpec::required("path", ParamType::String)),
                |params: ToolParams| async move {
                    ToolResult::ok("deleted", json!({"path": params["path"]}))
                },
            )))
            .unwrap();
        pilot
            .registry()
            .register(Arc::new(FnCapability::new(
                ToolMetadata::new("open_file", "Open a file", ToolCategory::FileOperations)
                    .with_keywords(["open", "show"])
                    .with_patterns(["open {path}"])
                    .with_parameter(ParameterSpec::required("path", ParamType::String)),
                |params: ToolParams| async move {
                    ToolResult::ok("opened", json!({"path": params["path"]}))
                },
            )))
            .unwrap();
        pilot
    }

    #[test]
    fn tools_are_listed_by_name() {
        let names: Vec<String> = pilot().list_tools().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["delete_file", "open_file"]);
    }

    #[tokio::test]
    async fn invoke_tool_records_direct_origin() {
        let pilot = pilot();
        let mut params = ToolParams::new();
        params.insert("path".into(), json!("/tmp/a.txt"));
        let result = pilot.invoke_tool("open_file", params).await;
        assert!(result.success);

        let history = pilot.get_history(10);
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0].origin, Origin::Direct));
    }

    #[tokio::test]
    async fn successful_commands_become_context() {
        let pilot = pilot();
        let first = pilot.execute_command("open /tmp/report.txt").await;
        assert!(first.result.success);
        assert_eq!(pilot.recent_commands().len(), 1);

        let second = pilot.execute_command("delete that file").await;
        assert!(second.result.success);
        assert_eq!(second.command.parameters["path"], json!("/tmp/report.txt"));
    }

    #[tokio::test]
    async fn failed_commands_are_not_remembered() {
        let pilot = pilot();
        let outcome = pilot.execute_command("zzzz qqqq").await;
        assert!(!outcome.command.is_resolved());
        assert_eq!(outcome.result.error_kind(), Some(ToolErrorKind::NotFound));
        assert!(pilot.recent_commands().is_empty());
        assert!(pilot.get_history(10).is_empty());
    }

    #[tokio::test]
    async fn context_window_is_bounded() {
        let pilot = pilot();
        let window = pilot.interpreter().config().context_window;
        for i in 0..window + 3 {
            pilot.execute_command(&format!("open /tmp/{i}.txt")).await;
        }
        let recent = pilot.recent_commands();
        assert_eq!(recent.len(), window);
        assert_eq!(recent[window - 1].parameters["path"], json!(format!("/tmp/{}.txt", window + 2)));

        pilot.clear_context();
        assert!(pilot.recent_commands().is_empty());
    }

    #[tokio::test]
    async fn workflows_load_and_run() {
        let pilot = pilot();
        let def = WorkflowDefinition::new("tidy", "Tidy")
            .with_step(WorkflowStep::new("open", "open_file").with_param("path", json!("{{input.target}}")))
            .with_step(
                WorkflowStep::new("delete", "delete_file")
                    .with_param("path", json!("{{steps.open.path}}")),
            );
        pilot.load_workflow(def).unwrap();
        assert_eq!(pilot.list_workflows(), vec!["tidy"]);

        let mut input = ToolParams::new();
        input.insert("target".into(), json!("/tmp/old.log"));
        let result = pilot.run_workflow("tidy", input).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Succeeded);
        assert_eq!(pilot.get_history(10).len(), 2);

        assert!(matches!(
            pilot.run_workflow("missing", ToolParams::new()).await,
            Err(IntentError::WorkflowNotFound { .. })
        ));
    }

    #[test]
    fn invalid_workflows_are_rejected() {
        let pilot = pilot();
        let def = WorkflowDefinition::new("bad", "Bad").with_step(WorkflowStep::new("a", "no_such_tool"));
        assert!(pilot.load_workflow(def).is_err());
        assert!(pilot.list_workflows().is_empty());
    }

    #[test]
    fn directory_loading_isolates_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"id": "open_one", "name": "Open", "steps": [{"id": "s", "tool": "open_file", "params": {"path": "/tmp/x"}}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.toml"),
            r#"
id = "delete_one"
name = "Delete"

[[steps]]
id = "s"
tool = "delete_file"
params = { path = "/tmp/y" }
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("c.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let pilot = pilot();
        let report = pilot.load_workflows_from_dir(dir.path()).unwrap();
        assert_eq!(report.loaded, vec!["open_one", "delete_one"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("c.json"));
    }

    #[test]
    fn deeply_nested_condition_fails_only_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let condition = format!("{}true", "!".repeat(100_000));
        let deep = json!({
            "id": "deep",
            "name": "Deep",
            "steps": [{"id": "s", "tool": "open_file", "params": {"path": "/tmp/x"}, "condition": condition}]
        });
        std::fs::write(dir.path().join("deep.json"), deep.to_string()).unwrap();
        std::fs::write(
            dir.path().join("fine.json"),
            r#"{"id": "fine", "name": "Fine", "steps": [{"id": "s", "tool": "open_file", "params": {"path": "/tmp/x"}}]}"#,
        )
        .unwrap();

        let pilot = pilot();
        let report = pilot.load_workflows_from_dir(dir.path()).unwrap();
        assert_eq!(report.loaded, vec!["fine"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("invalid condition"), "{}", report.failures[0].error);
    }

    #[tokio::test]
    async fn trigger_scheduler_picks_up_triggered_workflows() {
        use crate::workflow::TriggerSpec;

        let pilot = pilot();
        pilot
            .load_workflow(
                WorkflowDefinition::new("later", "Later")
                    .with_trigger(TriggerSpec::Delay { ms: 1000 })
                    .with_step(WorkflowStep::new("s", "open_file").with_param("path", json!("/tmp/x"))),
            )
            .unwrap();
        pilot
            .load_workflow(
                WorkflowDefinition::new("manual", "Manual")
                    .with_step(WorkflowStep::new("s", "open_file").with_param("path", json!("/tmp/x"))),
            )
            .unwrap();

        let scheduler = pilot.trigger_scheduler().await.unwrap();
        let triggers = scheduler.lock().await.triggers().await;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].workflow_id, "later");
    }

    /// Registers `tick`, which sleeps 150ms and tracks the peak number of
    /// calls in flight, and loads `busy`, which runs it every 30ms.
    fn busy_pilot() -> (DeskPilot, Arc<std::sync::atomic::AtomicUsize>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use crate::workflow::TriggerSpec;

        let pilot = DeskPilot::new(EngineConfig::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let peak_out = Arc::clone(&peak);
        pilot
            .registry()
            .register(Arc::new(FnCapability::new(
                ToolMetadata::new("tick", "Sleep briefly", ToolCategory::Utilities),
                move |_params: ToolParams| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        ToolResult::ok("tick", serde_json::Value::Null)
                    }
                },
            )))
            .unwrap();
        pilot
            .load_workflow(
                WorkflowDefinition::new("busy", "Busy")
                    .with_trigger(TriggerSpec::Interval { ms: 30 })
                    .with_step(WorkflowStep::new("a", "tick")),
            )
            .unwrap();
        (pilot, peak_out)
    }

    #[tokio::test]
    async fn manual_runs_wait_for_triggered_runs() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let (pilot, peak) = busy_pilot();
        let scheduler = pilot.trigger_scheduler().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scheduler.lock().await.start(tx).await.unwrap();

        // First trigger fires at 30ms; its run is in flight until ~180ms.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let manual = pilot.run_workflow("busy", ToolParams::new()).await.unwrap();
        assert_eq!(manual.outcome, WorkflowOutcome::Succeeded);

        let triggered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for triggered run")
            .expect("channel closed unexpectedly")
            .result
            .unwrap();
        scheduler.lock().await.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(
            manual.started_at >= triggered.finished_at || triggered.started_at >= manual.finished_at
        );
    }

    #[tokio::test]
    async fn trigger_scheduler_is_shared() {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let (pilot, peak) = busy_pilot();
        let first = pilot.trigger_scheduler().await.unwrap();
        let second = pilot.clone().trigger_scheduler().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.triggers().await.len(), 1);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        first.lock().await.start(tx.clone()).await.unwrap();
        assert!(matches!(
            second.lock().await.start(tx).await,
            Err(IntentError::SchedulerRunning)
        ));

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for triggered run")
                .expect("channel closed unexpectedly");
        }
        first.lock().await.stop().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
