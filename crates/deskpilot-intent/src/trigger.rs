//! Background trigger scheduler.
//!
//! Provides a [`TriggerScheduler`] that starts workflow runs on their own:
//! after a one-shot delay, on a fixed interval, or on a cron schedule.
//! Workflow-level triggers start whole runs; step-level triggers start
//! single-step runs.
//!
//! Every definition gets one *lane*: a task draining an unbounded queue of
//! run requests.  A lane runs one request at a time, so runs of the same
//! definition never overlap; a trigger that fires while a run is in progress
//! queues behind it instead of being dropped.  Completed runs are reported
//! as [`TriggeredRun`]s through a tokio channel.
//!
//! Cron expressions are parsed via the `cron` crate (6 or 7 fields).  Typical
//! 5-field input is normalized by prepending a `0` seconds field.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use deskpilot_kernel::{Event, EventBus, ToolParams};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{IntentError, Result};
use crate::workflow::{CancelToken, TriggerSpec, WorkflowDefinition, WorkflowEngine, WorkflowResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A trigger attached to a workflow or one of its steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBinding {
    pub workflow_id: String,
    /// `None` for a workflow-level trigger.
    pub step_id: Option<String>,
    pub spec: TriggerSpec,
}

/// Report of a run started by a trigger.
#[derive(Debug)]
pub struct TriggeredRun {
    pub workflow_id: String,
    pub step_id: Option<String>,
    /// When the trigger fired (the run may have started later).
    pub fired_at: DateTime<Utc>,
    pub result: Result<WorkflowResult>,
}

#[derive(Debug)]
struct RunRequest {
    step_id: Option<String>,
    fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Normalize a cron expression to the 6/7-field format expected by the
/// `cron` crate.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a cron expression string into a [`cron::Schedule`].
pub(crate) fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| IntentError::InvalidTrigger {
        reason: format!("invalid cron expression `{expr}`: {e}"),
    })
}

/// Time from `now` until the schedule's next occurrence.
fn next_cron_delay(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<Duration> {
    let next = schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
}

/// All triggers declared by a definition, workflow-level first.
fn bindings(definition: &WorkflowDefinition) -> Vec<TriggerBinding> {
    let workflow = definition.trigger.iter().map(|spec| TriggerBinding {
        workflow_id: definition.id.clone(),
        step_id: None,
        spec: spec.clone(),
    });
    let steps = definition.steps.iter().filter_map(|step| {
        step.trigger.as_ref().map(|spec| TriggerBinding {
            workflow_id: definition.id.clone(),
            step_id: Some(step.id.clone()),
            spec: spec.clone(),
        })
    });
    workflow.chain(steps).collect()
}

// ---------------------------------------------------------------------------
// TriggerScheduler
// ---------------------------------------------------------------------------

/// Starts workflow runs from their triggers.
pub struct TriggerScheduler {
    engine: WorkflowEngine,
    /// Definitions that declare at least one trigger.
    definitions: Arc<RwLock<Vec<Arc<WorkflowDefinition>>>>,
    bus: Option<EventBus>,
    /// Flag mirrored by the background tasks.
    running: Arc<AtomicBool>,
    shutdown: Option<CancelToken>,
    handles: Vec<JoinHandle<()>>,
}

impl TriggerScheduler {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            definitions: Arc::new(RwLock::new(Vec::new())),
            bus: None,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: None,
            handles: Vec::new(),
        }
    }

    /// Publish [`Event::TriggerFired`] whenever a trigger enqueues a run.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add a definition.  It is validated first; definitions without any
    /// trigger are ignored.  Returns the number of triggers added.
    ///
    /// Definitions added while the scheduler is running take effect on the
    /// next `start`.
    pub async fn add(&self, definition: WorkflowDefinition) -> Result<usize> {
        self.engine.validate(&definition)?;
        let count = bindings(&definition).len();
        if count == 0 {
            debug!(workflow_id = %definition.id, "workflow has no triggers");
            return Ok(0);
        }

        info!(workflow_id = %definition.id, triggers = count, "adding workflow triggers");
        let mut definitions = self.definitions.write().await;
        definitions.retain(|d| d.id != definition.id);
        definitions.push(Arc::new(definition));
        Ok(count)
    }

    /// Remove a definition's triggers.
    pub async fn remove(&self, workflow_id: &str) -> Result<()> {
        let mut definitions = self.definitions.write().await;
        let before = definitions.len();
        definitions.retain(|d| d.id != workflow_id);
        if definitions.len() == before {
            return Err(IntentError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            });
        }
        info!(workflow_id = %workflow_id, "workflow triggers removed");
        Ok(())
    }

    /// Every registered trigger.
    pub async fn triggers(&self) -> Vec<TriggerBinding> {
        self.definitions
            .read()
            .await
            .iter()
            .flat_map(|d| bindings(d))
            .collect()
    }

    /// Start one lane per definition and one timer per trigger.
    pub async fn start(&mut self, reports: mpsc::UnboundedSender<TriggeredRun>) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(IntentError::SchedulerRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        let shutdown = CancelToken::new();
        let definitions = self.definitions.read().await.clone();

        for definition in definitions {
            let (lane_tx, lane_rx) = mpsc::unbounded_channel();
            self.handles.push(tokio::spawn(drain_lane(
                self.engine.clone(),
                Arc::clone(&definition),
                lane_rx,
                reports.clone(),
                shutdown.clone(),
            )));

            for binding in bindings(&definition) {
                debug!(
                    workflow_id = %binding.workflow_id,
                    step_id = ?binding.step_id,
                    trigger = %binding.spec,
                    "arming trigger"
                );
                let timer = Timer {
                    binding,
                    lane: lane_tx.clone(),
                    bus: self.bus.clone(),
                    running: Arc::clone(&self.running),
                };
                self.handles.push(tokio::spawn(timer.drive(shutdown.clone())));
            }
        }

        info!(tasks = self.handles.len(), "trigger scheduler started");
        self.shutdown = Some(shutdown);
        Ok(())
    }

    /// Stop every timer, cancel runs in progress, and wait for the tasks.
    pub async fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("stop called but trigger scheduler is not running");
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "trigger task panicked during shutdown");
            }
        }

        info!("trigger scheduler shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Run queued requests for one definition, one at a time.
async fn drain_lane(
    engine: WorkflowEngine,
    definition: Arc<WorkflowDefinition>,
    mut requests: mpsc::UnboundedReceiver<RunRequest>,
    reports: mpsc::UnboundedSender<TriggeredRun>,
    shutdown: CancelToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            request = requests.recv() => request,
        };
        let Some(request) = request else {
            break;
        };

        let result = match &request.step_id {
            Some(step) => {
                engine
                    .run_step(&definition, step, ToolParams::new(), &shutdown)
                    .await
            }
            None => {
                engine
                    .run_with_cancel(&definition, ToolParams::new(), &shutdown)
                    .await
            }
        };
        if let Err(e) = &result {
            warn!(workflow_id = %definition.id, error = %e, "triggered run rejected");
        }

        let run = TriggeredRun {
            workflow_id: definition.id.clone(),
            step_id: request.step_id,
            fired_at: request.fired_at,
            result,
        };
        if reports.send(run).is_err() {
            debug!(workflow_id = %definition.id, "trigger report receiver dropped");
        }
    }
    debug!(workflow_id = %definition.id, "trigger lane stopped");
}

struct Timer {
    binding: TriggerBinding,
    lane: mpsc::UnboundedSender<RunRequest>,
    bus: Option<EventBus>,
    running: Arc<AtomicBool>,
}

impl Timer {
    async fn drive(self, shutdown: CancelToken) {
        match self.binding.spec.clone() {
            TriggerSpec::Delay { ms } => {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(ms)) => {
                        self.fire();
                    }
                    () = shutdown.cancelled() => {}
                }
            }
            TriggerSpec::Interval { ms } => {
                let period = Duration::from_millis(ms.max(1));
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !self.fire() {
                                break;
                            }
                        }
                        () = shutdown.cancelled() => break,
                    }
                }
            }
            TriggerSpec::Cron { expression } => {
                let schedule = match parse_schedule(&expression) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        error!(workflow_id = %self.binding.workflow_id, error = %e, "cron trigger disabled");
                        return;
                    }
                };
                while let Some(delay) = next_cron_delay(&schedule, Utc::now()) {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {
                            if !self.fire() {
                                break;
                            }
                        }
                        () = shutdown.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Enqueue a run.  Returns `false` once the scheduler is shutting down.
    fn fire(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let fired_at = Utc::now();
        debug!(
            workflow_id = %self.binding.workflow_id,
            step_id = ?self.binding.step_id,
            "trigger fired"
        );
        if let Some(bus) = &self.bus {
            bus.publish(Event::TriggerFired {
                workflow_id: self.binding.workflow_id.clone(),
                step_id: self.binding.step_id.clone(),
                timestamp: fired_at,
            });
        }
        self.lane
            .send(RunRequest {
                step_id: self.binding.step_id.clone(),
                fired_at,
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::config::WorkflowConfig;
    use crate::workflow::{WorkflowOutcome, WorkflowStep};
    use deskpilot_kernel::{
        CoordinatorConfig, ExecutionCoordinator, FnCapability, ToolCategory, ToolMetadata,
        ToolRegistry, ToolResult,
    };

    /// Engine with a `tick` tool that sleeps `delay_ms` and tracks how many
    /// calls are in flight at once.
    fn engine(delay_ms: u64) -> (WorkflowEngine, Arc<AtomicUsize>) {
        let registry = ToolRegistry::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let peak_out = Arc::clone(&peak);
        registry
            .register(Arc::new(FnCapability::new(
                ToolMetadata::new("tick", "Sleep briefly", ToolCategory::Utilities),
                move |_params: ToolParams| {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        ToolResult::ok("tick", serde_json::Value::Null)
                    }
                },
            )))
            .unwrap();
        let coordinator = ExecutionCoordinator::new(registry, CoordinatorConfig::default());
        (WorkflowEngine::new(coordinator, WorkflowConfig::default()), peak_out)
    }

    #[test]
    fn cron_expressions_are_normalized() {
        assert!(parse_schedule("0 30 9 * * 1-5").is_ok());
        assert!(parse_schedule("30 9 * * 1-5").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[test]
    fn next_cron_delay_is_bounded() {
        let schedule = parse_schedule("* * * * * *").unwrap();
        let delay = next_cron_delay(&schedule, Utc::now()).unwrap();
        assert!(delay <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn untriggered_workflows_are_ignored() {
        let (engine, _) = engine(0);
        let scheduler = TriggerScheduler::new(engine);
        let def = WorkflowDefinition::new("plain", "Plain").with_step(WorkflowStep::new("a", "tick"));
        assert_eq!(scheduler.add(def).await.unwrap(), 0);
        assert!(scheduler.triggers().await.is_empty());
        assert!(scheduler.remove("plain").await.is_err());
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let (engine, _) = engine(0);
        let scheduler = TriggerScheduler::new(engine);
        let def = WorkflowDefinition::new("bad", "Bad")
            .with_trigger(TriggerSpec::Delay { ms: 1 })
            .with_step(WorkflowStep::new("a", "missing_tool"));
        assert!(scheduler.add(def).await.is_err());
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let (engine, _) = engine(0);
        let mut scheduler = TriggerScheduler::new(engine);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(!scheduler.is_running());
        scheduler.start(tx.clone()).await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(tx).await, Err(IntentError::SchedulerRunning)));

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn delay_trigger_fires_once() {
        let (engine, _) = engine(0);
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let mut scheduler = TriggerScheduler::new(engine).with_bus(bus);
        scheduler
            .add(
                WorkflowDefinition::new("once", "Once")
                    .with_trigger(TriggerSpec::Delay { ms: 20 })
                    .with_step(WorkflowStep::new("a", "tick")),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.start(tx).await.unwrap();
        let run = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for triggered run")
            .expect("channel closed unexpectedly");
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        assert_eq!(run.workflow_id, "once");
        assert_eq!(run.step_id, None);
        assert_eq!(run.result.unwrap().outcome, WorkflowOutcome::Succeeded);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            events.try_recv().map(|e| (*e).clone()),
            Ok(Event::TriggerFired { ref workflow_id, .. }) if workflow_id == "once"
        ));
    }

    #[tokio::test]
    async fn overlapping_interval_runs_are_serialized() {
        let (engine, peak) = engine(120);
        let mut scheduler = TriggerScheduler::new(engine);
        scheduler
            .add(
                WorkflowDefinition::new("busy", "Busy")
                    .with_trigger(TriggerSpec::Interval { ms: 30 })
                    .with_step(WorkflowStep::new("a", "tick")),
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.start(tx).await.unwrap();

        let mut runs = Vec::new();
        while runs.len() < 3 {
            let run = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for triggered run")
                .expect("channel closed unexpectedly");
            runs.push(run.result.unwrap());
        }
        scheduler.stop().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        for pair in runs.windows(2) {
            assert!(pair[1].started_at >= pair[0].finished_at);
        }
    }

    #[tokio::test]
    async fn step_triggers_run_only_their_step() {
        let (engine, _) = engine(0);
        let mut scheduler = TriggerScheduler::new(engine);
        let def = WorkflowDefinition::new("mixed", "Mixed")
            .with_step(WorkflowStep::new("a", "tick"))
            .with_step(WorkflowStep::new("b", "tick").with_trigger(TriggerSpec::Delay { ms: 10 }));
        assert_eq!(scheduler.add(def).await.unwrap(), 1);
        assert_eq!(scheduler.triggers().await[0].step_id.as_deref(), Some("b"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.start(tx).await.unwrap();
        let run = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for triggered run")
            .expect("channel closed unexpectedly");
        scheduler.stop().await;

        assert_eq!(run.step_id.as_deref(), Some("b"));
        let result = run.result.unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step_id, "b");
    }
}
