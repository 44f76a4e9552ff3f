//! Workflow engine.
//!
//! [`WorkflowEngine::validate`] turns a definition into an [`ExecutionPlan`]:
//! a dependency graph built from `dependsOn`, template references and
//! condition references, ordered topologically (ties broken by definition
//! order).  [`WorkflowEngine::run`] then advances the graph in batches:
//!
//! 1. Take the first pending step in plan order.  Its dependencies are all
//!    terminal by construction.
//! 2. If it belongs to a parallel group, every other pending member of that
//!    group whose dependencies are terminal joins the batch.
//! 3. Each batch member is checked for skipping (upstream failure, skipped
//!    template inputs, false condition), its parameters are rendered, and
//!    the survivors are dispatched concurrently.
//! 4. The engine waits for the whole batch, records results, and repeats.
//!
//! A run never returns an error for step-level problems; only structurally
//! invalid definitions are rejected, before anything executes.
//!
//! Runs of a definition that declares triggers hold a per-id turn for their
//! whole duration, so at most one of them is in flight per engine (and its
//! clones) whether it was started by hand or by a trigger.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deskpilot_kernel::{
    Event, EventBus, ExecutionCoordinator, KernelError, Origin, ToolParams, ToolResult,
};
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::Condition;
use super::definition::{ConditionSpec, WorkflowDefinition, WorkflowStep};
use super::template::{self, Scope};
use crate::config::WorkflowConfig;
use crate::error::{IntentError, Result};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation signal shared between a caller and a run.
///
/// Checked before every batch and between retry attempts.  Calls that are
/// already dispatched run to completion or timeout.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

/// Where a step is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's condition evaluated false.
    ConditionFalse,
    /// Every step its parameters reference was skipped.
    UpstreamSkipped,
    /// A dependency failed, or was skipped because of a failure.
    UpstreamFailed,
    /// An earlier step failed without `continueOnError`.
    Aborted,
}

/// Final state of one step in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub step_id: String,
    pub tool: String,
    pub state: StepState,
    /// Dispatch attempts made (0 if the step never ran).
    pub attempts: u32,
    /// The last attempt's result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
}

impl StepReport {
    fn pending(step: &WorkflowStep) -> Self {
        Self {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            state: StepState::Pending,
            attempts: 0,
            result: None,
            reason: None,
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a run: every step's terminal state plus the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub outcome: WorkflowOutcome,
    /// In definition order.
    pub steps: Vec<StepReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn step(&self, id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == id)
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == WorkflowOutcome::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PlanNode {
    id: String,
    /// Every dependency, by step index.
    deps: BTreeSet<usize>,
    /// Dependencies named in the parameter template.
    template_deps: BTreeSet<usize>,
    condition: Option<Condition>,
}

/// A validated definition: the dependency graph and its topological order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    order: Vec<usize>,
    nodes: Vec<PlanNode>,
}

impl ExecutionPlan {
    /// Step ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].id.as_str()).collect()
    }

    /// The steps `step` depends on, in definition order.
    pub fn dependencies(&self, step: &str) -> Option<Vec<&str>> {
        let node = &self.nodes[self.index(step)?];
        Some(node.deps.iter().map(|&d| self.nodes[d].id.as_str()).collect())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn index(&self, step: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == step)
    }
}

/// Kahn's algorithm; the ready set is ordered by definition index.
fn topological_order(nodes: &[PlanNode]) -> Result<Vec<usize>> {
    let mut waiting: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for &dep in &node.deps {
            dependents[dep].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| waiting[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &j in &dependents[i] {
            waiting[j] -= 1;
            if waiting[j] == 0 {
                ready.insert(j);
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(IntentError::Cycle {
            steps: find_cycle(nodes, &waiting),
        });
    }
    Ok(order)
}

/// Follow unfinished dependencies from the first stuck step until a step
/// repeats.  Every stuck step has a stuck dependency, so this terminates on
/// a cycle.
fn find_cycle(nodes: &[PlanNode], waiting: &[usize]) -> Vec<String> {
    let stuck = |i: usize| waiting[i] > 0;
    let Some(start) = (0..nodes.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    while let Some(next) = nodes[current].deps.iter().copied().find(|&d| stuck(d)) {
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|&i| nodes[i].id.clone()).collect();
            cycle.push(nodes[next].id.clone());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.iter().map(|&i| nodes[i].id.clone()).collect()
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct RunContext<'a> {
    workflow_id: &'a str,
    run_id: Uuid,
}

struct Attempted {
    state: StepState,
    attempts: u32,
    result: ToolResult,
}

/// Validates and runs workflow definitions.  Cheaply cloneable.
#[derive(Clone)]
pub struct WorkflowEngine {
    coordinator: ExecutionCoordinator,
    config: Arc<WorkflowConfig>,
    bus: Option<EventBus>,
    /// One turn per triggered workflow id, shared by every clone.
    turns: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(coordinator: ExecutionCoordinator, config: WorkflowConfig) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
            bus: None,
            turns: Arc::new(DashMap::new()),
        }
    }

    /// Publish step transitions and run outcomes on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // -- Validation ---------------------------------------------------------

    /// Check a definition and build its plan.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan> {
        let invalid = |reason: String| IntentError::InvalidDefinition {
            workflow: definition.id.clone(),
            reason,
        };

        if definition.id.trim().is_empty() {
            return Err(invalid("workflow id is empty".into()));
        }
        if definition.steps.is_empty() {
            return Err(invalid("workflow has no steps".into()));
        }
        if let Some(trigger) = &definition.trigger {
            trigger.check()?;
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(definition.steps.len());
        for (i, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(invalid(format!("step {i} has an empty id")));
            }
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(IntentError::DuplicateStep {
                    step: step.id.clone(),
                });
            }
        }

        let mut nodes = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            if !self.coordinator.registry().contains(&step.tool) {
                return Err(KernelError::ToolNotFound {
                    name: step.tool.clone(),
                }
                .into());
            }
            if step.retry.max == 0 {
                return Err(invalid(format!("step `{}` allows zero attempts", step.id)));
            }

            let condition = match &step.condition {
                None => None,
                Some(ConditionSpec::Literal(value)) => Some(Condition::literal(*value)),
                Some(ConditionSpec::Expr(source)) => Some(Condition::parse(source).map_err(
                    |reason| IntentError::InvalidCondition {
                        step: step.id.clone(),
                        reason,
                    },
                )?),
            };

            let resolve = |reference: &str| match index.get(reference) {
                Some(&i) if reference != step.id => Ok(i),
                _ => Err(IntentError::UnknownStep {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                }),
            };

            let template_refs = template::step_references(&step.params)
                .map_err(|reason| invalid(format!("step `{}`: {reason}", step.id)))?;
            let template_deps = template_refs
                .iter()
                .map(|r| resolve(r.as_str()))
                .collect::<Result<BTreeSet<usize>>>()?;

            let condition_refs: Vec<String> = condition
                .iter()
                .flat_map(Condition::references)
                .filter_map(|r| r.step().map(str::to_string))
                .collect();

            let mut deps = template_deps.clone();
            for reference in step.depends_on.iter().chain(&condition_refs) {
                deps.insert(resolve(reference.as_str())?);
            }

            if let Some(trigger) = &step.trigger {
                trigger.check()?;
                if !deps.is_empty() {
                    return Err(IntentError::InvalidTrigger {
                        reason: format!("step `{}` has a trigger but depends on other steps", step.id),
                    });
                }
            }

            nodes.push(PlanNode {
                id: step.id.clone(),
                deps,
                template_deps,
                condition,
            });
        }

        let order = topological_order(&nodes)?;
        debug!(workflow_id = %definition.id, steps = nodes.len(), "workflow validated");
        Ok(ExecutionPlan { order, nodes })
    }

    // -- Running ------------------------------------------------------------

    /// Validate and run a whole definition.
    pub async fn run(&self, definition: &WorkflowDefinition, input: ToolParams) -> Result<WorkflowResult> {
        self.run_with_cancel(definition, input, &CancelToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        input: ToolParams,
        cancel: &CancelToken,
    ) -> Result<WorkflowResult> {
        let plan = self.validate(definition)?;
        let members = plan.order.clone();
        let _turn = self.take_turn(definition, cancel).await;
        Ok(self.execute(definition, &plan, &members, input, cancel).await)
    }

    /// Run a single step on its own.  The step may not depend on others.
    pub async fn run_step(
        &self,
        definition: &WorkflowDefinition,
        step_id: &str,
        input: ToolParams,
        cancel: &CancelToken,
    ) -> Result<WorkflowResult> {
        let plan = self.validate(definition)?;
        let index = plan.index(step_id).ok_or_else(|| IntentError::StepNotFound {
            workflow: definition.id.clone(),
            step: step_id.to_string(),
        })?;
        if !plan.nodes[index].deps.is_empty() {
            return Err(IntentError::InvalidDefinition {
                workflow: definition.id.clone(),
                reason: format!("step `{step_id}` depends on other steps and cannot run alone"),
            });
        }
        let _turn = self.take_turn(definition, cancel).await;
        Ok(self.execute(definition, &plan, &[index], input, cancel).await)
    }

    /// Wait until no other run of this triggered definition is in flight.
    /// Untriggered definitions run freely.  Returns `None` without waiting
    /// further if `cancel` fires first; the run then settles as cancelled.
    async fn take_turn(
        &self,
        definition: &WorkflowDefinition,
        cancel: &CancelToken,
    ) -> Option<OwnedMutexGuard<()>> {
        if !definition.has_triggers() {
            return None;
        }
        let turn = Arc::clone(
            self.turns
                .entry(definition.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        if let Ok(guard) = Arc::clone(&turn).try_lock_owned() {
            return Some(guard);
        }

        debug!(workflow_id = %definition.id, "waiting for the previous run to finish");
        tokio::select! {
            guard = turn.lock_owned() => Some(guard),
            () = cancel.cancelled() => None,
        }
    }

    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        members: &[usize],
        input: ToolParams,
        cancel: &CancelToken,
    ) -> WorkflowResult {
        let ctx = RunContext {
            workflow_id: &definition.id,
            run_id: Uuid::now_v7(),
        };
        let started_at = Utc::now();
        info!(
            workflow_id = %definition.id,
            run_id = %ctx.run_id,
            steps = members.len(),
            "workflow run started"
        );

        let mut scope = Scope::new(&input);
        let mut reports: Vec<StepReport> = definition.steps.iter().map(StepReport::pending).collect();
        let mut cancelled = false;
        let mut aborted = false;

        loop {
            let pending: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| reports[i].state == StepState::Pending)
                .collect();
            let Some(&first) = pending.first() else {
                break;
            };

            if cancel.is_cancelled() {
                cancelled = true;
                for i in pending {
                    self.settle(&ctx, &mut reports[i], StepState::Cancelled, None);
                }
                break;
            }
            if aborted {
                for i in pending {
                    self.settle(&ctx, &mut reports[i], StepState::Skipped, Some(SkipReason::Aborted));
                }
                break;
            }

            let mut batch = vec![first];
            if let Some(group) = &definition.steps[first].parallel_group {
                batch.extend(pending[1..].iter().copied().filter(|&i| {
                    definition.steps[i].parallel_group.as_ref() == Some(group)
                        && plan.nodes[i].deps.iter().all(|&d| reports[d].state.is_terminal())
                }));
            }

            let mut dispatch = Vec::with_capacity(batch.len());
            for i in batch {
                match skip_reason(&plan.nodes[i], &reports, &scope) {
                    Some(reason) => {
                        self.settle(&ctx, &mut reports[i], StepState::Skipped, Some(reason));
                        scope.record_absent(&definition.steps[i].id);
                    }
                    None => dispatch.push((i, scope.render_params(&definition.steps[i].params))),
                }
            }
            if dispatch.len() > 1 {
                debug!(workflow_id = %definition.id, steps = dispatch.len(), "dispatching parallel batch");
            }

            let runs = dispatch.into_iter().map(|(i, params)| {
                self.attempt(&ctx, &definition.steps[i], params, cancel)
                    .map(move |attempted| (i, attempted))
            });
            for (i, attempted) in join_all(runs).await {
                let step = &definition.steps[i];
                match attempted.state {
                    StepState::Cancelled => {
                        cancelled = true;
                        scope.record_absent(&step.id);
                    }
                    StepState::Failed if !step.continue_on_error => {
                        aborted = true;
                        scope.record(&step.id, &attempted.result);
                    }
                    _ => scope.record(&step.id, &attempted.result),
                }
                let report = &mut reports[i];
                report.state = attempted.state;
                report.attempts = attempted.attempts;
                report.result = Some(attempted.result);
            }
        }

        let outcome = if cancelled {
            WorkflowOutcome::Cancelled
        } else if members.iter().any(|&i| {
            reports[i].state == StepState::Failed && !definition.steps[i].continue_on_error
        }) {
            WorkflowOutcome::Failed
        } else {
            WorkflowOutcome::Succeeded
        };

        let finished_at = Utc::now();
        info!(
            workflow_id = %definition.id,
            run_id = %ctx.run_id,
            outcome = %outcome,
            "workflow run finished"
        );
        if let Some(bus) = &self.bus {
            bus.publish(Event::WorkflowFinished {
                workflow_id: definition.id.clone(),
                run_id: ctx.run_id,
                outcome: outcome.to_string(),
                timestamp: finished_at,
            });
        }

        WorkflowResult {
            workflow_id: definition.id.clone(),
            run_id: ctx.run_id,
            outcome,
            steps: reports
                .into_iter()
                .enumerate()
                .filter(|(i, _)| members.contains(i))
                .map(|(_, report)| report)
                .collect(),
            started_at,
            finished_at,
        }
    }

    /// Dispatch one step, retrying per its policy.
    async fn attempt(
        &self,
        ctx: &RunContext<'_>,
        step: &WorkflowStep,
        params: ToolParams,
        cancel: &CancelToken,
    ) -> Attempted {
        let max = step.retry.max.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.publish(ctx, &step.id, StepState::Running, attempt);

            let origin = Origin::Step {
                workflow_id: ctx.workflow_id.to_string(),
                run_id: ctx.run_id,
                step_id: step.id.clone(),
                attempt,
            };
            let result = self
                .coordinator
                .dispatch_with_origin(&step.tool, params.clone(), origin)
                .await;

            if result.success {
                self.publish(ctx, &step.id, StepState::Succeeded, attempt);
                return Attempted {
                    state: StepState::Succeeded,
                    attempts: attempt,
                    result,
                };
            }

            let retryable = result.error_kind().is_none_or(|kind| kind.is_retryable());
            if !retryable || attempt >= max {
                warn!(
                    workflow_id = %ctx.workflow_id,
                    step_id = %step.id,
                    attempts = attempt,
                    error = %result.message,
                    "step failed"
                );
                self.publish(ctx, &step.id, StepState::Failed, attempt);
                return Attempted {
                    state: StepState::Failed,
                    attempts: attempt,
                    result,
                };
            }

            self.publish(ctx, &step.id, StepState::Pending, attempt);
            let delay = step.retry.backoff(attempt, self.config.max_backoff());
            debug!(step_id = %step.id, attempt, delay_ms = delay.as_millis() as u64, "retrying step");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {}
            }

            if cancel.is_cancelled() {
                self.publish(ctx, &step.id, StepState::Cancelled, attempt);
                return Attempted {
                    state: StepState::Cancelled,
                    attempts: attempt,
                    result,
                };
            }
        }
    }

    /// Move a step that never ran (or will not run again) to a terminal state.
    fn settle(
        &self,
        ctx: &RunContext<'_>,
        report: &mut StepReport,
        state: StepState,
        reason: Option<SkipReason>,
    ) {
        report.state = state;
        report.reason = reason;
        if let Some(reason) = reason {
            debug!(step_id = %report.step_id, ?reason, "step skipped");
        }
        self.publish(ctx, &report.step_id, state, report.attempts);
    }

    fn publish(&self, ctx: &RunContext<'_>, step_id: &str, state: StepState, attempt: u32) {
        debug!(
            workflow_id = %ctx.workflow_id,
            run_id = %ctx.run_id,
            step_id = %step_id,
            state = %state,
            attempt,
            "step state changed"
        );
        if let Some(bus) = &self.bus {
            bus.publish(Event::StepStateChanged {
                workflow_id: ctx.workflow_id.to_string(),
                run_id: ctx.run_id,
                step_id: step_id.to_string(),
                state: state.to_string(),
                attempt,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Decide, just before a step would start, whether it must be skipped.
fn skip_reason(node: &PlanNode, reports: &[StepReport], scope: &Scope) -> Option<SkipReason> {
    let upstream_failed = node.deps.iter().any(|&d| {
        reports[d].state == StepState::Failed || reports[d].reason == Some(SkipReason::UpstreamFailed)
    });
    if upstream_failed {
        return Some(SkipReason::UpstreamFailed);
    }

    if !node.template_deps.is_empty()
        && node
            .template_deps
            .iter()
            .all(|&d| reports[d].state == StepState::Skipped)
    {
        return Some(SkipReason::UpstreamSkipped);
    }

    if let Some(condition) = &node.condition
        && !condition.evaluate(scope)
    {
        return Some(SkipReason::ConditionFalse);
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::workflow::definition::TriggerSpec;
    use deskpilot_kernel::{
        Capability, CoordinatorConfig, FnCapability, ParamError, ParamType, ParameterSpec,
        ToolCategory, ToolErrorKind, ToolMetadata, ToolRegistry,
    };
    use serde_json::{Value, json};

    /// Accepts any parameters and returns them as data.
    struct Echo(ToolMetadata);

    #[async_trait::async_trait]
    impl Capability for Echo {
        fn metadata(&self) -> &ToolMetadata {
            &self.0
        }

        fn validate(&self, raw: &ToolParams) -> std::result::Result<ToolParams, Vec<ParamError>> {
            Ok(raw.clone())
        }

        async fn execute(&self, params: ToolParams) -> ToolResult {
            ToolResult::ok("echoed", Value::Object(params))
        }
    }

    fn meta(name: &str) -> ToolMetadata {
        ToolMetadata::new(name, "test tool", ToolCategory::Utilities)
    }

    /// Tools: `echo` returns its params, `fail` always fails, `flaky` fails
    /// until its third call, `slow` sleeps `ms`, `strict` needs `path`.
    fn engine() -> (WorkflowEngine, Arc<AtomicU32>) {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo(meta("echo")))).unwrap();
        registry
            .register(Arc::new(FnCapability::new(meta("fail"), |_params: ToolParams| async move {
                ToolResult::failure(ToolErrorKind::Execution, "always fails")
            })))
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register(Arc::new(FnCapability::new(meta("flaky"), move |_params: ToolParams| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        ToolResult::failure(ToolErrorKind::Execution, "not yet")
                    } else {
                        ToolResult::ok("finally", json!("done"))
                    }
                }
            })))
            .unwrap();
        registry
            .register(Arc::new(FnCapability::new(
                meta("slow").with_parameter(ParameterSpec::required("ms", ParamType::Number)),
                |params: ToolParams| async move {
                    let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ToolResult::ok("slept", json!(ms))
                },
            )))
            .unwrap();
        registry
            .register(Arc::new(FnCapability::new(
                meta("strict").with_parameter(ParameterSpec::required("path", ParamType::String)),
                |_params: ToolParams| async move { ToolResult::ok("ok", Value::Null) },
            )))
            .unwrap();

        let coordinator = ExecutionCoordinator::new(registry, CoordinatorConfig::default());
        (WorkflowEngine::new(coordinator, WorkflowConfig::default()), calls)
    }

    fn step(id: &str, tool: &str) -> WorkflowStep {
        WorkflowStep::new(id, tool)
    }

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        steps
            .into_iter()
            .fold(WorkflowDefinition::new("wf", "Test"), WorkflowDefinition::with_step)
    }

    // -- Validation ---------------------------------------------------------

    #[test]
    fn plan_orders_by_dependencies_then_definition() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("c", "echo").with_param("x", "{{steps.b}}"),
            step("a", "echo"),
            step("b", "echo").depends_on(["a"]),
            step("d", "echo"),
        ]);
        let plan = engine.validate(&def).unwrap();
        assert_eq!(plan.order(), vec!["a", "b", "c", "d"]);
        assert_eq!(plan.dependencies("c"), Some(vec!["b"]));
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn cycles_are_reported_with_their_path() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("start", "echo"),
            step("a", "echo").depends_on(["b"]),
            step("b", "echo").with_param("v", "{{steps.a.data}}"),
        ]);
        match engine.validate(&def) {
            Err(IntentError::Cycle { steps }) => assert_eq!(steps, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn structural_errors_are_rejected() {
        let (engine, _) = engine();

        let empty = WorkflowDefinition::new("empty", "Empty");
        assert!(matches!(engine.validate(&empty), Err(IntentError::InvalidDefinition { .. })));

        let dup = workflow(vec![step("a", "echo"), step("a", "echo")]);
        assert!(matches!(engine.validate(&dup), Err(IntentError::DuplicateStep { .. })));

        let missing_tool = workflow(vec![step("a", "nope")]);
        assert!(matches!(
            engine.validate(&missing_tool),
            Err(IntentError::Kernel(KernelError::ToolNotFound { .. }))
        ));

        let unknown = workflow(vec![step("a", "echo").depends_on(["ghost"])]);
        assert!(matches!(engine.validate(&unknown), Err(IntentError::UnknownStep { .. })));

        let own = workflow(vec![step("a", "echo").with_param("x", "{{steps.a}}")]);
        assert!(matches!(engine.validate(&own), Err(IntentError::UnknownStep { .. })));

        let bad_condition = workflow(vec![step("a", "echo").with_condition("steps. &&")]);
        assert!(matches!(engine.validate(&bad_condition), Err(IntentError::InvalidCondition { .. })));

        let no_attempts = workflow(vec![step("a", "echo").with_retry(0, 0)]);
        assert!(matches!(engine.validate(&no_attempts), Err(IntentError::InvalidDefinition { .. })));

        let bad_root = workflow(vec![step("a", "echo").with_param("x", "{{env.HOME}}")]);
        assert!(matches!(engine.validate(&bad_root), Err(IntentError::InvalidDefinition { .. })));
    }

    #[test]
    fn condition_references_create_dependencies() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("check", "echo").with_condition("steps.ping.success"),
            step("ping", "echo"),
        ]);
        assert_eq!(engine.validate(&def).unwrap().order(), vec!["ping", "check"]);
    }

    #[test]
    fn triggered_steps_must_stand_alone() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("a", "echo"),
            step("b", "echo")
                .depends_on(["a"])
                .with_trigger(TriggerSpec::Interval { ms: 1000 }),
        ]);
        assert!(matches!(engine.validate(&def), Err(IntentError::InvalidTrigger { .. })));

        let zero = workflow(vec![step("a", "echo").with_trigger(TriggerSpec::Interval { ms: 0 })]);
        assert!(matches!(engine.validate(&zero), Err(IntentError::InvalidTrigger { .. })));
    }

    // -- Running ------------------------------------------------------------

    #[tokio::test]
    async fn outputs_flow_between_steps() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("first", "echo").with_param("name", "{{input.who}}"),
            step("second", "echo").with_param("greeting", "hello {{steps.first.name}}"),
        ]);
        let mut input = ToolParams::new();
        input.insert("who".into(), json!("ada"));

        let result = engine.run(&def, input).await.unwrap();
        assert!(result.succeeded());
        let second = result.step("second").unwrap();
        assert_eq!(second.state, StepState::Succeeded);
        assert_eq!(second.result.as_ref().unwrap().data["greeting"], "hello ada");
    }

    #[tokio::test]
    async fn false_condition_skips_dependents() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("a", "echo").with_condition("input.enabled == true"),
            step("b", "echo").with_param("v", "{{steps.a.data}}"),
        ]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();

        let a = result.step("a").unwrap();
        assert_eq!(a.state, StepState::Skipped);
        assert_eq!(a.reason, Some(SkipReason::ConditionFalse));
        let b = result.step("b").unwrap();
        assert_eq!(b.state, StepState::Skipped);
        assert_eq!(b.reason, Some(SkipReason::UpstreamSkipped));
        assert_eq!(b.attempts, 0);
        assert!(result.succeeded());
        assert!(engine.coordinator().history().is_empty());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (engine, calls) = engine();
        let def = workflow(vec![step("s", "flaky").with_retry(3, 1)]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        let s = result.step("s").unwrap();
        assert_eq!(s.state, StepState::Succeeded);
        assert_eq!(s.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let (engine, _) = engine();
        let def = workflow(vec![step("s", "fail").with_retry(3, 1), step("after", "echo")]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Failed);
        let s = result.step("s").unwrap();
        assert_eq!(s.state, StepState::Failed);
        assert_eq!(s.attempts, 3);
        let after = result.step("after").unwrap();
        assert_eq!(after.state, StepState::Skipped);
        assert_eq!(after.reason, Some(SkipReason::Aborted));
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let (engine, _) = engine();
        let def = workflow(vec![step("s", "strict").with_retry(5, 1)]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        let s = result.step("s").unwrap();
        assert_eq!(s.state, StepState::Failed);
        assert_eq!(s.attempts, 1);
        assert_eq!(s.result.as_ref().unwrap().error_kind(), Some(ToolErrorKind::Validation));
    }

    #[tokio::test]
    async fn continue_on_error_keeps_independent_branches() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("bad", "fail").continue_on_error(),
            step("child", "echo").depends_on(["bad"]),
            step("grandchild", "echo").depends_on(["child"]),
            step("other", "echo"),
        ]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Succeeded);
        assert_eq!(result.step("bad").unwrap().state, StepState::Failed);
        assert_eq!(result.step("child").unwrap().reason, Some(SkipReason::UpstreamFailed));
        assert_eq!(result.step("grandchild").unwrap().reason, Some(SkipReason::UpstreamFailed));
        assert_eq!(result.step("other").unwrap().state, StepState::Succeeded);
    }

    #[tokio::test]
    async fn parallel_group_members_run_concurrently() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("one", "slow").with_param("ms", 300).in_group("g"),
            step("two", "slow").with_param("ms", 300).in_group("g"),
            step("three", "slow").with_param("ms", 300).in_group("g"),
        ]);
        let started = Instant::now();
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        assert!(result.succeeded());
        assert!(started.elapsed() < Duration::from_millis(800), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn steps_outside_groups_run_sequentially() {
        let (engine, _) = engine();
        let def = workflow(vec![
            step("one", "slow").with_param("ms", 150),
            step("two", "slow").with_param("ms", 150),
        ]);
        let started = Instant::now();
        engine.run(&def, ToolParams::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn triggered_runs_take_turns_across_clones() {
        let (engine, _) = engine();
        let other = engine.clone();
        let def = workflow(vec![step("a", "slow").with_param("ms", 150)])
            .with_trigger(TriggerSpec::Interval { ms: 60_000 });

        let (first, second) = tokio::join!(
            engine.run(&def, ToolParams::new()),
            other.run(&def, ToolParams::new()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.succeeded() && second.succeeded());
        assert!(
            second.started_at >= first.finished_at || first.started_at >= second.finished_at,
            "triggered runs overlapped"
        );
    }

    #[tokio::test]
    async fn untriggered_runs_may_overlap() {
        let (engine, _) = engine();
        let def = workflow(vec![step("a", "slow").with_param("ms", 150)]);

        let (first, second) = tokio::join!(
            engine.run(&def, ToolParams::new()),
            engine.run(&def, ToolParams::new()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(first.started_at < second.finished_at && second.started_at < first.finished_at);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_turn() {
        let (engine, _) = engine();
        let def = workflow(vec![step("a", "slow").with_param("ms", 400)])
            .with_trigger(TriggerSpec::Delay { ms: 60_000 });
        let token = CancelToken::new();

        let waiter = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let canceller = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                canceller.cancel();
            });
            let started = Instant::now();
            let result = engine.run_with_cancel(&def, ToolParams::new(), &token).await.unwrap();
            (result, started.elapsed())
        };
        let (holder, (waiting, waited)) = tokio::join!(engine.run(&def, ToolParams::new()), waiter);

        assert!(holder.unwrap().succeeded());
        assert_eq!(waiting.outcome, WorkflowOutcome::Cancelled);
        assert!(waited < Duration::from_millis(300), "{waited:?}");
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let (engine, _) = engine();
        let def = workflow(vec![step("a", "echo"), step("b", "echo")]);
        let token = CancelToken::new();
        token.cancel();
        let result = engine.run_with_cancel(&def, ToolParams::new(), &token).await.unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Cancelled);
        assert!(result.steps.iter().all(|s| s.state == StepState::Cancelled));
        assert!(engine.coordinator().history().is_empty());
    }

    #[tokio::test]
    async fn cancel_wakes_retry_backoff() {
        let (engine, _) = engine();
        let def = workflow(vec![step("s", "fail").with_retry(5, 10_000), step("next", "echo")]);
        let token = CancelToken::new();

        let handle = {
            let engine = engine.clone();
            let token = token.clone();
            tokio::spawn(async move { engine.run_with_cancel(&def, ToolParams::new(), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run should stop promptly")
            .unwrap()
            .unwrap();
        assert_eq!(result.outcome, WorkflowOutcome::Cancelled);
        assert_eq!(result.step("s").unwrap().state, StepState::Cancelled);
        assert_eq!(result.step("s").unwrap().attempts, 1);
        assert_eq!(result.step("next").unwrap().state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn transitions_are_published() {
        let (engine, _) = engine();
        let bus = EventBus::new(64);
        let engine = engine.with_bus(bus.clone());
        let mut rx = bus.subscribe();

        let def = workflow(vec![step("a", "echo")]);
        engine.run(&def, ToolParams::new()).await.unwrap();

        let mut states = Vec::new();
        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event.as_ref() {
                Event::StepStateChanged { state, .. } => states.push(state.clone()),
                Event::WorkflowFinished { outcome, .. } => finished = Some(outcome.clone()),
                _ => {}
            }
        }
        assert_eq!(states, vec!["running", "succeeded"]);
        assert_eq!(finished.as_deref(), Some("succeeded"));
    }

    #[tokio::test]
    async fn run_step_runs_one_step() {
        let (engine, _) = engine();
        let def = workflow(vec![step("a", "echo"), step("b", "echo").depends_on(["a"]), step("c", "echo")]);
        let token = CancelToken::new();

        let result = engine.run_step(&def, "c", ToolParams::new(), &token).await.unwrap();
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].step_id, "c");
        assert!(result.succeeded());

        assert!(matches!(
            engine.run_step(&def, "b", ToolParams::new(), &token).await,
            Err(IntentError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            engine.run_step(&def, "zzz", ToolParams::new(), &token).await,
            Err(IntentError::StepNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn step_origin_is_recorded() {
        let (engine, _) = engine();
        let def = workflow(vec![step("a", "echo")]);
        let result = engine.run(&def, ToolParams::new()).await.unwrap();
        let records = engine.coordinator().history().snapshot();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0].origin,
            Origin::Step { run_id, step_id, attempt: 1, .. } if *run_id == result.run_id && step_id == "a"
        ));
    }
}
