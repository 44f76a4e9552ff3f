//! Execution coordinator.
//!
//! Every tool call goes through [`ExecutionCoordinator::dispatch_with_origin`]:
//!
//! 1. look up the capability and bind that exact instance,
//! 2. validate parameters through the same instance,
//! 3. wait for a worker-pool permit,
//! 4. run `execute` on its own task under the configured timeout,
//! 5. append an [`ExecutionRecord`] and publish a completion event.
//!
//! A tool that panics or hangs only ever produces a failed [`ToolResult`]; the
//! coordinator and concurrent dispatches carry on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::capability::{ToolParams, ToolResult};
use crate::error::{KernelError, Result};
use crate::history::{ExecutionHistory, ExecutionRecord, Origin};
use crate::ipc::{Event, EventBus};
use crate::registry::{ToolRegistry, panic_message};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, |n| n.get());
    (cores * 4).max(16)
}

/// Tunables for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of tool calls running at once.
    pub pool_size: usize,
    /// Number of execution records kept in memory.
    pub history_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            pool_size: default_pool_size(),
            history_capacity: 256,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Routes validated calls to capabilities.  Cheaply cloneable.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    registry: ToolRegistry,
    config: Arc<CoordinatorConfig>,
    pool: Arc<Semaphore>,
    history: ExecutionHistory,
    bus: Option<EventBus>,
}

impl ExecutionCoordinator {
    pub fn new(registry: ToolRegistry, config: CoordinatorConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        let history = ExecutionHistory::new(config.history_capacity);
        Self {
            registry,
            config: Arc::new(config),
            pool,
            history,
            bus: None,
        }
    }

    /// Publish a [`Event::DispatchCompleted`] for every dispatch.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Number of tool calls that could start right now.
    pub fn available_workers(&self) -> usize {
        self.pool.available_permits()
    }

    /// Dispatch a call by name.
    pub async fn dispatch(&self, tool: &str, params: ToolParams) -> ToolResult {
        self.dispatch_with_origin(tool, params, Origin::Direct).await
    }

    /// Dispatch a call and record what caused it.
    pub async fn dispatch_with_origin(
        &self,
        tool: &str,
        params: ToolParams,
        origin: Origin,
    ) -> ToolResult {
        let started = Instant::now();
        let result = match self.run(tool, params.clone()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(tool = %tool, error = %e, "dispatch failed");
                ToolResult::from_error(&e)
            }
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let result = result.with_duration(elapsed);

        let record = ExecutionRecord::new(tool, params, origin, result.clone());
        tracing::info!(
            tool = %tool,
            success = result.success,
            duration_ms = elapsed,
            "dispatch complete"
        );
        if let Some(bus) = &self.bus {
            bus.publish(Event::DispatchCompleted {
                record_id: record.id,
                tool: tool.to_string(),
                success: result.success,
                duration_ms: elapsed,
                timestamp: record.timestamp,
            });
        }
        self.history.push(record);
        result
    }

    async fn run(&self, tool: &str, params: ToolParams) -> Result<ToolResult> {
        let capability = self.registry.lookup(tool)?;
        let params = capability
            .validate(&params)
            .map_err(|errors| KernelError::Validation {
                tool: tool.to_string(),
                errors,
            })?;

        let permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| KernelError::Internal("worker pool closed".into()))?;

        let timeout = self.config.timeout();
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            capability.execute(params).await
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(join_err)) if join_err.is_panic() => Err(KernelError::Execution {
                tool: tool.to_string(),
                reason: format!("tool panicked: {}", panic_message(join_err.into_panic().as_ref())),
            }),
            Ok(Err(_)) => Err(KernelError::Cancelled),
            Err(_) => {
                handle.abort();
                Err(KernelError::Timeout {
                    tool: tool.to_string(),
                    timeout,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
