//! Bounded in-memory log of past executions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::{ToolParams, ToolResult};

/// What caused a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    /// An interpreted free-form command.
    Command { raw_text: String, confidence: f64 },
    /// A workflow step attempt.
    Step {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    /// A direct call by name.
    Direct,
}

/// One completed dispatch.  Never mutated after it is appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub parameters: ToolParams,
    pub origin: Origin,
    pub result: ToolResult,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn new(tool: impl Into<String>, parameters: ToolParams, origin: Origin, result: ToolResult) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            tool: tool.into(),
            parameters,
            origin,
            duration_ms: result.duration_ms,
            result,
        }
    }
}

/// Fixed-capacity execution log; the oldest record is dropped on overflow.
///
/// Cheaply cloneable.  The lock is held only for a push or a snapshot copy.
#[derive(Clone)]
pub struct ExecutionHistory {
    records: Arc<Mutex<VecDeque<ExecutionRecord>>>,
    capacity: usize,
}

impl ExecutionHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: ExecutionRecord) {
        let mut records = self.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// The most recent `limit` records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(256)
    }
}
