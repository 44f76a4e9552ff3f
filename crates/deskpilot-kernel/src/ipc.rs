//! In-process event bus.
//!
//! Registry changes, completed dispatches, and workflow step transitions are
//! published as [`Event`]s over a [`tokio::sync::broadcast`] channel.  Events
//! are wrapped in [`Arc`] so fan-out to several subscribers never clones the
//! payload.  Publishing with nobody listening is not an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// An event that flows through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A tool became available.
    ToolRegistered {
        name: String,
        category: String,
        generation: u64,
    },

    /// A tool's capability instance was swapped.
    ToolReloaded { name: String, generation: u64 },

    /// A tool was removed from the registry.
    ToolUnregistered { name: String, generation: u64 },

    /// A dispatch finished (successfully or not) and was recorded.
    DispatchCompleted {
        record_id: Uuid,
        tool: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A workflow step moved to a new state.
    StepStateChanged {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        /// New state as a string (e.g. "running", "skipped").
        state: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A workflow run reached its final outcome.
    WorkflowFinished {
        workflow_id: String,
        run_id: Uuid,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// A trigger enqueued a run.
    TriggerFired {
        workflow_id: String,
        step_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Arc<Event>>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publish an event, returning how many subscribers will see it.
    pub fn publish(&self, event: Event) -> usize {
        match self.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to all future events.  Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
