//! Tool capability registry.
//!
//! The registry maps tool names to live [`Capability`] instances.  It is
//! backed by [`DashMap`], so lookups from many tasks proceed concurrently and
//! a write only locks the shard holding the affected entry for the duration
//! of the insert.
//!
//! Lookups hand out an `Arc<dyn Capability>`; a reload swaps the map entry
//! but never touches instances already handed out, so a call in flight keeps
//! running against the version it bound.
//!
//! # Example
//!
//! ```rust
//! # use deskpilot_kernel::capability::{FnCapability, ToolCategory, ToolMetadata, ToolResult};
//! # use deskpilot_kernel::registry::ToolRegistry;
//! # use std::sync::Arc;
//! let registry = ToolRegistry::new();
//! let meta = ToolMetadata::new("ping", "Reply with pong", ToolCategory::Utilities);
//! registry
//!     .register(Arc::new(FnCapability::new(meta, |_| async { ToolResult::ok("pong", ()) })))
//!     .unwrap();
//! assert!(registry.lookup("ping").is_ok());
//! assert!(registry.lookup("pong").is_err());
//! ```

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, ToolCategory, ToolMetadata, ToolParams};
use crate::discovery::ToolSource;
use crate::error::{KernelError, Result};
use crate::ipc::{Event, EventBus};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Summary of a registered tool, as returned by listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub metadata: ToolMetadata,
    /// Registration sequence number; lower means registered earlier.
    pub seq: u64,
    /// Name of the discovery source, if the tool came from one.
    pub source: Option<String>,
    pub registered_at: DateTime<Utc>,
    /// How many times the capability instance has been swapped.
    pub reloads: u32,
}

/// A tool that failed to load during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    pub source: String,
    /// `None` when the whole source failed.
    pub tool: Option<String>,
    pub reason: String,
}

/// Result of a discovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Names of tools registered, in order.
    pub loaded: Vec<String>,
    pub failed: Vec<DiscoveryFailure>,
}

impl DiscoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ToolEntry {
    capability: Arc<dyn Capability>,
    seq: u64,
    source: Option<Arc<dyn ToolSource>>,
    registered_at: DateTime<Utc>,
    reloads: u32,
}

impl ToolEntry {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            metadata: self.capability.metadata().clone(),
            seq: self.seq,
            source: self.source.as_ref().map(|s| s.name()),
            registered_at: self.registered_at,
            reloads: self.reloads,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent tool registry.  Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct ToolRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tools: DashMap<String, ToolEntry>,
    next_seq: AtomicU64,
    generation: AtomicU64,
    bus: Option<EventBus>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty registry that publishes changes on `bus`.
    #[must_use]
    pub fn with_bus(bus: EventBus) -> Self {
        Self::build(Some(bus))
    }

    fn build(bus: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tools: DashMap::new(),
                next_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                bus,
            }),
        }
    }

    /// Register a capability under the name its metadata reports.
    ///
    /// Fails with [`KernelError::Conflict`] if the name is taken; use
    /// [`ToolRegistry::reload_with`] to replace an existing tool.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<()> {
        self.insert(capability, None)
    }

    fn insert(
        &self,
        capability: Arc<dyn Capability>,
        source: Option<Arc<dyn ToolSource>>,
    ) -> Result<()> {
        let metadata = capability.metadata();
        metadata.check()?;
        let name = metadata.name.clone();
        let category = metadata.category;

        match self.inner.tools.entry(name.clone()) {
            Entry::Occupied(_) => return Err(KernelError::Conflict { name }),
            Entry::Vacant(slot) => {
                slot.insert(ToolEntry {
                    capability,
                    seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
                    source,
                    registered_at: Utc::now(),
                    reloads: 0,
                });
            }
        }

        let generation = self.bump();
        tracing::info!(tool = %name, category = %category, "tool registered");
        self.publish(Event::ToolRegistered {
            name,
            category: category.to_string(),
            generation,
        });
        Ok(())
    }

    /// Remove a tool.  Calls already holding its capability are unaffected.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Capability>> {
        let (_, entry) = self
            .inner
            .tools
            .remove(name)
            .ok_or_else(|| KernelError::ToolNotFound { name: name.to_string() })?;
        let generation = self.bump();
        tracing::info!(tool = %name, "tool unregistered");
        self.publish(Event::ToolUnregistered {
            name: name.to_string(),
            generation,
        });
        Ok(entry.capability)
    }

    /// Return the currently registered capability for `name`.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn Capability>> {
        self.inner
            .tools
            .get(name)
            .map(|entry| Arc::clone(&entry.capability))
            .ok_or_else(|| KernelError::ToolNotFound { name: name.to_string() })
    }

    /// Metadata snapshot for `name`.
    pub fn metadata(&self, name: &str) -> Result<ToolMetadata> {
        self.lookup(name).map(|c| c.metadata().clone())
    }

    /// Validate raw parameters against the current capability for `name`.
    pub fn validate_parameters(&self, name: &str, raw: &ToolParams) -> Result<ToolParams> {
        let capability = self.lookup(name)?;
        capability.validate(raw).map_err(|errors| KernelError::Validation {
            tool: name.to_string(),
            errors,
        })
    }

    /// Re-load `name` from the source that originally provided it and swap
    /// the new instance in.
    pub fn reload(&self, name: &str) -> Result<()> {
        let source = {
            let entry = self
                .inner
                .tools
                .get(name)
                .ok_or_else(|| KernelError::ToolNotFound { name: name.to_string() })?;
            entry
                .source
                .clone()
                .ok_or_else(|| KernelError::ReloadUnavailable { name: name.to_string() })?
        };

        let loaded = guarded(|| source.load()).map_err(|reason| KernelError::Discovery {
            source_name: source.name(),
            reason,
        })??;

        let capability = loaded
            .into_iter()
            .find(|c| c.metadata().name == name)
            .ok_or_else(|| KernelError::Discovery {
                source_name: source.name(),
                reason: format!("source no longer provides `{name}`"),
            })?;

        self.reload_with(capability)
    }

    /// Atomically replace the capability registered under the new instance's
    /// name.  Registration order and source are preserved.
    pub fn reload_with(&self, capability: Arc<dyn Capability>) -> Result<()> {
        let metadata = capability.metadata();
        metadata.check()?;
        let name = metadata.name.clone();

        {
            let mut entry = self
                .inner
                .tools
                .get_mut(&name)
                .ok_or_else(|| KernelError::ToolNotFound { name: name.clone() })?;
            entry.capability = capability;
            entry.reloads += 1;
        }

        let generation = self.bump();
        tracing::info!(tool = %name, generation, "tool reloaded");
        self.publish(Event::ToolReloaded { name, generation });
        Ok(())
    }

    /// Load every tool from every source.
    ///
    /// Failures are isolated: a source that errors or panics, or a tool that
    /// fails registration, is recorded in the report and the pass continues.
    pub fn discover(&self, sources: &[Arc<dyn ToolSource>]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for source in sources {
            let source_name = source.name();
            let loaded = match guarded(|| source.load()) {
                Ok(Ok(tools)) => tools,
                Ok(Err(e)) => {
                    tracing::warn!(source = %source_name, error = %e, "discovery source failed");
                    report.failed.push(DiscoveryFailure {
                        source: source_name,
                        tool: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(reason) => {
                    tracing::warn!(source = %source_name, reason = %reason, "discovery source panicked");
                    report.failed.push(DiscoveryFailure {
                        source: source_name,
                        tool: None,
                        reason,
                    });
                    continue;
                }
            };

            for capability in loaded {
                let outcome = guarded(|| {
                    let name = capability.metadata().name.clone();
                    let result = self.insert(Arc::clone(&capability), Some(Arc::clone(source)));
                    (name, result)
                });
                match outcome {
                    Ok((name, Ok(()))) => report.loaded.push(name),
                    Ok((name, Err(e))) => {
                        tracing::warn!(source = %source_name, tool = %name, error = %e, "tool failed to register");
                        report.failed.push(DiscoveryFailure {
                            source: source_name.clone(),
                            tool: Some(name),
                            reason: e.to_string(),
                        });
                    }
                    Err(reason) => {
                        tracing::warn!(source = %source_name, reason = %reason, "tool panicked during registration");
                        report.failed.push(DiscoveryFailure {
                            source: source_name.clone(),
                            tool: None,
                            reason,
                        });
                    }
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "discovery complete"
        );
        report
    }

    /// All tools in registration order.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = self.inner.tools.iter().map(|e| e.value().info()).collect();
        tools.sort_by_key(|t| t.seq);
        tools
    }

    /// Metadata of all tools in registration order.
    pub fn list_metadata(&self) -> Vec<ToolMetadata> {
        self.list().into_iter().map(|t| t.metadata).collect()
    }

    /// Tools in a category, in registration order.
    pub fn by_category(&self, category: ToolCategory) -> Vec<ToolMetadata> {
        self.list_metadata()
            .into_iter()
            .filter(|m| m.category == category)
            .collect()
    }

    /// Case-insensitive substring search over name, description, and
    /// keywords.
    pub fn search(&self, query: &str) -> Vec<ToolMetadata> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        self.list_metadata()
            .into_iter()
            .filter(|m| {
                m.name.to_lowercase().contains(&query)
                    || m.description.to_lowercase().contains(&query)
                    || m.keywords.iter().any(|k| k.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tools.is_empty()
    }

    /// Mutation counter; advances on every register, reload, and unregister.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    // -- Private helpers ----------------------------------------------------

    fn bump(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.inner.bus {
            bus.publish(event);
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f`, converting a panic into its message.
fn guarded<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
