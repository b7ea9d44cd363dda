//! TelemetryBus - ordered event stream with plugin fan-out
//!
//! - `Event`: envelope with id + ISO-8601 UTC timestamp + kind
//! - `EventKind`: the full emitted taxonomy, serde-tagged snake_case
//! - `TelemetryBus`: append-only buffer, synchronous in-order dispatch
//!
//! Plugins receive deep copies and can never mutate engine state. Plugin
//! failures (returned errors or panics) become `plugin_error` events and
//! are swallowed; they never abort execution.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ArborError, ErrorKind, Result};

/// Single event in the engine's telemetry stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Wall-clock emission time, ISO-8601 UTC on the wire
    pub timestamp: DateTime<Utc>,
    /// Event type and payload
    pub kind: EventKind,
}

/// The full emitted event set.
///
/// Uses Arc<str> for id fields to enable zero-cost cloning; payloads never
/// contain secret material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskStarted {
        task_id: Arc<str>,
        input: Value,
    },
    TaskCompleted {
        task_id: Arc<str>,
        output: Value,
    },
    TaskFailed {
        task_id: Arc<str>,
        error: String,
        #[serde(default)]
        error_kind: Option<ErrorKind>,
    },
    TaskCancelled {
        task_id: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // NODE LEVEL
    // ═══════════════════════════════════════════
    NodeStarted {
        task_id: Arc<str>,
        node_id: Arc<str>,
    },
    NodeCompleted {
        task_id: Arc<str>,
        node_id: Arc<str>,
        duration_ms: u64,
    },
    NodeFailed {
        task_id: Arc<str>,
        node_id: Arc<str>,
        error: String,
        #[serde(default)]
        error_kind: Option<ErrorKind>,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // CONTEXT ASSEMBLY
    // ═══════════════════════════════════════════
    ContextAssembled {
        task_id: Arc<str>,
        node_id: Arc<str>,
        profile_id: String,
        total_tokens: u32,
        compression_ratio: f32,
        fingerprint: String,
    },
    ContextDegraded {
        task_id: Arc<str>,
        node_id: Arc<str>,
        /// Tier names that were unavailable
        tiers: Vec<String>,
    },

    // ═══════════════════════════════════════════
    // ROUTING
    // ═══════════════════════════════════════════
    RoutingDecision {
        task_id: Arc<str>,
        from_node: Arc<str>,
        to_node: Arc<str>,
        #[serde(default)]
        edge_label: Option<String>,
        #[serde(default)]
        decision_key: Option<String>,
    },
    RoutingBranch {
        task_id: Arc<str>,
        node_id: Arc<str>,
        clones: Vec<Arc<str>>,
    },
    RoutingSplit {
        task_id: Arc<str>,
        node_id: Arc<str>,
        subtasks: Vec<Arc<str>>,
    },
    RoutingMerge {
        task_id: Arc<str>,
        node_id: Arc<str>,
        policy: String,
        arrivals: usize,
    },
    CloneCreated {
        task_id: Arc<str>,
        parent_task_id: Arc<str>,
        #[serde(default)]
        branch_label: Option<String>,
    },
    SubtaskCreated {
        task_id: Arc<str>,
        parent_task_id: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // TOOL DISPATCH
    // ═══════════════════════════════════════════
    ToolInvoked {
        task_id: Arc<str>,
        node_id: Arc<str>,
        call_id: String,
        tool: String,
    },
    ToolCompleted {
        task_id: Arc<str>,
        node_id: Arc<str>,
        call_id: String,
        tool: String,
        duration_ms: u64,
    },
    ToolFailed {
        task_id: Arc<str>,
        node_id: Arc<str>,
        call_id: String,
        tool: String,
        error: String,
    },

    // ═══════════════════════════════════════════
    // CHECKPOINTS
    // ═══════════════════════════════════════════
    CheckpointSaved {
        task_id: Arc<str>,
        manifest_hash: String,
        bytes: usize,
    },
    CheckpointRestored {
        task_id: Arc<str>,
        manifest_hash: String,
    },

    // ═══════════════════════════════════════════
    // ENGINE / QUEUE
    // ═══════════════════════════════════════════
    PluginError {
        plugin_id: String,
        error: String,
    },
    QueueFull {
        capacity: usize,
    },
    Queued {
        task_id: Arc<str>,
        depth: usize,
    },
    Dequeued {
        task_id: Arc<str>,
    },
}

impl EventKind {
    /// The wire name of this event type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::ContextAssembled { .. } => "context_assembled",
            Self::ContextDegraded { .. } => "context_degraded",
            Self::RoutingDecision { .. } => "routing_decision",
            Self::RoutingBranch { .. } => "routing_branch",
            Self::RoutingSplit { .. } => "routing_split",
            Self::RoutingMerge { .. } => "routing_merge",
            Self::CloneCreated { .. } => "clone_created",
            Self::SubtaskCreated { .. } => "subtask_created",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ToolFailed { .. } => "tool_failed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::CheckpointRestored { .. } => "checkpoint_restored",
            Self::PluginError { .. } => "plugin_error",
            Self::QueueFull { .. } => "queue_full",
            Self::Queued { .. } => "queued",
            Self::Dequeued { .. } => "dequeued",
        }
    }

    /// Extract task_id if the event is task-scoped
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::NodeStarted { task_id, .. }
            | Self::NodeCompleted { task_id, .. }
            | Self::NodeFailed { task_id, .. }
            | Self::ContextAssembled { task_id, .. }
            | Self::ContextDegraded { task_id, .. }
            | Self::RoutingDecision { task_id, .. }
            | Self::RoutingBranch { task_id, .. }
            | Self::RoutingSplit { task_id, .. }
            | Self::RoutingMerge { task_id, .. }
            | Self::CloneCreated { task_id, .. }
            | Self::SubtaskCreated { task_id, .. }
            | Self::ToolInvoked { task_id, .. }
            | Self::ToolCompleted { task_id, .. }
            | Self::ToolFailed { task_id, .. }
            | Self::CheckpointSaved { task_id, .. }
            | Self::CheckpointRestored { task_id, .. }
            | Self::Queued { task_id, .. }
            | Self::Dequeued { task_id } => Some(task_id),
            Self::PluginError { .. } | Self::QueueFull { .. } => None,
        }
    }

    /// Extract node_id if the event is node-scoped
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::ContextAssembled { node_id, .. }
            | Self::ContextDegraded { node_id, .. }
            | Self::RoutingBranch { node_id, .. }
            | Self::RoutingSplit { node_id, .. }
            | Self::RoutingMerge { node_id, .. }
            | Self::ToolInvoked { node_id, .. }
            | Self::ToolCompleted { node_id, .. }
            | Self::ToolFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A read-only event observer.
///
/// Returning `Err` (or panicking) produces a `plugin_error` event; it never
/// influences execution.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
    fn on_event(&self, event: &Event) -> std::result::Result<(), String>;
}

/// Ordered event stream: append-only buffer under a single writer, with
/// synchronous fan-out to plugins in registration order.
#[derive(Clone)]
pub struct TelemetryBus {
    events: Arc<RwLock<Vec<Event>>>,
    plugins: Arc<RwLock<Vec<Arc<dyn Plugin>>>>,
    next_id: Arc<AtomicU64>,
    dispatching: Arc<AtomicBool>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            plugins: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            dispatching: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit an event: append to the buffer, then fan out copies to every
    /// plugin in registration order. Returns the event ID.
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp: Utc::now(),
            kind,
        };

        self.events.write().push(event.clone());

        // Snapshot the registry so dispatch never holds the lock
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.read().clone();
        if plugins.is_empty() {
            return id;
        }

        let is_plugin_error = matches!(event.kind, EventKind::PluginError { .. });
        self.dispatching.store(true, Ordering::SeqCst);
        let mut failures: Vec<(String, String)> = Vec::new();
        for plugin in &plugins {
            let copy = event.clone();
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| plugin.on_event(&copy)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(message)) => failures.push((plugin.id().to_string(), message)),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "plugin panicked".to_string());
                    failures.push((plugin.id().to_string(), message));
                }
            }
        }
        self.dispatching.store(false, Ordering::SeqCst);

        // A failure while handling a plugin_error event is logged only;
        // re-emitting would loop.
        if !is_plugin_error {
            for (plugin_id, error) in failures {
                tracing::warn!(plugin_id = %plugin_id, error = %error, "plugin failed");
                self.emit(EventKind::PluginError { plugin_id, error });
            }
        }

        id
    }

    /// Register a plugin. Refused during dispatch.
    pub fn subscribe(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.dispatching.load(Ordering::SeqCst) {
            return Err(ArborError::SubscribeDuringDispatch);
        }
        self.plugins.write().push(plugin);
        Ok(())
    }

    /// Remove a plugin by id. Refused during dispatch.
    pub fn unsubscribe(&self, plugin_id: &str) -> Result<()> {
        if self.dispatching.load(Ordering::SeqCst) {
            return Err(ArborError::SubscribeDuringDispatch);
        }
        let mut plugins = self.plugins.write();
        let before = plugins.len();
        plugins.retain(|p| p.id() != plugin_id);
        if plugins.len() == before {
            return Err(ArborError::PluginUnknown {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(())
    }

    /// All events so far (cloned; use `with_events` for zero-copy reads)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Zero-copy access via callback; keep it short, it holds the read lock
    pub fn with_events<T>(&self, f: impl FnOnce(&[Event]) -> T) -> T {
        f(&self.events.read())
    }

    /// Events attributed to one task
    pub fn filter_task(&self, task_id: &str) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.task_id() == Some(task_id))
                .cloned()
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("events", &self.len())
            .field("plugins", &self.plugins.read().len())
            .finish()
    }
}
