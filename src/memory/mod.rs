//! Memory Module - three scoped, key-addressable stores
//!
//! Tiers:
//! - **Task**: ephemeral, one namespace per task, cleared when the owning
//!   task completes
//! - **Project**: persistent within a project, count-bounded with
//!   lowest-importance-oldest eviction
//! - **Global**: persistent across projects; writes of configured kinds may
//!   require an external confirmation hook (policy, not store logic)
//!
//! Items are added explicitly and never auto-promoted between tiers.

mod file;
mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ArborError, Result};
use crate::manifest::{MemoryBackend, MemorySpec};
use crate::util::constants::PROJECT_STORE_MAX_ITEMS;

pub use file::AppendFileStore;
pub use store::{Filter, FilterField, FilterOp, InMemoryStore, MemoryStore, OrderBy, Query};

/// Scope of a memory store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Task,
    Project,
    Global,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Project => "project",
            Self::Global => "global",
        }
    }
}

/// A retrievable fact with retrieval metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub tier: Tier,
    /// Free-form domain tag: code/reasoning/decision/...
    pub kind: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Retrieval priority in [0, 1]
    pub importance: f32,
    /// Declared token cost of the payload
    pub token_cost: u32,
    pub payload: Value,
}

impl ContextItem {
    pub fn new(id: impl Into<String>, tier: Tier, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            tier,
            kind: kind.into(),
            source: String::new(),
            timestamp: Utc::now(),
            tags: Vec::new(),
            importance: 0.5,
            token_cost: 0,
            payload,
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn with_token_cost(mut self, token_cost: u32) -> Self {
        self.token_cost = token_cost;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Confirmation hook applied to global writes of configured kinds
pub type ConfirmHook = Arc<dyn Fn(&ContextItem) -> bool + Send + Sync>;

/// Per-tier snapshots handed to the context assembler. `None` marks a tier
/// whose store was unavailable.
#[derive(Debug, Default, Clone)]
pub struct TierSnapshots {
    pub task: Option<Vec<ContextItem>>,
    pub project: Option<Vec<ContextItem>>,
    pub global: Option<Vec<ContextItem>>,
}

impl TierSnapshots {
    pub fn all_unavailable(&self) -> bool {
        self.task.is_none() && self.project.is_none() && self.global.is_none()
    }
}

/// The engine's view over all three tiers
pub struct MemoryTiers {
    task_stores: DashMap<String, Arc<dyn MemoryStore>>,
    project: Arc<dyn MemoryStore>,
    global: Arc<dyn MemoryStore>,
    confirm_kinds: Vec<String>,
    confirm_hook: RwLock<Option<ConfirmHook>>,
}

impl MemoryTiers {
    /// Build tiers from the manifest memory section (in-memory default)
    pub fn from_spec(spec: Option<&MemorySpec>) -> Result<Self> {
        let (project, global): (Arc<dyn MemoryStore>, Arc<dyn MemoryStore>) = match spec
            .map(|s| &s.backend)
        {
            None | Some(MemoryBackend::InMemory) => {
                let max = spec
                    .and_then(|s| s.project_max_items)
                    .unwrap_or(PROJECT_STORE_MAX_ITEMS);
                (
                    Arc::new(InMemoryStore::bounded(max)),
                    Arc::new(InMemoryStore::new()),
                )
            }
            Some(MemoryBackend::AppendFile { path }) => {
                let base = std::path::Path::new(path);
                (
                    Arc::new(AppendFileStore::open(base.join("project.jsonl"))?),
                    Arc::new(AppendFileStore::open(base.join("global.jsonl"))?),
                )
            }
        };

        Ok(Self {
            task_stores: DashMap::new(),
            project,
            global,
            confirm_kinds: spec.map(|s| s.confirm_kinds.clone()).unwrap_or_default(),
            confirm_hook: RwLock::new(None),
        })
    }

    /// Register the confirmation hook for guarded global writes
    pub fn set_confirm_hook(&self, hook: ConfirmHook) {
        *self.confirm_hook.write() = Some(hook);
    }

    /// Create the ephemeral store for a task namespace
    pub fn provision_task(&self, task_ref: &str) -> Arc<dyn MemoryStore> {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        self.task_stores.insert(task_ref.to_string(), Arc::clone(&store));
        store
    }

    pub fn task_store(&self, task_ref: &str) -> Option<Arc<dyn MemoryStore>> {
        self.task_stores.get(task_ref).map(|s| Arc::clone(s.value()))
    }

    /// Drop a task namespace; called when the owning task completes
    pub fn clear_task(&self, task_ref: &str) {
        if let Some((_, store)) = self.task_stores.remove(task_ref) {
            let _ = store.clear();
        }
    }

    pub fn project(&self) -> &Arc<dyn MemoryStore> {
        &self.project
    }

    pub fn global(&self) -> &Arc<dyn MemoryStore> {
        &self.global
    }

    /// Add to a task namespace
    pub fn add_task(&self, task_ref: &str, item: ContextItem) -> Result<()> {
        let store = self
            .task_store(task_ref)
            .ok_or_else(|| ArborError::StoreUnavailable {
                tier: Tier::Task.as_str().to_string(),
                reason: format!("no task namespace '{task_ref}'"),
            })?;
        store.add(item)
    }

    pub fn add_project(&self, item: ContextItem) -> Result<()> {
        self.project.add(item)
    }

    /// Add to the global tier; kinds listed in the manifest's
    /// `confirm_kinds` must pass the confirmation hook first.
    pub fn add_global(&self, item: ContextItem) -> Result<()> {
        if self.confirm_kinds.iter().any(|k| *k == item.kind) {
            let confirmed = self
                .confirm_hook
                .read()
                .as_ref()
                .map(|hook| hook(&item))
                .unwrap_or(false);
            if !confirmed {
                return Err(ArborError::ConfirmationRefused { item_id: item.id });
            }
        }
        self.global.add(item)
    }

    /// Snapshot every tier for assembly. Unavailable tiers become `None`
    /// and are reported so the caller can emit `context_degraded`.
    pub fn snapshot(&self, task_ref: &str) -> (TierSnapshots, Vec<Tier>) {
        let mut degraded = Vec::new();

        let task = match self.task_store(task_ref) {
            Some(store) => match store.list_all() {
                Ok(items) => Some(items),
                Err(_) => {
                    degraded.push(Tier::Task);
                    None
                }
            },
            None => {
                degraded.push(Tier::Task);
                None
            }
        };

        let project = match self.project.list_all() {
            Ok(items) => Some(items),
            Err(_) => {
                degraded.push(Tier::Project);
                None
            }
        };

        let global = match self.global.list_all() {
            Ok(items) => Some(items),
            Err(_) => {
                degraded.push(Tier::Global);
                None
            }
        };

        (TierSnapshots { task, project, global }, degraded)
    }
}

impl std::fmt::Debug for MemoryTiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTiers")
            .field("task_namespaces", &self.task_stores.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiers() -> MemoryTiers {
        MemoryTiers::from_spec(None).unwrap()
    }

    #[test]
    fn task_namespaces_are_isolated() {
        let tiers = tiers();
        tiers.provision_task("task-a");
        tiers.provision_task("task-b");

        tiers
            .add_task("task-a", ContextItem::new("i1", Tier::Task, "code", json!("a")))
            .unwrap();

        assert_eq!(tiers.task_store("task-a").unwrap().count().unwrap(), 1);
        assert_eq!(tiers.task_store("task-b").unwrap().count().unwrap(), 0);
    }

    #[test]
    fn clear_task_drops_namespace() {
        let tiers = tiers();
        tiers.provision_task("task-a");
        tiers
            .add_task("task-a", ContextItem::new("i1", Tier::Task, "code", json!("a")))
            .unwrap();

        tiers.clear_task("task-a");
        assert!(tiers.task_store("task-a").is_none());
    }

    #[test]
    fn add_to_unknown_namespace_is_store_unavailable() {
        let tiers = tiers();
        let err = tiers
            .add_task("ghost", ContextItem::new("i1", Tier::Task, "code", json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-050");
    }

    #[test]
    fn guarded_global_write_requires_hook() {
        let spec = MemorySpec {
            backend: MemoryBackend::InMemory,
            project_max_items: None,
            confirm_kinds: vec!["credential".to_string()],
        };
        let tiers = MemoryTiers::from_spec(Some(&spec)).unwrap();

        // No hook registered: guarded write refused
        let err = tiers
            .add_global(ContextItem::new("c1", Tier::Global, "credential", json!({})))
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-052");

        // Unguarded kinds pass without a hook
        tiers
            .add_global(ContextItem::new("n1", Tier::Global, "note", json!({})))
            .unwrap();

        // Hook approves
        tiers.set_confirm_hook(Arc::new(|_| true));
        tiers
            .add_global(ContextItem::new("c2", Tier::Global, "credential", json!({})))
            .unwrap();
        assert_eq!(tiers.global().count().unwrap(), 2);
    }

    #[test]
    fn snapshot_reports_missing_task_tier_as_degraded() {
        let tiers = tiers();
        let (snap, degraded) = tiers.snapshot("never-provisioned");
        assert!(snap.task.is_none());
        assert!(snap.project.is_some());
        assert!(snap.global.is_some());
        assert_eq!(degraded, vec![Tier::Task]);
    }
}
