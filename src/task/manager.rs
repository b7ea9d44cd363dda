//! TaskManager - creation, state transitions, lineage, checkpoints
//!
//! The manager is the only writer of task state. History is append-only and
//! terminal tasks refuse further mutation. Uses DashMap for lock-free
//! concurrent reads from inspectors.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ArborError, Result};
use crate::util::intern;

use super::{
    Lifecycle, MemoryRefs, NodeExecutionRecord, RoutingEntry, Task, TaskKind, TaskSpec, TaskStatus,
};

/// Checkpoint envelope format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Serialized checkpoint wrapper. The manifest hash pins a checkpoint to the
/// engine configuration it was taken under.
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointEnvelope {
    version: u32,
    manifest_hash: String,
    task: Task,
}

/// Owns every task of one engine instance
pub struct TaskManager {
    tasks: DashMap<Arc<str>, Task>,
    manifest_hash: String,
    project_ref: String,
    global_ref: String,
}

impl TaskManager {
    pub fn new(manifest_hash: String) -> Self {
        Self {
            tasks: DashMap::new(),
            manifest_hash,
            project_ref: "project".to_string(),
            global_ref: "global".to_string(),
        }
    }

    /// Create a fresh root task: status pending, lifecycle created, memory
    /// references provisioned (task namespace = task id).
    pub fn create(&self, spec: TaskSpec, start_node: Arc<str>) -> Task {
        let id = self.fresh_id(&spec.mode);
        let task = Task {
            id: Arc::clone(&id),
            memory: MemoryRefs {
                task_ref: id.to_string(),
                project_ref: self.project_ref.clone(),
                global_ref: self.global_ref.clone(),
            },
            spec,
            status: TaskStatus::Pending,
            lifecycle: Lifecycle::Created,
            kind: TaskKind::Root,
            current_node: start_node,
            history: Vec::new(),
            routing_trace: Vec::new(),
            current_output: Value::Null,
            parent: None,
            branch_label: None,
            created_at: Utc::now(),
        };
        self.tasks.insert(id, task.clone());
        task
    }

    /// Clone a parent for one branch edge: same spec, fresh task memory,
    /// inherited project/global refs.
    pub fn create_clone(&self, parent_id: &str, branch_label: Option<String>) -> Result<Task> {
        self.spawn_child(parent_id, TaskKind::Clone, branch_label, None)
    }

    /// Spawn a subtask for one split edge with its own input slice.
    pub fn create_subtask(&self, parent_id: &str, subtask_input: Value) -> Result<Task> {
        self.spawn_child(parent_id, TaskKind::Subtask, None, Some(subtask_input))
    }

    fn spawn_child(
        &self,
        parent_id: &str,
        kind: TaskKind,
        branch_label: Option<String>,
        input: Option<Value>,
    ) -> Result<Task> {
        let parent = self.get(parent_id).ok_or_else(|| ArborError::TaskNotFound {
            task_id: parent_id.to_string(),
        })?;

        let mut spec = parent.spec.clone();
        // Subtasks start from their slice; clones start from the parent's
        // rolling output.
        let seed_output = match &input {
            Some(slice) => slice.clone(),
            None => parent.current_output.clone(),
        };
        if let Some(input) = input {
            spec.input = input;
        }

        let id = self.fresh_id(&spec.mode);
        let task = Task {
            id: Arc::clone(&id),
            memory: MemoryRefs {
                task_ref: id.to_string(),
                project_ref: parent.memory.project_ref.clone(),
                global_ref: parent.memory.global_ref.clone(),
            },
            spec,
            status: TaskStatus::Pending,
            lifecycle: Lifecycle::Created,
            kind,
            current_node: Arc::clone(&parent.current_node),
            history: Vec::new(),
            routing_trace: Vec::new(),
            current_output: seed_output,
            parent: Some(Arc::clone(&parent.id)),
            branch_label,
            created_at: Utc::now(),
        };
        self.tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Snapshot a task by id
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Append a node execution record; updates `current_output` and
    /// `current_node` from the record.
    pub fn record_execution(&self, task_id: &str, record: NodeExecutionRecord) -> Result<()> {
        self.mutate(task_id, |task| {
            task.current_node = Arc::clone(&record.node_id);
            if let Some(output) = &record.output {
                task.current_output = output.clone();
            }
            task.history.push(record);
        })
    }

    /// Append a routing decision to the trace
    pub fn record_routing(&self, task_id: &str, entry: RoutingEntry) -> Result<()> {
        self.mutate(task_id, |task| task.routing_trace.push(entry))
    }

    /// Move the task to its next node
    pub fn set_current_node(&self, task_id: &str, node: Arc<str>) -> Result<()> {
        self.mutate(task_id, |task| task.current_node = node)
    }

    /// Replace the rolling output (used by merge aggregation and tolerated
    /// failures advancing with empty output)
    pub fn set_current_output(&self, task_id: &str, output: Value) -> Result<()> {
        self.mutate(task_id, |task| task.current_output = output)
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.mutate(task_id, |task| task.status = status)
    }

    pub fn set_lifecycle(&self, task_id: &str, lifecycle: Lifecycle) -> Result<()> {
        self.mutate(task_id, |task| task.lifecycle = lifecycle)
    }

    /// Serialize a task for crash recovery
    pub fn checkpoint(&self, task_id: &str) -> Result<Vec<u8>> {
        let task = self.get(task_id).ok_or_else(|| ArborError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        let envelope = CheckpointEnvelope {
            version: CHECKPOINT_VERSION,
            manifest_hash: self.manifest_hash.clone(),
            task,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Restore a checkpointed task. Restoring registers the task but never
    /// resumes execution.
    pub fn restore(&self, bytes: &[u8]) -> Result<Task> {
        let envelope: CheckpointEnvelope =
            serde_json::from_slice(bytes).map_err(|e| ArborError::CheckpointFormat {
                details: e.to_string(),
            })?;

        if envelope.version != CHECKPOINT_VERSION {
            return Err(ArborError::CheckpointFormat {
                details: format!(
                    "unsupported checkpoint version {} (engine speaks {})",
                    envelope.version, CHECKPOINT_VERSION
                ),
            });
        }
        if envelope.manifest_hash != self.manifest_hash {
            return Err(ArborError::CheckpointMismatch {
                expected: self.manifest_hash.clone(),
                actual: envelope.manifest_hash,
            });
        }

        let task = envelope.task;
        self.tasks.insert(Arc::clone(&task.id), task.clone());
        Ok(task)
    }

    /// Apply a mutation under the terminal-freeze guard
    fn mutate(&self, task_id: &str, f: impl FnOnce(&mut Task)) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| ArborError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        if entry.status.is_terminal() {
            return Err(ArborError::TaskTerminal {
                task_id: task_id.to_string(),
            });
        }
        f(entry.value_mut());
        Ok(())
    }

    /// Generate a unique `task-{hint}-{random}` id
    fn fresh_id(&self, mode: &str) -> Arc<str> {
        let hint: String = mode
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let hint = if hint.is_empty() { "run".to_string() } else { hint };

        loop {
            let id = format!("task-{hint}-{:08x}", rand::random::<u32>());
            if !self.tasks.contains_key(id.as_str()) {
                return intern(&id);
            }
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
