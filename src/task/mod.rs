//! Task Module - the unit of workflow execution
//!
//! Key types:
//! - `Task`: One execution of the workflow, with full state and history
//! - `TaskSpec`: The immutable input/mode/metadata a task was created from
//! - `NodeExecutionRecord` / `ToolCallRecord`: Per-node audit records
//! - `RoutingEntry`: One routing decision in the task's trace
//!
//! Tasks are mutated only by the engine that owns them and become immutable
//! once they reach a terminal status.

mod manager;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

pub use manager::{TaskManager, CHECKPOINT_VERSION};

/// Immutable creation parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub input: Value,
    /// Free-form mode tag; also the hint baked into the task id
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl TaskSpec {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            mode: String::new(),
            metadata: FxHashMap::default(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }
}

/// Externally visible status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses freeze the task
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Coarse lifecycle phase, orthogonal to status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    Active,
    Completed,
}

/// How a task came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Root,
    /// Child of a branch node; first-success semantics at merge
    Clone,
    /// Child of a split node; all-success semantics at merge
    Subtask,
}

/// Memory namespaces the task reads from.
///
/// Clones and subtasks own a fresh task ref but inherit the parent's
/// project/global refs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRefs {
    pub task_ref: String,
    pub project_ref: String,
    pub global_ref: String,
}

/// One captured tool invocation inside a node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    pub inputs: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Outcome of a node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Succeeded,
    Failed,
}

/// Error captured on a failed record, tagged with its taxonomy kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-node audit record appended to task history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: Arc<str>,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    pub status: ExecStatus,
    #[serde(default)]
    pub error: Option<RecordedError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
}

/// One routing decision, appended to the task's trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub from_node: Arc<str>,
    pub to_node: Arc<str>,
    /// Manifest declaration index of the selected edge
    pub edge_index: usize,
    #[serde(default)]
    pub edge_label: Option<String>,
    /// The key a decision node matched; absent for structural routes
    #[serde(default)]
    pub decision_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One execution of the workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Arc<str>,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub lifecycle: Lifecycle,
    pub kind: TaskKind,
    pub current_node: Arc<str>,
    pub history: Vec<NodeExecutionRecord>,
    pub routing_trace: Vec<RoutingEntry>,
    pub current_output: Value,
    pub memory: MemoryRefs,
    #[serde(default)]
    pub parent: Option<Arc<str>>,
    /// Edge label the clone was spawned on (branch children only)
    #[serde(default)]
    pub branch_label: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// The last error recorded in history, if any
    pub fn last_error(&self) -> Option<&RecordedError> {
        self.history.iter().rev().find_map(|r| r.error.as_ref())
    }

    /// Whether history carries an error that stays fatal at an exit node.
    ///
    /// Tolerated failures (`continue_on_failure`) are non-fatal; security
    /// refusals remain fatal even on a failure-tolerant path.
    pub fn has_fatal_error(&self) -> bool {
        self.history
            .iter()
            .any(|r| matches!(&r.error, Some(e) if e.kind == ErrorKind::Security))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(TaskStatus::Succeeded).unwrap();
        assert_eq!(json, json!("succeeded"));
    }

    #[test]
    fn fatal_error_detection() {
        let mut task = Task {
            id: "task-run-00000001".into(),
            spec: TaskSpec::new(json!({})),
            status: TaskStatus::Running,
            lifecycle: Lifecycle::Active,
            kind: TaskKind::Root,
            current_node: "work".into(),
            history: Vec::new(),
            routing_trace: Vec::new(),
            current_output: Value::Null,
            memory: MemoryRefs {
                task_ref: "task-run-00000001".to_string(),
                project_ref: "project".to_string(),
                global_ref: "global".to_string(),
            },
            parent: None,
            branch_label: None,
            created_at: Utc::now(),
        };

        let record = |kind| NodeExecutionRecord {
            node_id: "work".into(),
            input: Value::Null,
            output: None,
            status: ExecStatus::Failed,
            error: Some(RecordedError {
                kind,
                message: "boom".to_string(),
            }),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            tool_calls: Vec::new(),
        };

        task.history.push(record(ErrorKind::Tool));
        assert!(!task.has_fatal_error());

        task.history.push(record(ErrorKind::Security));
        assert!(task.has_fatal_error());
    }
}
