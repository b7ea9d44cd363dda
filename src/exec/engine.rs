//! Engine Driver - the top-level loop
//!
//! Owns every moving part: the validated graph, the task manager, memory
//! tiers, overrides, telemetry, and the node executor. Root tasks drain
//! sequentially from a FIFO queue; intra-task fan-out (branch/split
//! children) is cooperatively scheduled on the same loop, children enqueued
//! in manifest edge order. Join barriers keyed on the parent release when
//! the merge policy is satisfied.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::adapter::{LlmAdapter, ToolAdapter};
use crate::context::ContextPackage;
use crate::dag::{self, Dag, Node};
use crate::error::{ArborError, ErrorKind, Result};
use crate::event::{Event, EventKind, Plugin, TelemetryBus};
use crate::manifest::{BuiltinMergePolicy, Manifest, MergePolicy, Role};
use crate::memory::{ConfirmHook, ContextItem, MemoryTiers};
use crate::overrides::{OverrideLayer, OverrideParams, OverrideScope, TargetKind};
use crate::task::{
    ExecStatus, NodeExecutionRecord, RoutingEntry, Task, TaskManager, TaskSpec, TaskStatus,
};
use crate::task::Lifecycle;
use crate::util::constants::{MAX_QUEUE_SIZE, MERGE_TIMEOUT, NODE_TIMEOUT};

use super::executor::{NodeConfig, NodeExecutor, OpFn, ReducerFn};
use super::router::{FanMode, RouteDecision, Router};

/// Engine limits resolved from the manifest scheduler section
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_queue_size: usize,
    pub default_node_timeout: Duration,
    pub merge_timeout: Duration,
}

impl EngineConfig {
    fn from_manifest(manifest: &Manifest) -> Self {
        let scheduler = manifest.scheduler.as_ref();
        Self {
            max_queue_size: scheduler
                .and_then(|s| s.max_queue_size)
                .unwrap_or(MAX_QUEUE_SIZE),
            default_node_timeout: scheduler
                .and_then(|s| s.default_timeout_seconds)
                .map(Duration::from_secs)
                .unwrap_or(NODE_TIMEOUT),
            merge_timeout: scheduler
                .and_then(|s| s.merge_timeout_seconds)
                .map(Duration::from_secs)
                .unwrap_or(MERGE_TIMEOUT),
        }
    }
}

/// What `run` hands back for a terminal task
#[derive(Debug, Clone)]
pub struct RunResult {
    pub task_id: Arc<str>,
    pub status: TaskStatus,
    pub output: Value,
    pub history: Vec<NodeExecutionRecord>,
    /// The last-emitted error, if any
    pub error: Option<String>,
}

/// Read-only view for `inspect`
#[derive(Debug, Clone)]
pub struct Inspection {
    pub task: Task,
    pub history: Vec<NodeExecutionRecord>,
    pub events: Vec<Event>,
    /// Task-tier memory items still held for the task (empty once cleared)
    pub artifacts: Vec<ContextItem>,
}

/// One child's seat at its parent's join barrier
#[derive(Debug, Clone, Default)]
struct JoinSlot {
    arrived: bool,
    success: bool,
    output: Value,
}

/// Join barrier for one fan-out, keyed by parent task id
#[derive(Debug)]
struct Join {
    mode: FanMode,
    merge_node: Option<Arc<str>>,
    slots: Vec<JoinSlot>,
    released: bool,
    deadline: Instant,
}

/// The orchestration engine. One instance per manifest; rebuilt on change.
pub struct Engine {
    manifest: Arc<Manifest>,
    manifest_hash: String,
    dag: Arc<Dag>,
    tasks: TaskManager,
    bus: TelemetryBus,
    memory: Arc<MemoryTiers>,
    overrides: Arc<OverrideLayer>,
    executor: NodeExecutor,
    router: Router,
    queue: Mutex<VecDeque<Arc<str>>>,
    joins: DashMap<Arc<str>, Join>,
    child_slots: DashMap<Arc<str>, (Arc<str>, usize)>,
    cancels: DashMap<Arc<str>, CancellationToken>,
    config: EngineConfig,
}

impl Engine {
    /// Validate the manifest and build a ready engine.
    ///
    /// Fatal manifest errors surface here, never later.
    pub fn load(manifest: Manifest) -> Result<Self> {
        manifest.validate_schema_version()?;

        let dag = dag::build(&manifest)
            .map_err(|violations| ArborError::ManifestInvalid { violations })?;
        let dag = Arc::new(dag);

        let schemas = Arc::new(crate::manifest::SchemaRegistry::compile(&manifest.schemas)?);
        let manifest = Arc::new(manifest);
        let manifest_hash = manifest.compute_hash();

        let memory = Arc::new(MemoryTiers::from_spec(manifest.memory.as_ref())?);
        let overrides = Arc::new(OverrideLayer::new(Arc::clone(&manifest)));
        let bus = TelemetryBus::new();
        let config = EngineConfig::from_manifest(&manifest);

        let executor = NodeExecutor::new(
            Arc::clone(&manifest),
            schemas,
            Arc::clone(&overrides),
            Arc::clone(&memory),
            bus.clone(),
            Some(config.default_node_timeout),
        );

        info!(hash = %manifest_hash, nodes = dag.nodes().len(), "engine loaded");

        Ok(Self {
            router: Router::new(Arc::clone(&dag)),
            manifest,
            tasks: TaskManager::new(manifest_hash.clone()),
            manifest_hash,
            dag,
            bus,
            memory,
            overrides,
            executor,
            queue: Mutex::new(VecDeque::new()),
            joins: DashMap::new(),
            child_slots: DashMap::new(),
            cancels: DashMap::new(),
            config,
        })
    }

    // ═══════════════════════════════════════════
    // Bindings for external collaborators
    // ═══════════════════════════════════════════

    /// Bind a deterministic operation by id
    pub fn bind_op<F>(&self, id: impl Into<String>, op: F)
    where
        F: Fn(&Value, &ContextPackage, &NodeConfig) -> anyhow::Result<Value>
            + Send
            + Sync
            + 'static,
    {
        let op: OpFn = Arc::new(op);
        self.executor.bind_op(id, op);
    }

    /// Bind a named merge reducer
    pub fn bind_reducer<F>(&self, id: impl Into<String>, reducer: F)
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let reducer: ReducerFn = Arc::new(reducer);
        self.executor.bind_reducer(id, reducer);
    }

    /// Bind a tool implementation for a manifest-declared tool id
    pub fn bind_tool(&self, id: impl Into<String>, adapter: Arc<dyn ToolAdapter>) {
        self.executor.tools().bind(id, adapter);
    }

    /// Bind the LLM adapter all agent nodes go through
    pub fn bind_llm(&self, adapter: Arc<dyn LlmAdapter>) {
        self.executor.bind_llm(adapter);
    }

    /// Register the confirmation hook for guarded global memory writes
    pub fn set_confirm_hook(&self, hook: ConfirmHook) {
        self.memory.set_confirm_hook(hook);
    }

    // ═══════════════════════════════════════════
    // Telemetry & overrides
    // ═══════════════════════════════════════════

    pub fn subscribe(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.bus.subscribe(plugin)
    }

    pub fn unsubscribe(&self, plugin_id: &str) -> Result<()> {
        self.bus.unsubscribe(plugin_id)
    }

    pub fn events(&self) -> Vec<Event> {
        self.bus.events()
    }

    pub fn set_override(
        &self,
        scope: OverrideScope,
        kind: TargetKind,
        target_id: &str,
        params: OverrideParams,
    ) -> Result<()> {
        self.overrides.set(scope, kind, target_id, params)
    }

    pub fn clear_overrides(&self, scope: OverrideScope, target: Option<(TargetKind, &str)>) {
        self.overrides.clear(scope, target)
    }

    /// The engine's shared memory tiers (task stores, project, global)
    pub fn memory(&self) -> &Arc<MemoryTiers> {
        &self.memory
    }

    pub fn manifest_hash(&self) -> &str {
        &self.manifest_hash
    }

    /// The validated graph this engine executes
    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    /// The manifest this engine was built from
    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    // ═══════════════════════════════════════════
    // Queue & run
    // ═══════════════════════════════════════════

    /// Create a task for `input` and queue it. Overflow yields `queue_full`.
    pub fn enqueue(&self, spec: impl Into<TaskSpec>) -> Result<Arc<str>> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queue_size {
            self.bus.emit(EventKind::QueueFull {
                capacity: self.config.max_queue_size,
            });
            return Err(ArborError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let task = self
            .tasks
            .create(spec.into(), Arc::clone(self.dag.default_start()));
        self.memory.provision_task(&task.memory.task_ref);
        self.cancels
            .insert(Arc::clone(&task.id), CancellationToken::new());

        queue.push_back(Arc::clone(&task.id));
        self.bus.emit(EventKind::Queued {
            task_id: Arc::clone(&task.id),
            depth: queue.len(),
        });
        Ok(task.id)
    }

    /// Run one input to a terminal status and return its result
    pub async fn run(&self, spec: impl Into<TaskSpec>) -> Result<RunResult> {
        let task_id = self.enqueue(spec)?;
        let results = self.drain().await?;
        results
            .into_iter()
            .find(|r| r.task_id == task_id)
            .ok_or_else(|| ArborError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Drain the queue FIFO; root tasks run strictly sequentially
    pub async fn drain(&self) -> Result<Vec<RunResult>> {
        let mut results = Vec::new();
        loop {
            let Some(task_id) = self.queue.lock().pop_front() else {
                break;
            };
            self.bus.emit(EventKind::Dequeued {
                task_id: Arc::clone(&task_id),
            });
            results.push(self.run_task(task_id).await?);
        }
        Ok(results)
    }

    /// Cooperative cancellation: propagates to all in-flight descendants
    pub fn cancel(&self, task_id: &str) {
        if let Some(token) = self.cancels.get(task_id) {
            token.cancel();
        }
    }

    /// Read-only view of a task, its events, and remaining artifacts
    pub fn inspect(&self, task_id: &str) -> Result<Inspection> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| ArborError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let artifacts = self
            .memory
            .task_store(&task.memory.task_ref)
            .and_then(|store| store.list_all().ok())
            .unwrap_or_default();
        Ok(Inspection {
            history: task.history.clone(),
            events: self.bus.filter_task(task_id),
            artifacts,
            task,
        })
    }

    /// Serialize a task for crash recovery
    pub fn checkpoint(&self, task_id: &str) -> Result<Vec<u8>> {
        let bytes = self.tasks.checkpoint(task_id)?;
        self.bus.emit(EventKind::CheckpointSaved {
            task_id: crate::util::intern(task_id),
            manifest_hash: self.manifest_hash.clone(),
            bytes: bytes.len(),
        });
        Ok(bytes)
    }

    /// Restore a checkpointed task. Registers state only; execution does
    /// not resume automatically.
    pub fn restore(&self, bytes: &[u8]) -> Result<Arc<str>> {
        let task = self.tasks.restore(bytes)?;
        if self.memory.task_store(&task.memory.task_ref).is_none() {
            self.memory.provision_task(&task.memory.task_ref);
        }
        self.cancels
            .entry(Arc::clone(&task.id))
            .or_insert_with(CancellationToken::new);
        self.bus.emit(EventKind::CheckpointRestored {
            task_id: Arc::clone(&task.id),
            manifest_hash: self.manifest_hash.clone(),
        });
        Ok(task.id)
    }

    // ═══════════════════════════════════════════
    // The loop
    // ═══════════════════════════════════════════

    /// Drive one root task (and every descendant it spawns) to a terminal
    /// status.
    #[instrument(skip(self), fields(root = %root_id))]
    async fn run_task(&self, root_id: Arc<str>) -> Result<RunResult> {
        let mut ready: VecDeque<Arc<str>> = VecDeque::new();
        ready.push_back(Arc::clone(&root_id));

        while let Some(task_id) = ready.pop_front() {
            let Some(task) = self.tasks.get(&task_id) else {
                warn!(task_id = %task_id, "ready task vanished");
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }

            let token = self.token_for(&task_id);
            if token.is_cancelled() {
                self.finalize(&task_id, TaskStatus::Cancelled, None);
                self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                continue;
            }

            if task.status == TaskStatus::Pending {
                self.tasks.set_status(&task_id, TaskStatus::Running)?;
                self.tasks.set_lifecycle(&task_id, Lifecycle::Active)?;
                self.bus.emit(EventKind::TaskStarted {
                    task_id: Arc::clone(&task_id),
                    input: task.spec.input.clone(),
                });
            }

            let Some(node) = self.dag.node(&task.current_node).cloned() else {
                self.finalize(
                    &task_id,
                    TaskStatus::Failed,
                    Some((
                        ErrorKind::Routing,
                        format!("node '{}' missing from graph", task.current_node),
                    )),
                );
                self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                continue;
            };

            // A child reaching a merge node parks its output at the
            // parent's barrier and completes; the parent resumes when the
            // policy is satisfied. Tasks without a seat (single-flow
            // through a decision diamond) pass through the merge as a
            // normal node below.
            if node.role == Role::Merge && self.child_slots.contains_key(&task_id) {
                let output = task.current_output.clone();
                self.finalize(&task_id, TaskStatus::Succeeded, None);
                self.register_arrival(
                    &task_id,
                    true,
                    output,
                    Some(Arc::clone(&node.id)),
                    &mut ready,
                );
                continue;
            }

            // Execute the node
            let task = self.tasks.get(&task_id).expect("task present");
            let record = match self.executor.execute(&task, &node, &token).await {
                Ok(record) => record,
                Err(ArborError::Cancelled { .. }) => {
                    self.finalize(&task_id, TaskStatus::Cancelled, None);
                    self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                    continue;
                }
                Err(error) => {
                    let kind = error.kind().unwrap_or(ErrorKind::Validation);
                    self.finalize(&task_id, TaskStatus::Failed, Some((kind, error.to_string())));
                    self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                    continue;
                }
            };

            let failed = record.status == ExecStatus::Failed;
            let record_error = record.error.clone();
            self.tasks.record_execution(&task_id, record)?;

            let effective_output = if failed {
                if !node.continue_on_failure {
                    let info = record_error.map(|e| (e.kind, e.message));
                    self.finalize(&task_id, TaskStatus::Failed, info);
                    self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                    continue;
                }
                // Tolerated failure: advance as if succeeded with empty output
                self.tasks.set_current_output(&task_id, Value::Null)?;
                Value::Null
            } else {
                self.tasks
                    .get(&task_id)
                    .map(|t| t.current_output)
                    .unwrap_or(Value::Null)
            };

            // Route
            match self.router.route(&node, &effective_output) {
                Err(error) => {
                    let kind = error.kind().unwrap_or(ErrorKind::Routing);
                    self.finalize(&task_id, TaskStatus::Failed, Some((kind, error.to_string())));
                    self.register_arrival(&task_id, false, Value::Null, None, &mut ready);
                }
                Ok(RouteDecision::Advance {
                    edge_index,
                    decision_key,
                }) => {
                    if node.role == Role::Merge {
                        // Pass-through merge: one arrival, no barrier
                        self.bus.emit(EventKind::RoutingMerge {
                            task_id: Arc::clone(&task_id),
                            node_id: Arc::clone(&node.id),
                            policy: policy_name(&merge_policy_of(&node, FanMode::Branch)),
                            arrivals: 1,
                        });
                    }
                    self.advance(&task_id, edge_index, decision_key)?;
                    ready.push_back(task_id);
                }
                Ok(RouteDecision::Finish) => {
                    let task = self.tasks.get(&task_id).expect("task present");
                    let status = if task.has_fatal_error() {
                        TaskStatus::Failed
                    } else {
                        TaskStatus::Succeeded
                    };
                    let info = (status == TaskStatus::Failed)
                        .then(|| {
                            task.last_error()
                                .map(|e| (e.kind, e.message.clone()))
                                .unwrap_or((ErrorKind::Security, "fatal error in history".into()))
                        });
                    self.finalize(&task_id, status, info);
                    self.register_arrival(
                        &task_id,
                        status == TaskStatus::Succeeded,
                        effective_output,
                        None,
                        &mut ready,
                    );
                }
                Ok(RouteDecision::FanOut { mode }) => {
                    self.fan_out(&task_id, &node, mode, &effective_output, &mut ready)?;
                }
            }
        }

        let root = self
            .tasks
            .get(&root_id)
            .ok_or_else(|| ArborError::TaskNotFound {
                task_id: root_id.to_string(),
            })?;
        // Routing-class failures never land in history; the task_failed
        // event still carries them.
        let error = root
            .history
            .iter()
            .rev()
            .find_map(|r| r.error.as_ref())
            .map(|e| e.message.clone())
            .or_else(|| {
                (root.status == TaskStatus::Failed)
                    .then(|| {
                        self.bus
                            .filter_task(&root_id)
                            .into_iter()
                            .rev()
                            .find_map(|e| match e.kind {
                                EventKind::TaskFailed { error, .. } => Some(error),
                                _ => None,
                            })
                    })
                    .flatten()
            });

        Ok(RunResult {
            task_id: root.id,
            status: root.status,
            output: root.current_output,
            error,
            history: root.history,
        })
    }

    /// Record a routing decision and move the task along the edge
    fn advance(
        &self,
        task_id: &Arc<str>,
        edge_index: usize,
        decision_key: Option<String>,
    ) -> Result<()> {
        let edge = self
            .dag
            .edge(edge_index)
            .expect("routed edge exists")
            .clone();
        self.tasks.record_routing(
            task_id,
            RoutingEntry {
                from_node: Arc::clone(&edge.from),
                to_node: Arc::clone(&edge.to),
                edge_index,
                edge_label: edge.label.clone(),
                decision_key: decision_key.clone(),
                timestamp: Utc::now(),
            },
        )?;
        self.bus.emit(EventKind::RoutingDecision {
            task_id: Arc::clone(task_id),
            from_node: Arc::clone(&edge.from),
            to_node: Arc::clone(&edge.to),
            edge_label: edge.label.clone(),
            decision_key,
        });
        self.tasks.set_current_node(task_id, Arc::clone(&edge.to))
    }

    /// Spawn one child per outbound edge; the parent suspends at the node
    fn fan_out(
        &self,
        parent_id: &Arc<str>,
        node: &Node,
        mode: FanMode,
        output: &Value,
        ready: &mut VecDeque<Arc<str>>,
    ) -> Result<()> {
        let edges: Vec<crate::dag::Edge> =
            self.dag.outbound_edges(&node.id).cloned().collect();
        let split_inputs = match mode {
            FanMode::Split => self.router.split_inputs(node, output),
            FanMode::Branch => Vec::new(),
        };

        let parent_token = self.token_for(parent_id);
        let mut child_ids = Vec::with_capacity(edges.len());

        for (i, edge) in edges.iter().enumerate() {
            let child = match mode {
                FanMode::Branch => self
                    .tasks
                    .create_clone(parent_id, edge.label.clone())?,
                FanMode::Split => self
                    .tasks
                    .create_subtask(parent_id, split_inputs[i].clone())?,
            };
            self.tasks
                .set_current_node(&child.id, Arc::clone(&edge.to))?;
            self.memory.provision_task(&child.memory.task_ref);
            self.cancels
                .insert(Arc::clone(&child.id), parent_token.clone());
            self.child_slots
                .insert(Arc::clone(&child.id), (Arc::clone(parent_id), i));

            self.tasks.record_routing(
                parent_id,
                RoutingEntry {
                    from_node: Arc::clone(&node.id),
                    to_node: Arc::clone(&edge.to),
                    edge_index: edge.index,
                    edge_label: edge.label.clone(),
                    decision_key: None,
                    timestamp: Utc::now(),
                },
            )?;

            match mode {
                FanMode::Branch => {
                    self.bus.emit(EventKind::CloneCreated {
                        task_id: Arc::clone(&child.id),
                        parent_task_id: Arc::clone(parent_id),
                        branch_label: edge.label.clone(),
                    });
                }
                FanMode::Split => {
                    self.bus.emit(EventKind::SubtaskCreated {
                        task_id: Arc::clone(&child.id),
                        parent_task_id: Arc::clone(parent_id),
                    });
                }
            }
            child_ids.push(child.id);
        }

        match mode {
            FanMode::Branch => self.bus.emit(EventKind::RoutingBranch {
                task_id: Arc::clone(parent_id),
                node_id: Arc::clone(&node.id),
                clones: child_ids.clone(),
            }),
            FanMode::Split => self.bus.emit(EventKind::RoutingSplit {
                task_id: Arc::clone(parent_id),
                node_id: Arc::clone(&node.id),
                subtasks: child_ids.clone(),
            }),
        };

        self.joins.insert(
            Arc::clone(parent_id),
            Join {
                mode,
                merge_node: None,
                slots: vec![JoinSlot::default(); child_ids.len()],
                released: false,
                deadline: Instant::now() + self.config.merge_timeout,
            },
        );

        // Spawn order = manifest edge order
        for child_id in child_ids {
            ready.push_back(child_id);
        }
        Ok(())
    }

    /// A child reached a merge node or a terminal status; seat it at the
    /// parent's barrier and release the parent if the policy is satisfied.
    fn register_arrival(
        &self,
        child_id: &Arc<str>,
        success: bool,
        output: Value,
        merge_node: Option<Arc<str>>,
        ready: &mut VecDeque<Arc<str>>,
    ) {
        let Some((_, (parent_id, slot_idx))) = self.child_slots.remove(child_id) else {
            return;
        };

        let release = {
            let Some(mut join) = self.joins.get_mut(&parent_id) else {
                return;
            };
            if join.merge_node.is_none() {
                join.merge_node = merge_node;
            }
            join.slots[slot_idx] = JoinSlot {
                arrived: true,
                success,
                output,
            };
            if join.released {
                return;
            }

            if Instant::now() > join.deadline {
                join.released = true;
                Some(Err(ArborError::MergeBarrierTimeout {
                    node_id: join
                        .merge_node
                        .as_deref()
                        .unwrap_or("unknown")
                        .to_string(),
                    timeout_ms: self.config.merge_timeout.as_millis() as u64,
                }))
            } else {
                let policy = join
                    .merge_node
                    .as_deref()
                    .and_then(|m| self.dag.node(m))
                    .map(|n| merge_policy_of(n, join.mode))
                    .unwrap_or_else(|| default_policy(join.mode));
                match evaluate_barrier(&join.slots, join.mode, &policy) {
                    BarrierState::Waiting => None,
                    BarrierState::Released(result) => {
                        join.released = true;
                        Some(result.map(|outputs| (policy, outputs)))
                    }
                }
            }
        };

        let Some(release) = release else { return };
        let join = self.joins.get(&parent_id).expect("join present");
        let merge_node = join.merge_node.clone();
        let arrivals = join.slots.iter().filter(|s| s.arrived).count();
        drop(join);

        match release {
            Err(error) => {
                let kind = error.kind().unwrap_or(ErrorKind::Routing);
                self.finalize(&parent_id, TaskStatus::Failed, Some((kind, error.to_string())));
                self.register_arrival(&parent_id, false, Value::Null, None, ready);
            }
            Ok((policy, outputs)) => {
                let aggregated = match self.aggregate(&policy, &outputs) {
                    Ok(value) => value,
                    Err(error) => {
                        let kind = error.kind().unwrap_or(ErrorKind::Validation);
                        self.finalize(
                            &parent_id,
                            TaskStatus::Failed,
                            Some((kind, error.to_string())),
                        );
                        self.register_arrival(&parent_id, false, Value::Null, None, ready);
                        return;
                    }
                };

                match merge_node {
                    Some(merge_id) => {
                        if let Err(error) =
                            self.resume_at_merge(&parent_id, &merge_id, &policy, arrivals, outputs, aggregated, ready)
                        {
                            let kind = error.kind().unwrap_or(ErrorKind::Routing);
                            self.finalize(
                                &parent_id,
                                TaskStatus::Failed,
                                Some((kind, error.to_string())),
                            );
                            self.register_arrival(&parent_id, false, Value::Null, None, ready);
                        }
                    }
                    None => {
                        // No merge downstream: the parent completes at the
                        // fan-out node with the aggregated output.
                        let _ = self.tasks.set_current_output(&parent_id, aggregated);
                        self.finalize(&parent_id, TaskStatus::Succeeded, None);
                        let output = self
                            .tasks
                            .get(&parent_id)
                            .map(|t| t.current_output)
                            .unwrap_or(Value::Null);
                        self.register_arrival(&parent_id, true, output, None, ready);
                    }
                }
            }
        }
    }

    /// Record the merge step on the parent and advance it past the merge
    #[allow(clippy::too_many_arguments)]
    fn resume_at_merge(
        &self,
        parent_id: &Arc<str>,
        merge_id: &Arc<str>,
        policy: &MergePolicy,
        arrivals: usize,
        arrival_outputs: Vec<Value>,
        aggregated: Value,
        ready: &mut VecDeque<Arc<str>>,
    ) -> Result<()> {
        let merge_node = self
            .dag
            .node(merge_id)
            .cloned()
            .ok_or_else(|| ArborError::MergeUnreachable {
                node_id: merge_id.to_string(),
                expected: arrivals,
                arrived: 0,
            })?;

        self.bus.emit(EventKind::NodeStarted {
            task_id: Arc::clone(parent_id),
            node_id: Arc::clone(merge_id),
        });
        let now = Utc::now();
        self.tasks.record_execution(
            parent_id,
            NodeExecutionRecord {
                node_id: Arc::clone(merge_id),
                input: Value::Array(arrival_outputs),
                output: Some(aggregated.clone()),
                status: ExecStatus::Succeeded,
                error: None,
                started_at: now,
                finished_at: now,
                tool_calls: Vec::new(),
            },
        )?;
        self.bus.emit(EventKind::RoutingMerge {
            task_id: Arc::clone(parent_id),
            node_id: Arc::clone(merge_id),
            policy: policy_name(policy),
            arrivals,
        });
        self.bus.emit(EventKind::NodeCompleted {
            task_id: Arc::clone(parent_id),
            node_id: Arc::clone(merge_id),
            duration_ms: 0,
        });

        // Merge nodes have exactly one outbound edge
        match self.router.route(&merge_node, &aggregated)? {
            RouteDecision::Advance { edge_index, .. } => {
                self.advance(parent_id, edge_index, None)?;
                ready.push_back(Arc::clone(parent_id));
                Ok(())
            }
            _ => Err(ArborError::MergeUnreachable {
                node_id: merge_id.to_string(),
                expected: arrivals,
                arrived: arrivals,
            }),
        }
    }

    /// Apply the merge aggregation policy over ordered successful outputs
    fn aggregate(&self, policy: &MergePolicy, outputs: &[Value]) -> Result<Value> {
        match policy {
            MergePolicy::Builtin(BuiltinMergePolicy::CollectAll) => {
                Ok(Value::Array(outputs.to_vec()))
            }
            MergePolicy::Builtin(BuiltinMergePolicy::FirstSuccess) => {
                Ok(outputs.first().cloned().unwrap_or(Value::Null))
            }
            MergePolicy::Reducer { reducer } => {
                let f = self
                    .executor
                    .reducer(reducer)
                    .ok_or_else(|| ArborError::ReducerUnbound {
                        reducer: reducer.clone(),
                    })?;
                f(outputs).map_err(|e| ArborError::ToolFailure {
                    tool: reducer.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Mark a task terminal, emit its event, release its resources
    fn finalize(
        &self,
        task_id: &Arc<str>,
        status: TaskStatus,
        error: Option<(ErrorKind, String)>,
    ) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }

        // Lifecycle first: the terminal guard locks after set_status
        let _ = self.tasks.set_lifecycle(task_id, Lifecycle::Completed);
        let _ = self.tasks.set_status(task_id, status);

        match status {
            TaskStatus::Succeeded => {
                self.bus.emit(EventKind::TaskCompleted {
                    task_id: Arc::clone(task_id),
                    output: task.current_output.clone(),
                });
            }
            TaskStatus::Failed => {
                let (error_kind, message) = error
                    .or_else(|| {
                        task.last_error()
                            .map(|e| (e.kind, e.message.clone()))
                    })
                    .map(|(k, m)| (Some(k), m))
                    .unwrap_or((None, "task failed".to_string()));
                self.bus.emit(EventKind::TaskFailed {
                    task_id: Arc::clone(task_id),
                    error: message,
                    error_kind,
                });
            }
            TaskStatus::Cancelled => {
                self.bus.emit(EventKind::TaskCancelled {
                    task_id: Arc::clone(task_id),
                });
            }
            TaskStatus::Pending | TaskStatus::Running => unreachable!("finalize takes terminal statuses"),
        }

        // Task-tier memory is ephemeral; overrides auto-expire
        self.memory.clear_task(&task.memory.task_ref);
        self.overrides.expire_task(task_id);
    }

    fn token_for(&self, task_id: &Arc<str>) -> CancellationToken {
        self.cancels
            .entry(Arc::clone(task_id))
            .or_insert_with(CancellationToken::new)
            .clone()
    }
}

/// The declared policy of a merge node, or the fan-mode default
fn merge_policy_of(node: &Node, mode: FanMode) -> MergePolicy {
    node.merge
        .as_ref()
        .map(|m| m.policy.clone())
        .unwrap_or_else(|| default_policy(mode))
}

fn default_policy(mode: FanMode) -> MergePolicy {
    match mode {
        FanMode::Branch => MergePolicy::Builtin(BuiltinMergePolicy::FirstSuccess),
        FanMode::Split => MergePolicy::Builtin(BuiltinMergePolicy::CollectAll),
    }
}

fn policy_name(policy: &MergePolicy) -> String {
    match policy {
        MergePolicy::Builtin(BuiltinMergePolicy::CollectAll) => "collect_all".to_string(),
        MergePolicy::Builtin(BuiltinMergePolicy::FirstSuccess) => "first_success".to_string(),
        MergePolicy::Reducer { reducer } => format!("reducer:{reducer}"),
    }
}

enum BarrierState {
    Waiting,
    /// Ok: ordered successful outputs to aggregate; Err: terminal failure
    Released(Result<Vec<Value>>),
}

/// Release rules: a branch barrier opens on the first success (or once all
/// clones failed); a split barrier waits for every subtask and then applies
/// the policy. Slot order is spawn order, which is manifest edge order.
fn evaluate_barrier(slots: &[JoinSlot], mode: FanMode, policy: &MergePolicy) -> BarrierState {
    let all_arrived = slots.iter().all(|s| s.arrived);
    let successes: Vec<Value> = slots
        .iter()
        .filter(|s| s.arrived && s.success)
        .map(|s| s.output.clone())
        .collect();

    match mode {
        FanMode::Branch => {
            let first_success_wins =
                matches!(policy, MergePolicy::Builtin(BuiltinMergePolicy::FirstSuccess));
            if first_success_wins && !successes.is_empty() {
                return BarrierState::Released(Ok(vec![successes[0].clone()]));
            }
            if !all_arrived {
                return BarrierState::Waiting;
            }
            if successes.is_empty() {
                return BarrierState::Released(Err(ArborError::MergeUnreachable {
                    node_id: "branch".to_string(),
                    expected: slots.len(),
                    arrived: 0,
                }));
            }
            BarrierState::Released(Ok(successes))
        }
        FanMode::Split => {
            if !all_arrived {
                return BarrierState::Waiting;
            }
            match policy {
                MergePolicy::Builtin(BuiltinMergePolicy::FirstSuccess) => {
                    if successes.is_empty() {
                        BarrierState::Released(Err(ArborError::MergeUnreachable {
                            node_id: "split".to_string(),
                            expected: slots.len(),
                            arrived: 0,
                        }))
                    } else {
                        BarrierState::Released(Ok(vec![successes[0].clone()]))
                    }
                }
                _ => {
                    // collect_all and reducers need every subtask to succeed
                    if successes.len() < slots.len() {
                        BarrierState::Released(Err(ArborError::MergeUnreachable {
                            node_id: "split".to_string(),
                            expected: slots.len(),
                            arrived: successes.len(),
                        }))
                    } else {
                        BarrierState::Released(Ok(successes))
                    }
                }
            }
        }
    }
}
