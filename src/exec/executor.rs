//! Node Executor - the six-step lifecycle of a single node invocation
//!
//! 1. Resolve config (override precedence, manifest ceilings)
//! 2. Validate input against `schema_in`
//! 3. Assemble context per the node's context spec
//! 4. Invoke: bound function (deterministic) or LLM + tool dispatch (agent)
//! 5. Validate output against `schema_out` with bounded repair
//! 6. Record and emit, in strict lifecycle order
//!
//! The executor never mutates task state; it hands a finished
//! `NodeExecutionRecord` back to the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::adapter::{Hyperparameters, LlmAdapter, ToolRegistry};
use crate::context::{assemble, ContextPackage, ContextProfile};
use crate::dag::Node;
use crate::error::{ArborError, ErrorKind, Result};
use crate::event::{EventKind, TelemetryBus};
use crate::manifest::{ContextSpec, Manifest, NodeKind, SchemaRegistry};
use crate::memory::MemoryTiers;
use crate::overrides::OverrideLayer;
use crate::task::{
    ExecStatus, NodeExecutionRecord, RecordedError, Task, TaskKind, ToolCallRecord,
};
use crate::util::constants::{NODE_TIMEOUT, TOOL_TIMEOUT};

/// Config a deterministic operation executes under
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: Arc<str>,
    pub timeout: Duration,
}

/// A bound deterministic operation
pub type OpFn = Arc<dyn Fn(&Value, &ContextPackage, &NodeConfig) -> anyhow::Result<Value> + Send + Sync>;

/// A bound merge reducer over ordered arrival outputs
pub type ReducerFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A tool call the agent requested in its response
#[derive(Debug, Clone)]
struct RequestedCall {
    tool: String,
    inputs: Value,
}

/// Executes single nodes against the bound adapters
pub struct NodeExecutor {
    manifest: Arc<Manifest>,
    schemas: Arc<SchemaRegistry>,
    profiles: FxHashMap<String, ContextProfile>,
    ops: DashMap<String, OpFn>,
    reducers: DashMap<String, ReducerFn>,
    llm: RwLock<Option<Arc<dyn LlmAdapter>>>,
    tools: ToolRegistry,
    overrides: Arc<OverrideLayer>,
    memory: Arc<MemoryTiers>,
    bus: TelemetryBus,
    default_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(
        manifest: Arc<Manifest>,
        schemas: Arc<SchemaRegistry>,
        overrides: Arc<OverrideLayer>,
        memory: Arc<MemoryTiers>,
        bus: TelemetryBus,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            profiles: manifest.profiles.clone(),
            manifest,
            schemas,
            ops: DashMap::new(),
            reducers: DashMap::new(),
            llm: RwLock::new(None),
            tools: ToolRegistry::new(),
            overrides,
            memory,
            bus,
            default_timeout: default_timeout.unwrap_or(NODE_TIMEOUT),
        }
    }

    pub fn bind_op(&self, id: impl Into<String>, op: OpFn) {
        self.ops.insert(id.into(), op);
    }

    pub fn bind_reducer(&self, id: impl Into<String>, reducer: ReducerFn) {
        self.reducers.insert(id.into(), reducer);
    }

    pub fn reducer(&self, id: &str) -> Option<ReducerFn> {
        self.reducers.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn bind_llm(&self, adapter: Arc<dyn LlmAdapter>) {
        *self.llm.write() = Some(adapter);
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one node for one task.
    ///
    /// Always yields a record (succeeded or failed with a taxonomy-tagged
    /// error); the only `Err` is cooperative cancellation.
    #[instrument(skip(self, task, node, cancel), fields(task_id = %task.id, node_id = %node.id))]
    pub async fn execute(
        &self,
        task: &Task,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<NodeExecutionRecord> {
        let started_at = Utc::now();
        self.bus.emit(EventKind::NodeStarted {
            task_id: Arc::clone(&task.id),
            node_id: Arc::clone(&node.id),
        });
        debug!("executing node");

        let input = if task.history.is_empty() && task.kind == TaskKind::Root {
            task.spec.input.clone()
        } else {
            task.current_output.clone()
        };

        let fail = |error: ArborError, started_at, tool_calls: Vec<ToolCallRecord>| {
            let kind = error.kind().unwrap_or(ErrorKind::Validation);
            let finished_at = Utc::now();
            let record = NodeExecutionRecord {
                node_id: Arc::clone(&node.id),
                input: input.clone(),
                output: None,
                status: ExecStatus::Failed,
                error: Some(RecordedError {
                    kind,
                    message: error.to_string(),
                }),
                started_at,
                finished_at,
                tool_calls,
            };
            self.bus.emit(EventKind::NodeFailed {
                task_id: Arc::clone(&task.id),
                node_id: Arc::clone(&node.id),
                error: error.to_string(),
                error_kind: Some(kind),
                duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            });
            Ok(record)
        };

        // Step 1: resolve config
        let node_timeout = self
            .overrides
            .resolve_node_timeout(&task.id, &node.id)
            .or(node.timeout_seconds)
            .map(Duration::from_secs);

        // Step 2: validate input
        if let Some(schema_id) = &node.schema_in {
            if let Err(details) = self.schemas.validate(schema_id, &input) {
                return fail(
                    ArborError::InputSchema {
                        node_id: node.id.to_string(),
                        schema_id: schema_id.clone(),
                        details,
                    },
                    started_at,
                    Vec::new(),
                );
            }
        }

        // Step 3: assemble context
        let context = match self.assemble_context(task, node) {
            Ok(package) => package,
            Err(error) => return fail(error, started_at, Vec::new()),
        };

        // Step 4 + 5: invoke and validate output
        let mut tool_calls = Vec::new();
        let outcome = match node.kind {
            NodeKind::Deterministic => {
                self.invoke_deterministic(node, &input, &context, node_timeout)
            }
            NodeKind::Agent => {
                self.invoke_agent(task, node, &input, &context, node_timeout, cancel, &mut tool_calls)
                    .await
            }
        };

        let output = match outcome {
            Ok(output) => output,
            Err(error @ ArborError::Cancelled { .. }) => return Err(error),
            Err(error) => return fail(error, started_at, tool_calls),
        };

        // Step 6: record & emit
        let finished_at = Utc::now();
        let record = NodeExecutionRecord {
            node_id: Arc::clone(&node.id),
            input,
            output: Some(output),
            status: ExecStatus::Succeeded,
            error: None,
            started_at,
            finished_at,
            tool_calls,
        };
        self.bus.emit(EventKind::NodeCompleted {
            task_id: Arc::clone(&task.id),
            node_id: Arc::clone(&node.id),
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
        Ok(record)
    }

    /// Context per the node's spec. Degraded tiers are survivable and
    /// reported; all tiers down fails the node.
    fn assemble_context(&self, task: &Task, node: &Node) -> Result<ContextPackage> {
        let (profile_id, profile) = match &node.context {
            ContextSpec::None => return Ok(ContextPackage::empty(&task.spec.mode)),
            ContextSpec::Global => ("global".to_string(), ContextProfile::default_global()),
            ContextSpec::Profile(id) => {
                let profile =
                    self.profiles
                        .get(id)
                        .cloned()
                        .ok_or_else(|| ArborError::ProfileNotFound {
                            profile_id: id.clone(),
                        })?;
                (id.clone(), profile)
            }
        };

        let (snapshots, degraded) = self.memory.snapshot(&task.memory.task_ref);
        if !degraded.is_empty() {
            self.bus.emit(EventKind::ContextDegraded {
                task_id: Arc::clone(&task.id),
                node_id: Arc::clone(&node.id),
                tiers: degraded.iter().map(|t| t.as_str().to_string()).collect(),
            });
        }
        if snapshots.all_unavailable() {
            return Err(ArborError::ContextUnavailable {
                node_id: node.id.to_string(),
            });
        }

        let package = assemble(&profile_id, &profile, &snapshots, &task.spec.mode);
        self.bus.emit(EventKind::ContextAssembled {
            task_id: Arc::clone(&task.id),
            node_id: Arc::clone(&node.id),
            profile_id,
            total_tokens: package.total_tokens,
            compression_ratio: package.compression_ratio,
            fingerprint: package.fingerprint.hash.clone(),
        });
        Ok(package)
    }

    /// Deterministic nodes call the bound function synchronously; an absent
    /// op id is the structural identity (start/merge/exit pass-through).
    fn invoke_deterministic(
        &self,
        node: &Node,
        input: &Value,
        context: &ContextPackage,
        node_timeout: Option<Duration>,
    ) -> Result<Value> {
        let Some(op_id) = &node.op else {
            return Ok(input.clone());
        };

        let op = self
            .ops
            .get(op_id)
            .map(|op| Arc::clone(op.value()))
            .ok_or_else(|| ArborError::OpUnbound { op: op_id.clone() })?;

        let config = NodeConfig {
            node_id: Arc::clone(&node.id),
            timeout: node_timeout.unwrap_or(self.default_timeout),
        };

        let output = op(input, context, &config).map_err(|e| ArborError::ToolFailure {
            tool: op_id.clone(),
            reason: e.to_string(),
        })?;

        self.validate_output_deterministic(node, output)
    }

    /// Agent nodes: prompt build → generate → parse → tool dispatch →
    /// schema validation with bounded repair.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_agent(
        &self,
        task: &Task,
        node: &Node,
        input: &Value,
        context: &ContextPackage,
        node_timeout: Option<Duration>,
        cancel: &CancellationToken,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> Result<Value> {
        let agent_id = node.agent.as_deref().unwrap_or_default();
        let config = self.overrides.resolve_agent(&task.id, agent_id)?;
        let adapter = self
            .llm
            .read()
            .clone()
            .ok_or_else(|| ArborError::LlmUnbound {
                node_id: node.id.to_string(),
            })?;

        let effective_timeout = node_timeout
            .or(config.timeout_seconds.map(Duration::from_secs))
            .unwrap_or(self.default_timeout);
        let hyper = Hyperparameters {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
        };

        let prompt = build_prompt(config.system_prompt.as_deref(), context, input, node);
        let response = self
            .generate(task, node, &adapter, &config.model, &prompt, &hyper, effective_timeout, cancel)
            .await?;

        let (mut output, requested) = parse_agent_response(&response);

        // Tool dispatch, bounded by the node's allow-list and overrides
        let mut results = Vec::with_capacity(requested.len());
        for call in requested {
            let result = self.dispatch_tool(task, node, &call, tool_calls).await?;
            results.push(result);
        }
        if output.is_null() && !results.is_empty() {
            output = if results.len() == 1 {
                results.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::Array(results)
            };
        }

        // Step 5 with bounded repair: structural fix, then one re-request
        let Some(schema_id) = &node.schema_out else {
            return Ok(output);
        };

        let mut candidate = coerce_json(&output);
        if self.schemas.validate(schema_id, &candidate).is_ok() {
            return Ok(candidate);
        }

        // Tier 1: structural extraction from the raw text
        if let Some(extracted) = extract_json(&response) {
            if self.schemas.validate(schema_id, &extracted).is_ok() {
                return Ok(extracted);
            }
            candidate = extracted;
        }

        // Tier 2: one re-request with the validation error appended
        let details = self
            .schemas
            .validate(schema_id, &candidate)
            .err()
            .unwrap_or_default();
        let repair_prompt = format!(
            "{prompt}\n\n# Repair\nYour previous response failed validation: {details}\n\
             Return only valid JSON matching the declared output schema."
        );
        let retry = self
            .generate(task, node, &adapter, &config.model, &repair_prompt, &hyper, effective_timeout, cancel)
            .await?;
        let (retry_output, _) = parse_agent_response(&retry);
        let repaired = extract_json(&retry).unwrap_or_else(|| coerce_json(&retry_output));
        match self.schemas.validate(schema_id, &repaired) {
            Ok(()) => Ok(repaired),
            Err(details) => Err(ArborError::JsonUnrepairable {
                node_id: node.id.to_string(),
                attempts: crate::util::MAX_REPAIR_ATTEMPTS,
                details,
            }),
        }
    }

    /// One adapter call under timeout and cooperative cancellation
    #[allow(clippy::too_many_arguments)]
    async fn generate(
        &self,
        task: &Task,
        node: &Node,
        adapter: &Arc<dyn LlmAdapter>,
        model: &str,
        prompt: &str,
        hyper: &Hyperparameters,
        effective_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let agent_id = node.agent.clone().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => Err(ArborError::Cancelled {
                task_id: task.id.to_string(),
            }),
            result = timeout(effective_timeout, adapter.generate(model, prompt, hyper)) => {
                match result {
                    Err(_) => Err(ArborError::NodeTimeout {
                        node_id: node.id.to_string(),
                        timeout_ms: effective_timeout.as_millis() as u64,
                    }),
                    Ok(Err(e)) => Err(ArborError::AgentFailure {
                        agent_id,
                        reason: e.to_string(),
                    }),
                    Ok(Ok(text)) => Ok(text),
                }
            }
        }
    }

    /// Validate, permission-check, invoke, and record one requested call
    async fn dispatch_tool(
        &self,
        task: &Task,
        node: &Node,
        call: &RequestedCall,
        tool_calls: &mut Vec<ToolCallRecord>,
    ) -> Result<Value> {
        let call_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let mut record_failure = |error: &ArborError| {
            self.bus.emit(EventKind::ToolFailed {
                task_id: Arc::clone(&task.id),
                node_id: Arc::clone(&node.id),
                call_id: call_id.clone(),
                tool: call.tool.clone(),
                error: error.to_string(),
            });
            tool_calls.push(ToolCallRecord {
                call_id: call_id.clone(),
                tool: call.tool.clone(),
                inputs: call.inputs.clone(),
                output: None,
                error: Some(error.to_string()),
                started_at,
                duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            });
        };

        // Policy gates: allow-list, then effective enabled flag
        if !node.tools.iter().any(|t| t == &call.tool) {
            let error = ArborError::ToolNotAllowed {
                tool: call.tool.clone(),
                node_id: node.id.to_string(),
            };
            record_failure(&error);
            return Err(error);
        }
        if !self.overrides.resolve_tool_enabled(&task.id, &call.tool) {
            let error = ArborError::ToolRefused {
                tool: call.tool.clone(),
                reason: "tool is disabled".to_string(),
            };
            record_failure(&error);
            return Err(error);
        }

        // Declared input schema
        let tool_spec = self.manifest.tools.get(&call.tool);
        if let Some(schema_id) = tool_spec.and_then(|t| t.schema_in.as_ref()) {
            if let Err(details) = self.schemas.validate(schema_id, &call.inputs) {
                let error = ArborError::ToolSchema {
                    tool: call.tool.clone(),
                    schema_id: schema_id.clone(),
                    details,
                };
                record_failure(&error);
                return Err(error);
            }
        }

        let Some(adapter) = self.tools.get(&call.tool) else {
            let error = ArborError::ToolUnbound {
                tool: call.tool.clone(),
            };
            record_failure(&error);
            return Err(error);
        };

        // Capability gate: whatever the implementation needs must be covered
        // by the manifest-declared grant before anything runs. The grant is
        // then handed into the invocation so the tool scopes its own
        // operations (endpoints, commands, paths under root_path).
        let permissions = tool_spec
            .map(|t| t.permissions.clone())
            .unwrap_or_default();
        if let Err(reason) = adapter.requires().check(&permissions) {
            let error = ArborError::ToolRefused {
                tool: call.tool.clone(),
                reason,
            };
            record_failure(&error);
            return Err(error);
        }

        self.bus.emit(EventKind::ToolInvoked {
            task_id: Arc::clone(&task.id),
            node_id: Arc::clone(&node.id),
            call_id: call_id.clone(),
            tool: call.tool.clone(),
        });

        let outcome = timeout(TOOL_TIMEOUT, adapter.invoke(&call.inputs, &permissions)).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        let output = match outcome {
            Err(_) => Err(ArborError::ToolFailure {
                tool: call.tool.clone(),
                reason: format!("timed out after {}s", TOOL_TIMEOUT.as_secs()),
            }),
            Ok(Err(e)) => Err(ArborError::ToolFailure {
                tool: call.tool.clone(),
                reason: e.to_string(),
            }),
            Ok(Ok(output)) => Ok(output),
        };

        match output {
            Ok(output) => {
                // Declared output schema, checked before the result is trusted
                if let Some(schema_id) = tool_spec.and_then(|t| t.schema_out.as_ref()) {
                    if let Err(details) = self.schemas.validate(schema_id, &output) {
                        let error = ArborError::ToolSchema {
                            tool: call.tool.clone(),
                            schema_id: schema_id.clone(),
                            details,
                        };
                        record_failure(&error);
                        return Err(error);
                    }
                }
                self.bus.emit(EventKind::ToolCompleted {
                    task_id: Arc::clone(&task.id),
                    node_id: Arc::clone(&node.id),
                    call_id: call_id.clone(),
                    tool: call.tool.clone(),
                    duration_ms,
                });
                tool_calls.push(ToolCallRecord {
                    call_id,
                    tool: call.tool.clone(),
                    inputs: call.inputs.clone(),
                    output: Some(output.clone()),
                    error: None,
                    started_at,
                    duration_ms,
                });
                Ok(output)
            }
            Err(error) => {
                record_failure(&error);
                Err(error)
            }
        }
    }

    /// Deterministic output check: no repair ladder, plain validation error
    fn validate_output_deterministic(&self, node: &Node, output: Value) -> Result<Value> {
        let Some(schema_id) = &node.schema_out else {
            return Ok(output);
        };
        match self.schemas.validate(schema_id, &output) {
            Ok(()) => Ok(output),
            Err(details) => Err(ArborError::OutputSchema {
                node_id: node.id.to_string(),
                schema_id: schema_id.clone(),
                details,
            }),
        }
    }
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("ops", &self.ops.len())
            .field("reducers", &self.reducers.len())
            .finish()
    }
}

/// Render the prompt: system prompt, context items, input, schema demand
fn build_prompt(
    system_prompt: Option<&str>,
    context: &ContextPackage,
    input: &Value,
    node: &Node,
) -> String {
    let mut prompt = String::new();
    if let Some(system) = system_prompt {
        prompt.push_str(system);
        prompt.push_str("\n\n");
    }
    if !context.is_empty() {
        prompt.push_str("# Context\n");
        for item in &context.items {
            prompt.push_str(&item.payload.to_string());
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str("# Input\n");
    prompt.push_str(&input.to_string());
    if node.schema_out.is_some() {
        prompt.push_str("\n\nReturn only JSON matching the declared output schema.");
    }
    prompt
}

/// Parse the agent response protocol: bare JSON output, or an object with
/// optional `output` and `tool_calls` fields. Unparseable text becomes a
/// string output (the repair ladder may still salvage it).
fn parse_agent_response(text: &str) -> (Value, Vec<RequestedCall>) {
    let Ok(value) = serde_json::from_str::<Value>(text.trim()) else {
        return (Value::String(text.to_string()), Vec::new());
    };

    let Some(object) = value.as_object() else {
        return (value, Vec::new());
    };

    let calls = object
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    Some(RequestedCall {
                        tool: c.get("tool")?.as_str()?.to_string(),
                        inputs: c.get("inputs").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if calls.is_empty() {
        return (value, Vec::new());
    }

    let output = object.get("output").cloned().unwrap_or(Value::Null);
    (output, calls)
}

/// Strings holding JSON parse to the value they hold; everything else is
/// already structured.
fn coerce_json(value: &Value) -> Value {
    if let Value::String(s) = value {
        if let Ok(parsed) = serde_json::from_str::<Value>(s.trim()) {
            return parsed;
        }
    }
    value.clone()
}

/// Tier-1 structural repair: fenced block first, then the widest brace or
/// bracket span.
fn extract_json(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if end > start {
                if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ═══════════════════════════════════════════════════════════════
    // Response protocol parsing
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn parse_bare_json_output() {
        let (output, calls) = parse_agent_response(r#"{"result": "HELLO"}"#);
        assert_eq!(output, json!({"result": "HELLO"}));
        assert!(calls.is_empty());
    }

    #[test]
    fn parse_tool_call_request() {
        let (output, calls) = parse_agent_response(
            r#"{"output": {"done": true}, "tool_calls": [{"tool": "search", "inputs": {"q": "rust"}}]}"#,
        );
        assert_eq!(output, json!({"done": true}));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "search");
        assert_eq!(calls[0].inputs, json!({"q": "rust"}));
    }

    #[test]
    fn parse_plain_text_becomes_string() {
        let (output, calls) = parse_agent_response("just words");
        assert_eq!(output, json!("just words"));
        assert!(calls.is_empty());
    }

    #[test]
    fn object_without_tool_calls_is_plain_output() {
        let (output, calls) = parse_agent_response(r#"{"output": "x", "note": "keep whole"}"#);
        // No tool_calls key: the whole object is the output
        assert_eq!(output, json!({"output": "x", "note": "keep whole"}));
        assert!(calls.is_empty());
    }

    // ═══════════════════════════════════════════════════════════════
    // Structural repair
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn extract_json_from_fence() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn extract_json_from_brace_span() {
        let text = "The answer is {\"a\": [1, 2]} as requested";
        assert_eq!(extract_json(text), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn extract_json_none_for_prose() {
        assert_eq!(extract_json("no structure here"), None);
    }

    #[test]
    fn coerce_json_unwraps_stringified() {
        assert_eq!(coerce_json(&json!("{\"a\": 1}")), json!({"a": 1}));
        assert_eq!(coerce_json(&json!("plain")), json!("plain"));
        assert_eq!(coerce_json(&json!({"b": 2})), json!({"b": 2}));
    }

    // ═══════════════════════════════════════════════════════════════
    // Prompt build
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn prompt_includes_sections_in_order() {
        use crate::manifest::{NodeSpec, Role};

        let node = crate::dag::Node::from_spec(&NodeSpec {
            id: "gen".to_string(),
            kind: NodeKind::Agent,
            role: Role::Linear,
            agent: Some("writer".to_string()),
            op: None,
            schema_in: None,
            schema_out: Some("out".to_string()),
            context: ContextSpec::None,
            tools: Vec::new(),
            continue_on_failure: false,
            default_start: false,
            merge: None,
            split: None,
            decision: None,
            timeout_seconds: None,
        });

        let package = ContextPackage::empty("run");
        let prompt = build_prompt(Some("Be terse."), &package, &json!({"q": 7}), &node);

        let system_pos = prompt.find("Be terse.").unwrap();
        let input_pos = prompt.find("# Input").unwrap();
        let schema_pos = prompt.find("output schema").unwrap();
        assert!(system_pos < input_pos);
        assert!(input_pos < schema_pos);
        assert!(prompt.contains("{\"q\":7}"));
    }
}
