//! Arbor Error Types with Error Codes
//!
//! Error code ranges:
//! - ARBOR-000-009: Manifest errors
//! - ARBOR-010-019: DAG structural errors (see `dag::ManifestViolation`)
//! - ARBOR-020-029: Schema/validation errors
//! - ARBOR-030-039: Routing errors
//! - ARBOR-040-049: Task lifecycle errors
//! - ARBOR-050-059: Memory/context errors
//! - ARBOR-060-069: Agent/LLM errors
//! - ARBOR-070-079: Tool errors
//! - ARBOR-080-089: Override errors
//! - ARBOR-090-099: Engine/queue/IO errors

use miette::Diagnostic;
use thiserror::Error;

use crate::dag::ManifestViolation;

pub type Result<T> = std::result::Result<T, ArborError>;

/// The error taxonomy every node-invocation failure is tagged with.
///
/// Serialized snake_case into `NodeExecutionRecord` errors and event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input or output failed schema check
    Validation,
    /// No edge matched, or an edge target is unreachable
    Routing,
    /// Tool invocation returned an error or timed out
    Tool,
    /// LLM invocation failed after allowed attempts
    Agent,
    /// Agent output could not be parsed/repaired to the declared schema
    Json,
    /// A tool call was refused by policy
    Security,
    /// A node exceeded its configured ceiling
    Timeout,
    /// Enqueue refused at capacity
    QueueFull,
    /// A memory tier was unavailable
    ContextDegraded,
    /// A merge barrier expired before its policy was satisfied
    MergeTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Routing => "routing",
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Json => "json",
            Self::Security => "security",
            Self::Timeout => "timeout",
            Self::QueueFull => "queue_full",
            Self::ContextDegraded => "context_degraded",
            Self::MergeTimeout => "merge_timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a violation list for display
fn format_violations(violations: &[ManifestViolation]) -> String {
    if violations.len() == 1 {
        return violations[0].to_string();
    }
    format!(
        "{} violations: {}",
        violations.len(),
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    )
}

/// All error variants are part of the public API.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum ArborError {
    // ═══════════════════════════════════════════
    // MANIFEST ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-001] Failed to parse manifest: {details}")]
    #[diagnostic(
        code(arbor::manifest_parse),
        help("Check YAML syntax: indentation and quoting")
    )]
    ManifestParse { details: String },

    #[error("[ARBOR-002] Invalid schema version: expected '{expected}', got '{actual}'")]
    #[diagnostic(code(arbor::invalid_schema_version))]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("[ARBOR-003] Manifest rejected: {}", format_violations(.violations))]
    #[diagnostic(
        code(arbor::manifest_invalid),
        help("Fix every listed violation; the engine never accepts a partially-valid graph")
    )]
    ManifestInvalid { violations: Vec<ManifestViolation> },

    #[error("[ARBOR-004] Deterministic operation '{op}' is not bound")]
    #[diagnostic(
        code(arbor::op_unbound),
        help("Call Engine::bind_op before running the workflow")
    )]
    OpUnbound { op: String },

    #[error("[ARBOR-005] Reducer '{reducer}' is not bound")]
    #[diagnostic(code(arbor::reducer_unbound))]
    ReducerUnbound { reducer: String },

    // ═══════════════════════════════════════════
    // SCHEMA/VALIDATION ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-020] Input to node '{node_id}' failed schema '{schema_id}': {details}")]
    InputSchema {
        node_id: String,
        schema_id: String,
        details: String,
    },

    #[error("[ARBOR-021] Output of node '{node_id}' failed schema '{schema_id}': {details}")]
    OutputSchema {
        node_id: String,
        schema_id: String,
        details: String,
    },

    #[error("[ARBOR-022] Schema '{schema_id}' failed to compile: {details}")]
    SchemaCompile { schema_id: String, details: String },

    // ═══════════════════════════════════════════
    // ROUTING ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-030] No edge of decision node '{node_id}' matched key '{key}'")]
    #[diagnostic(
        code(arbor::no_edge_matched),
        help("Label an outbound edge with the decision key, or add a fallback edge")
    )]
    NoEdgeMatched { node_id: String, key: String },

    #[error("[ARBOR-031] Node '{node_id}' has no outbound edges to fan out")]
    BranchEmpty { node_id: String },

    #[error("[ARBOR-032] Merge '{node_id}' received {arrived} of {expected} expected inbounds")]
    MergeUnreachable {
        node_id: String,
        expected: usize,
        arrived: usize,
    },

    // ═══════════════════════════════════════════
    // TASK ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-040] Task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    #[error("[ARBOR-041] Task '{task_id}' is terminal and cannot be mutated")]
    TaskTerminal { task_id: String },

    #[error("[ARBOR-042] Checkpoint rejected: {details}")]
    #[diagnostic(code(arbor::checkpoint_format))]
    CheckpointFormat { details: String },

    #[error("[ARBOR-043] Checkpoint manifest hash '{actual}' does not match engine '{expected}'")]
    #[diagnostic(
        code(arbor::checkpoint_mismatch),
        help("Checkpoints only restore into an engine built from the same manifest")
    )]
    CheckpointMismatch { expected: String, actual: String },

    // ═══════════════════════════════════════════
    // MEMORY/CONTEXT ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-050] Memory tier '{tier}' unavailable: {reason}")]
    StoreUnavailable { tier: String, reason: String },

    #[error("[ARBOR-051] Context assembly for node '{node_id}' failed: all tiers unavailable")]
    ContextUnavailable { node_id: String },

    #[error("[ARBOR-052] Global write of '{item_id}' refused by confirmation policy")]
    ConfirmationRefused { item_id: String },

    #[error("[ARBOR-053] Profile '{profile_id}' not declared in manifest")]
    ProfileNotFound { profile_id: String },

    // ═══════════════════════════════════════════
    // AGENT/LLM ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-060] No LLM adapter bound for agent node '{node_id}'")]
    #[diagnostic(
        code(arbor::llm_unbound),
        help("Call Engine::bind_llm with a provider adapter")
    )]
    LlmUnbound { node_id: String },

    #[error("[ARBOR-061] LLM invocation failed for '{agent_id}': {reason}")]
    AgentFailure { agent_id: String, reason: String },

    #[error(
        "[ARBOR-062] Output of node '{node_id}' unrepairable after {attempts} attempts: {details}"
    )]
    #[diagnostic(
        code(arbor::json_unrepairable),
        help("The agent must return JSON matching the declared output schema")
    )]
    JsonUnrepairable {
        node_id: String,
        attempts: u32,
        details: String,
    },

    // ═══════════════════════════════════════════
    // TOOL ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-070] Tool '{tool}' is not bound")]
    ToolUnbound { tool: String },

    #[error("[ARBOR-071] Tool '{tool}' failed: {reason}")]
    ToolFailure { tool: String, reason: String },

    #[error("[ARBOR-072] Tool '{tool}' refused by policy: {reason}")]
    ToolRefused { tool: String, reason: String },

    #[error("[ARBOR-073] Tool '{tool}' is not allowed on node '{node_id}'")]
    ToolNotAllowed { tool: String, node_id: String },

    #[error("[ARBOR-074] Tool '{tool}' inputs failed schema '{schema_id}': {details}")]
    ToolSchema {
        tool: String,
        schema_id: String,
        details: String,
    },

    // ═══════════════════════════════════════════
    // OVERRIDE ERRORS (080-089)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-080] Override target '{target}' does not exist in the manifest")]
    OverrideUnknownTarget { target: String },

    #[error("[ARBOR-081] Override '{parameter}' = {value} exceeds manifest ceiling {ceiling}")]
    #[diagnostic(
        code(arbor::override_ceiling),
        help("Manifest ceilings are never exceeded by runtime overrides")
    )]
    OverrideCeiling {
        parameter: String,
        value: String,
        ceiling: String,
    },

    #[error("[ARBOR-082] Override '{parameter}' out of range: {details}")]
    OverrideRange { parameter: String, details: String },

    #[error("[ARBOR-083] Override may not enable tool '{tool}' the manifest disables")]
    OverrideEscalation { tool: String },

    // ═══════════════════════════════════════════
    // ENGINE/QUEUE ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[ARBOR-090] Queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    #[error("[ARBOR-091] Node '{node_id}' timed out after {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    #[error("[ARBOR-092] Merge barrier at '{node_id}' expired after {timeout_ms}ms")]
    MergeBarrierTimeout { node_id: String, timeout_ms: u64 },

    #[error("[ARBOR-093] Task '{task_id}' was cancelled")]
    Cancelled { task_id: String },

    #[error("[ARBOR-094] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[ARBOR-095] JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[ARBOR-096] Config error: {reason}")]
    #[diagnostic(
        code(arbor::config),
        help("Check ~/.config/arbor/config.toml for syntax errors")
    )]
    Config { reason: String },

    #[error("[ARBOR-097] Plugin registry is locked during event dispatch")]
    #[diagnostic(
        code(arbor::subscribe_during_dispatch),
        help("Subscribe and unsubscribe plugins outside event dispatch")
    )]
    SubscribeDuringDispatch,

    #[error("[ARBOR-098] Plugin '{plugin_id}' is not subscribed")]
    PluginUnknown { plugin_id: String },
}

impl ArborError {
    /// Get the error code (e.g., "ARBOR-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::ManifestParse { .. } => "ARBOR-001",
            Self::InvalidSchemaVersion { .. } => "ARBOR-002",
            Self::ManifestInvalid { .. } => "ARBOR-003",
            Self::OpUnbound { .. } => "ARBOR-004",
            Self::ReducerUnbound { .. } => "ARBOR-005",
            Self::InputSchema { .. } => "ARBOR-020",
            Self::OutputSchema { .. } => "ARBOR-021",
            Self::SchemaCompile { .. } => "ARBOR-022",
            Self::NoEdgeMatched { .. } => "ARBOR-030",
            Self::BranchEmpty { .. } => "ARBOR-031",
            Self::MergeUnreachable { .. } => "ARBOR-032",
            Self::TaskNotFound { .. } => "ARBOR-040",
            Self::TaskTerminal { .. } => "ARBOR-041",
            Self::CheckpointFormat { .. } => "ARBOR-042",
            Self::CheckpointMismatch { .. } => "ARBOR-043",
            Self::StoreUnavailable { .. } => "ARBOR-050",
            Self::ContextUnavailable { .. } => "ARBOR-051",
            Self::ConfirmationRefused { .. } => "ARBOR-052",
            Self::ProfileNotFound { .. } => "ARBOR-053",
            Self::LlmUnbound { .. } => "ARBOR-060",
            Self::AgentFailure { .. } => "ARBOR-061",
            Self::JsonUnrepairable { .. } => "ARBOR-062",
            Self::ToolUnbound { .. } => "ARBOR-070",
            Self::ToolFailure { .. } => "ARBOR-071",
            Self::ToolRefused { .. } => "ARBOR-072",
            Self::ToolNotAllowed { .. } => "ARBOR-073",
            Self::ToolSchema { .. } => "ARBOR-074",
            Self::OverrideUnknownTarget { .. } => "ARBOR-080",
            Self::OverrideCeiling { .. } => "ARBOR-081",
            Self::OverrideRange { .. } => "ARBOR-082",
            Self::OverrideEscalation { .. } => "ARBOR-083",
            Self::QueueFull { .. } => "ARBOR-090",
            Self::NodeTimeout { .. } => "ARBOR-091",
            Self::MergeBarrierTimeout { .. } => "ARBOR-092",
            Self::Cancelled { .. } => "ARBOR-093",
            Self::Io(_) => "ARBOR-094",
            Self::Json(_) => "ARBOR-095",
            Self::Config { .. } => "ARBOR-096",
            Self::SubscribeDuringDispatch => "ARBOR-097",
            Self::PluginUnknown { .. } => "ARBOR-098",
        }
    }

    /// Map onto the node-invocation error taxonomy.
    ///
    /// Returns `None` for errors that never surface from a node invocation
    /// (manifest rejection, checkpoint format, plugin registry misuse).
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InputSchema { .. }
            | Self::OutputSchema { .. }
            | Self::SchemaCompile { .. }
            | Self::OpUnbound { .. }
            | Self::ReducerUnbound { .. }
            | Self::OverrideCeiling { .. }
            | Self::OverrideRange { .. } => Some(ErrorKind::Validation),
            Self::NoEdgeMatched { .. }
            | Self::BranchEmpty { .. }
            | Self::MergeUnreachable { .. } => Some(ErrorKind::Routing),
            Self::ToolUnbound { .. } | Self::ToolFailure { .. } | Self::ToolSchema { .. } => {
                Some(ErrorKind::Tool)
            }
            Self::ToolRefused { .. }
            | Self::ToolNotAllowed { .. }
            | Self::OverrideEscalation { .. }
            | Self::ConfirmationRefused { .. } => Some(ErrorKind::Security),
            Self::LlmUnbound { .. } | Self::AgentFailure { .. } => Some(ErrorKind::Agent),
            Self::JsonUnrepairable { .. } => Some(ErrorKind::Json),
            Self::NodeTimeout { .. } => Some(ErrorKind::Timeout),
            Self::QueueFull { .. } => Some(ErrorKind::QueueFull),
            Self::StoreUnavailable { .. } | Self::ContextUnavailable { .. } => {
                Some(ErrorKind::ContextDegraded)
            }
            Self::MergeBarrierTimeout { .. } => Some(ErrorKind::MergeTimeout),
            _ => None,
        }
    }

    /// Check if the error is transient (an identical retry could succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AgentFailure { .. }
                | Self::ToolFailure { .. }
                | Self::NodeTimeout { .. }
                | Self::StoreUnavailable { .. }
                | Self::QueueFull { .. }
        )
    }
}
