//! Centralized constants for Arbor runtime configuration
//!
//! All timeout and limit values in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Execution Timeouts
// ═══════════════════════════════════════════════════════════════

/// Default timeout for a single node invocation (overridable per node/agent)
pub const NODE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for a single tool call inside an agent node
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling for a merge barrier awaiting upstream clones/subtasks
pub const MERGE_TIMEOUT: Duration = Duration::from_secs(300);

// ═══════════════════════════════════════════════════════════════
// Queue & Fan-out Limits
// ═══════════════════════════════════════════════════════════════

/// Default capacity of the top-level task queue
pub const MAX_QUEUE_SIZE: usize = 64;

/// Root tasks drain sequentially in v1
pub const MAX_CONCURRENCY: usize = 1;

// ═══════════════════════════════════════════════════════════════
// Context Assembly
// ═══════════════════════════════════════════════════════════════

/// Token budget used by the built-in default profile
pub const DEFAULT_CONTEXT_BUDGET: u32 = 2048;

/// Count bound for the project memory tier before eviction kicks in
pub const PROJECT_STORE_MAX_ITEMS: usize = 10_000;

// ═══════════════════════════════════════════════════════════════
// Output Repair
// ═══════════════════════════════════════════════════════════════

/// Bounded repair tiers for agent output: structural fix, then one re-request
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;
