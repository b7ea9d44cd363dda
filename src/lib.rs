//! Arbor - manifest-driven DAG orchestration engine
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DOMAIN MODEL                          │
//! │  manifest/  declarations (NodeSpec, AgentSpec, ToolSpec)     │
//! │  dag/       validated graph (Dag, Node, Edge)                │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      APPLICATION LAYER                       │
//! │  exec/      engine loop, node executor, router               │
//! │  task/      task lifecycle, history, lineage, checkpoints    │
//! │  context/   token-budgeted assembly over memory tiers        │
//! │  overrides/ scoped runtime parameter replacement             │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                      │
//! │  memory/    three-tier stores (in-memory, append-file)       │
//! │  event/     telemetry bus, plugin fan-out, trace sink        │
//! │  adapter/   LLM and tool interfaces (mocks included)         │
//! │  util/      constants, string interning                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`manifest`] | Validated declarations + JSON Schema registry |
//! | [`dag`] | Graph structure and load-time invariants |
//! | [`exec`] | Engine driver, six-step node executor, router |
//! | [`task`] | Task state, history, clone/subtask lineage |
//! | [`context`] | Profile-driven, budgeted context packages |
//! | [`memory`] | Task/project/global stores behind one trait |
//! | [`overrides`] | task > project > global > manifest resolution |
//! | [`event`] | Ordered event stream with isolated plugins |
//! | [`adapter`] | `generate`/`invoke` seams to the outside world |
//! | [`error`] | Error codes and the failure taxonomy |

// ═══════════════════════════════════════════════════════════════
// DOMAIN MODEL
// ═══════════════════════════════════════════════════════════════
pub mod dag;
pub mod manifest;

// ═══════════════════════════════════════════════════════════════
// APPLICATION LAYER
// ═══════════════════════════════════════════════════════════════
pub mod context;
pub mod exec;
pub mod overrides;
pub mod task;

// ═══════════════════════════════════════════════════════════════
// INFRASTRUCTURE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod adapter;
pub mod event;
pub mod memory;
pub mod util;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

// Error types
pub use error::{ArborError, ErrorKind};

// Config
pub use config::ArborConfig;

// Domain model
pub use dag::{Dag, Edge, ManifestViolation, Node};
pub use manifest::{
    AgentSpec, ContextSpec, EdgeSpec, Manifest, MatchMode, MergePolicy, NodeKind, NodeSpec, Role,
    ToolPermissions, ToolSpec,
};

// Application layer
pub use exec::{Engine, Inspection, RouteDecision, Router, RunResult};
pub use overrides::{OverrideParams, OverrideScope, TargetKind};
pub use task::{
    NodeExecutionRecord, RoutingEntry, Task, TaskKind, TaskSpec, TaskStatus, ToolCallRecord,
};

// Infrastructure
pub use adapter::{FnTool, LlmAdapter, ScriptedLlm, ToolAdapter, ToolCapabilities};
pub use context::{ContextPackage, ContextProfile};
pub use event::{Event, EventKind, Plugin, TelemetryBus, TraceSink};
pub use memory::{ContextItem, InMemoryStore, MemoryStore, Tier};

impl From<serde_json::Value> for TaskSpec {
    fn from(input: serde_json::Value) -> Self {
        TaskSpec::new(input)
    }
}
