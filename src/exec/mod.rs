//! Exec Module - node execution, routing, and the engine loop
//!
//! - `executor`: Six-step lifecycle of a single node invocation
//! - `router`: Deterministic successor selection (role semantics)
//! - `engine`: Top-level loop, task queue, join barriers, public API

mod engine;
mod executor;
mod router;

pub use engine::{Engine, EngineConfig, Inspection, RunResult};
pub use executor::{NodeConfig, NodeExecutor, OpFn, ReducerFn};
pub use router::{decision_key, FanMode, RouteDecision, Router};
