//! Utilities Module - shared infrastructure
//!
//! Contains helper functions and data structures used across the codebase:
//! - `constants`: Centralized timeouts and limits
//! - `interner`: String interning for recurring ids (Arc<str> deduplication)

pub mod constants;
mod interner;

pub use constants::{
    DEFAULT_CONTEXT_BUDGET, MAX_QUEUE_SIZE, MAX_REPAIR_ATTEMPTS, MERGE_TIMEOUT, NODE_TIMEOUT,
    TOOL_TIMEOUT,
};
pub use interner::{intern, Interner};
