//! DAG Module - validated workflow graph
//!
//! - `graph`: Typed graph structure (`Dag`, `Node`, `Edge`)
//! - `validate`: Load-time invariant checks; all violations collected
//!
//! The graph is immutable after `build` succeeds. Structural errors are
//! fatal: the engine never accepts a partially-valid DAG.

mod graph;
mod validate;

pub use graph::{Dag, Edge, Node};
pub use validate::{build, ManifestViolation};
