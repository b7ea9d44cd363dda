//! Dag - validated workflow graph
//!
//! Performance notes (same tricks as the id-heavy hot paths elsewhere):
//! - Arc<str> for zero-cost cloning of node ids
//! - FxHashMap for faster non-crypto hashing
//! - SmallVec for stack-allocated edge lists (most nodes have ≤4 edges)
//!
//! Edges are stored in manifest declaration order; `outbound_edges` preserves
//! that order because it is the tie-break for every routing decision.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::manifest::{
    ContextSpec, DecisionSpec, MergeSpec, NodeKind, NodeSpec, Role, SplitSpec,
};
use crate::util::intern;

/// Stack-allocated edge-index list: most nodes have 0-4 edges
pub type EdgeVec = SmallVec<[usize; 4]>;

/// A vertex of the validated graph. Immutable after load.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: Arc<str>,
    pub kind: NodeKind,
    pub role: Role,
    pub agent: Option<String>,
    pub op: Option<String>,
    pub schema_in: Option<String>,
    pub schema_out: Option<String>,
    pub context: ContextSpec,
    pub tools: Vec<String>,
    pub continue_on_failure: bool,
    pub default_start: bool,
    pub merge: Option<MergeSpec>,
    pub split: Option<SplitSpec>,
    pub decision: DecisionSpec,
    pub timeout_seconds: Option<u64>,
}

impl Node {
    pub(crate) fn from_spec(spec: &NodeSpec) -> Self {
        Self {
            id: intern(&spec.id),
            kind: spec.kind,
            role: spec.role,
            agent: spec.agent.clone(),
            op: spec.op.clone(),
            schema_in: spec.schema_in.clone(),
            schema_out: spec.schema_out.clone(),
            context: spec.context.clone(),
            tools: spec.tools.clone(),
            continue_on_failure: spec.continue_on_failure,
            default_start: spec.default_start,
            merge: spec.merge.clone(),
            split: spec.split.clone(),
            decision: spec.decision.clone().unwrap_or_default(),
            timeout_seconds: spec.timeout_seconds,
        }
    }
}

/// A directed transition. `index` is the manifest declaration position.
#[derive(Debug, Clone)]
pub struct Edge {
    pub index: usize,
    pub from: Arc<str>,
    pub to: Arc<str>,
    pub label: Option<String>,
}

/// The validated workflow graph
#[derive(Debug)]
pub struct Dag {
    nodes: Vec<Node>,
    node_index: FxHashMap<Arc<str>, usize>,
    edges: Vec<Edge>,
    outbound: FxHashMap<Arc<str>, EdgeVec>,
    inbound: FxHashMap<Arc<str>, EdgeVec>,
    default_start: Arc<str>,
}

impl Dag {
    /// Assemble the graph structure. Callers go through `dag::build`, which
    /// validates before handing the graph out.
    pub(crate) fn assemble(
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        default_start: Arc<str>,
    ) -> Self {
        let mut node_index = FxHashMap::default();
        let mut outbound: FxHashMap<Arc<str>, EdgeVec> = FxHashMap::default();
        let mut inbound: FxHashMap<Arc<str>, EdgeVec> = FxHashMap::default();

        for (i, node) in nodes.iter().enumerate() {
            node_index.insert(Arc::clone(&node.id), i);
            outbound.insert(Arc::clone(&node.id), EdgeVec::new());
            inbound.insert(Arc::clone(&node.id), EdgeVec::new());
        }

        for edge in &edges {
            outbound
                .entry(Arc::clone(&edge.from))
                .or_default()
                .push(edge.index);
            inbound
                .entry(Arc::clone(&edge.to))
                .or_default()
                .push(edge.index);
        }

        Self {
            nodes,
            node_index,
            edges,
            outbound,
            inbound,
            default_start,
        }
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The single default-start node
    pub fn default_start(&self) -> &Arc<str> {
        &self.default_start
    }

    /// Outbound edges of a node in manifest declaration order
    pub fn outbound_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        static EMPTY: &[usize] = &[];
        self.outbound
            .get(id)
            .map_or(EMPTY, SmallVec::as_slice)
            .iter()
            .map(|&i| &self.edges[i])
    }

    /// Inbound edges of a node in manifest declaration order
    pub fn inbound_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        static EMPTY: &[usize] = &[];
        self.inbound
            .get(id)
            .map_or(EMPTY, SmallVec::as_slice)
            .iter()
            .map(|&i| &self.edges[i])
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.outbound.get(id).map_or(0, SmallVec::len)
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.inbound.get(id).map_or(0, SmallVec::len)
    }

    /// An edge by its manifest declaration index
    pub fn edge(&self, index: usize) -> Option<&Edge> {
        self.edges.get(index)
    }

    /// Check if there's a path from `from` to `to` (BFS)
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            for edge in self.outbound_edges(current) {
                if edge.to.as_ref() == to {
                    return true;
                }
                if visited.insert(edge.to.as_ref()) {
                    queue.push_back(edge.to.as_ref());
                }
            }
        }

        false
    }

    /// Topological order of node ids (Kahn). The graph is validated acyclic,
    /// so every node appears exactly once.
    pub fn topo_order(&self) -> Vec<Arc<str>> {
        let mut in_deg: FxHashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_ref(), self.in_degree(&n.id)))
            .collect();

        let mut queue: VecDeque<&Node> = self
            .nodes
            .iter()
            .filter(|n| self.in_degree(&n.id) == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = queue.pop_front() {
            order.push(Arc::clone(&node.id));
            for edge in self.outbound_edges(&node.id) {
                let deg = in_deg.get_mut(edge.to.as_ref()).expect("edge target exists");
                *deg -= 1;
                if *deg == 0 {
                    if let Some(next) = self.node(&edge.to) {
                        queue.push_back(next);
                    }
                }
            }
        }

        order
    }
}
