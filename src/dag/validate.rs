//! DAG Validation - load-time structural invariants
//!
//! `build` runs every check and collects every violation; the engine never
//! accepts a partially-valid graph. Check order:
//! 1. Reference resolution (agents, ops, tools, schemas, profiles, edges)
//! 2. Role/degree constraints
//! 3. Acyclicity (DFS three-color marking)
//! 4. Reachability from a start node
//! 5. Path-to-exit for every non-exit node
//!
//! Violation codes:
//! - ARBOR-010: Cycle detected
//! - ARBOR-011: Role/degree constraint broken
//! - ARBOR-012: Unresolved reference
//! - ARBOR-013: Edge endpoint missing
//! - ARBOR-014: Node unreachable from any start
//! - ARBOR-015: Node has no path to an exit
//! - ARBOR-016: Default start missing or ambiguous
//! - ARBOR-017: Duplicate node id
//! - ARBOR-018: Invalid id format
//! - ARBOR-019: Invalid role/profile/agent configuration

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::manifest::{Manifest, NodeKind, Role};
use crate::util::intern;

use super::graph::{Dag, Edge, Node};

/// A single structural violation. `build` returns the complete list.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManifestViolation {
    #[error("[ARBOR-010] Cycle detected: {cycle}")]
    Cycle { cycle: String },

    #[error("[ARBOR-011] Node '{node}' ({role}): {detail}")]
    RoleDegree {
        node: String,
        role: &'static str,
        detail: String,
    },

    #[error("[ARBOR-012] Node '{node}' references unknown {kind} '{id}'")]
    UnresolvedReference {
        node: String,
        kind: &'static str,
        id: String,
    },

    #[error("[ARBOR-013] Edge #{index} references unknown node '{endpoint}'")]
    EdgeEndpointMissing { index: usize, endpoint: String },

    #[error("[ARBOR-014] Node '{node}' is unreachable from any start node")]
    UnreachableFromStart { node: String },

    #[error("[ARBOR-015] Node '{node}' has no path to an exit node")]
    NoPathToExit { node: String },

    #[error("[ARBOR-016] Default start: {detail}")]
    DefaultStart { detail: String },

    #[error("[ARBOR-017] Duplicate node id '{id}'")]
    DuplicateNode { id: String },

    #[error("[ARBOR-018] Invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("[ARBOR-019] Invalid configuration for '{subject}': {detail}")]
    InvalidConfig { subject: String, detail: String },
}

/// Build the validated graph from a manifest, or fail with every violation.
pub fn build(manifest: &Manifest) -> Result<Dag, Vec<ManifestViolation>> {
    let mut violations = Vec::new();

    let nodes: Vec<Node> = manifest.workflow.nodes.iter().map(Node::from_spec).collect();

    // Duplicate ids and id format come first: later checks index by id.
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for spec in &manifest.workflow.nodes {
        if let Err(e) = crate::manifest::validate_id(&spec.id) {
            violations.push(ManifestViolation::InvalidId {
                id: spec.id.clone(),
                reason: e.to_string(),
            });
        }
        if !seen.insert(&spec.id) {
            violations.push(ManifestViolation::DuplicateNode {
                id: spec.id.clone(),
            });
        }
    }

    let node_ids: FxHashSet<&str> = seen;

    let mut edges = Vec::with_capacity(manifest.workflow.edges.len());
    for (index, spec) in manifest.workflow.edges.iter().enumerate() {
        for endpoint in [&spec.from, &spec.to] {
            if !node_ids.contains(endpoint.as_str()) {
                violations.push(ManifestViolation::EdgeEndpointMissing {
                    index,
                    endpoint: endpoint.clone(),
                });
            }
        }
        edges.push(Edge {
            index,
            from: intern(&spec.from),
            to: intern(&spec.to),
            label: spec.label.clone(),
        });
    }

    check_references(manifest, &mut violations);

    // Degree maps built directly from the edge list so constraint checks do
    // not depend on a (possibly broken) assembled graph.
    let mut out_deg: FxHashMap<&str, usize> = FxHashMap::default();
    let mut in_deg: FxHashMap<&str, usize> = FxHashMap::default();
    for edge in &manifest.workflow.edges {
        *out_deg.entry(edge.from.as_str()).or_default() += 1;
        *in_deg.entry(edge.to.as_str()).or_default() += 1;
    }
    check_degrees(manifest, &out_deg, &in_deg, &mut violations);

    let default_start = resolve_default_start(manifest, &mut violations);

    // Traversal checks need an assemblable graph: every endpoint resolved,
    // no duplicate ids. Anything else is collected alongside.
    let assemblable = !violations.iter().any(|v| {
        matches!(
            v,
            ManifestViolation::EdgeEndpointMissing { .. } | ManifestViolation::DuplicateNode { .. }
        )
    });

    if assemblable {
        let dag = Dag::assemble(nodes, edges, default_start.unwrap_or_else(|| intern("")));

        if let Err(cycle) = detect_cycles(&dag) {
            violations.push(cycle);
        } else {
            check_reachability(&dag, &mut violations);
        }

        if violations.is_empty() {
            return Ok(dag);
        }
    }

    Err(violations)
}

/// Every id a node mentions must resolve within the manifest.
fn check_references(manifest: &Manifest, violations: &mut Vec<ManifestViolation>) {
    for node in &manifest.workflow.nodes {
        match node.kind {
            NodeKind::Agent => {
                match &node.agent {
                    Some(agent_id) if !manifest.agents.contains_key(agent_id) => {
                        violations.push(ManifestViolation::UnresolvedReference {
                            node: node.id.clone(),
                            kind: "agent",
                            id: agent_id.clone(),
                        });
                    }
                    None => violations.push(ManifestViolation::InvalidConfig {
                        subject: node.id.clone(),
                        detail: "agent node declares no agent id".to_string(),
                    }),
                    _ => {}
                }
            }
            NodeKind::Deterministic => {
                if node.agent.is_some() {
                    violations.push(ManifestViolation::InvalidConfig {
                        subject: node.id.clone(),
                        detail: "deterministic node declares an agent id".to_string(),
                    });
                }
            }
        }

        for tool_id in &node.tools {
            if !manifest.tools.contains_key(tool_id) {
                violations.push(ManifestViolation::UnresolvedReference {
                    node: node.id.clone(),
                    kind: "tool",
                    id: tool_id.clone(),
                });
            }
        }

        for schema_id in [&node.schema_in, &node.schema_out].into_iter().flatten() {
            if !manifest.schemas.contains_key(schema_id) {
                violations.push(ManifestViolation::UnresolvedReference {
                    node: node.id.clone(),
                    kind: "schema",
                    id: schema_id.clone(),
                });
            }
        }

        if let crate::manifest::ContextSpec::Profile(profile_id) = &node.context {
            if !manifest.profiles.contains_key(profile_id) {
                violations.push(ManifestViolation::UnresolvedReference {
                    node: node.id.clone(),
                    kind: "profile",
                    id: profile_id.clone(),
                });
            }
        }
    }

    for (id, agent) in &manifest.agents {
        let mut parts = agent.model.splitn(2, '/');
        let provider = parts.next().unwrap_or_default();
        let model = parts.next().unwrap_or_default();
        if provider.is_empty() || model.is_empty() {
            violations.push(ManifestViolation::InvalidConfig {
                subject: id.clone(),
                detail: format!("model '{}' must be 'provider/model'", agent.model),
            });
        }
    }

    for (id, profile) in &manifest.profiles {
        if let Err(detail) = profile.validate() {
            violations.push(ManifestViolation::InvalidConfig {
                subject: id.clone(),
                detail,
            });
        }
    }
}

/// Role/degree constraints from the structural contract:
/// linear in=1 out=1; decision out≥2; branch out≥2; split out≥1;
/// merge in≥2 out=1; start in=0; exit out=0.
fn check_degrees(
    manifest: &Manifest,
    out_deg: &FxHashMap<&str, usize>,
    in_deg: &FxHashMap<&str, usize>,
    violations: &mut Vec<ManifestViolation>,
) {
    for node in &manifest.workflow.nodes {
        let outs = out_deg.get(node.id.as_str()).copied().unwrap_or(0);
        let ins = in_deg.get(node.id.as_str()).copied().unwrap_or(0);
        let role = node.role;

        let mut fail = |detail: String| {
            violations.push(ManifestViolation::RoleDegree {
                node: node.id.clone(),
                role: role.as_str(),
                detail,
            });
        };

        match role {
            Role::Start => {
                if ins != 0 {
                    fail(format!("start nodes take no inbound edges, found {ins}"));
                }
                if outs != 1 {
                    fail(format!("start nodes need exactly one outbound edge, found {outs}"));
                }
            }
            Role::Linear => {
                if ins != 1 {
                    fail(format!("linear nodes need exactly one inbound edge, found {ins}"));
                }
                if outs != 1 {
                    fail(format!("linear nodes need exactly one outbound edge, found {outs}"));
                }
            }
            Role::Decision => {
                if outs < 2 {
                    fail(format!("decision nodes need at least two outbound edges, found {outs}"));
                }
            }
            Role::Branch => {
                if outs < 2 {
                    fail(format!("branch nodes need at least two outbound edges, found {outs}"));
                }
            }
            Role::Split => {
                if outs < 1 {
                    fail(format!("split nodes need at least one outbound edge, found {outs}"));
                }
            }
            Role::Merge => {
                if ins < 2 {
                    fail(format!("merge nodes need at least two inbound edges, found {ins}"));
                }
                if outs != 1 {
                    fail(format!("merge nodes need exactly one outbound edge, found {outs}"));
                }
            }
            Role::Exit => {
                if outs != 0 {
                    fail(format!("exit nodes take no outbound edges, found {outs}"));
                }
                if node.kind == NodeKind::Agent {
                    violations.push(ManifestViolation::InvalidConfig {
                        subject: node.id.clone(),
                        detail: "exit nodes may not invoke an agent".to_string(),
                    });
                }
            }
        }

        // Decision edges route by label; an unlabeled one can never match.
        if role == Role::Decision {
            for edge in manifest.workflow.edges.iter().filter(|e| e.from == node.id) {
                if edge.label.is_none() {
                    violations.push(ManifestViolation::InvalidConfig {
                        subject: node.id.clone(),
                        detail: format!("outbound edge to '{}' has no label", edge.to),
                    });
                }
            }
        }
    }
}

/// Exactly one node carries the default-start mark. A lone start node is
/// promoted implicitly.
fn resolve_default_start(
    manifest: &Manifest,
    violations: &mut Vec<ManifestViolation>,
) -> Option<Arc<str>> {
    let starts: Vec<&str> = manifest
        .workflow
        .nodes
        .iter()
        .filter(|n| n.role == Role::Start)
        .map(|n| n.id.as_str())
        .collect();

    if starts.is_empty() {
        violations.push(ManifestViolation::DefaultStart {
            detail: "no start node declared".to_string(),
        });
        return None;
    }

    let marked: Vec<&str> = manifest
        .workflow
        .nodes
        .iter()
        .filter(|n| n.role == Role::Start && n.default_start)
        .map(|n| n.id.as_str())
        .collect();

    match (marked.len(), starts.len()) {
        (1, _) => Some(intern(marked[0])),
        (0, 1) => Some(intern(starts[0])),
        (0, _) => {
            violations.push(ManifestViolation::DefaultStart {
                detail: format!(
                    "{} start nodes and none marked default_start",
                    starts.len()
                ),
            });
            None
        }
        (n, _) => {
            violations.push(ManifestViolation::DefaultStart {
                detail: format!("{n} nodes marked default_start, expected one"),
            });
            None
        }
    }
}

/// Detect cycles with DFS three-color marking.
///
/// - White: unvisited
/// - Gray: currently in the DFS stack
/// - Black: fully processed
///
/// A cycle exists iff a Gray node is re-entered.
fn detect_cycles(dag: &Dag) -> Result<(), ManifestViolation> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: FxHashMap<&str, Color> = dag
        .nodes()
        .iter()
        .map(|n| (n.id.as_ref(), Color::White))
        .collect();
    let mut stack: Vec<&str> = Vec::new();

    fn dfs<'a>(
        node: &'a str,
        dag: &'a Dag,
        colors: &mut FxHashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), String> {
        colors.insert(node, Color::Gray);
        stack.push(node);

        for edge in dag.outbound_edges(node) {
            match colors.get(edge.to.as_ref()) {
                Some(Color::Gray) => {
                    let cycle_start = stack
                        .iter()
                        .position(|x| *x == edge.to.as_ref())
                        .unwrap_or(0);
                    let mut cycle: Vec<&str> = stack[cycle_start..].to_vec();
                    cycle.push(edge.to.as_ref());
                    return Err(cycle.join(" → "));
                }
                Some(Color::White) | None => {
                    // Look up the edge target through the dag so lifetimes tie
                    // to the graph, not the traversal stack.
                    if let Some(target) = dag.node(&edge.to) {
                        dfs(target.id.as_ref(), dag, colors, stack)?;
                    }
                }
                Some(Color::Black) => {}
            }
        }

        stack.pop();
        colors.insert(node, Color::Black);
        Ok(())
    }

    for node in dag.nodes() {
        if colors.get(node.id.as_ref()) == Some(&Color::White) {
            if let Err(cycle) = dfs(node.id.as_ref(), dag, &mut colors, &mut stack) {
                return Err(ManifestViolation::Cycle { cycle });
            }
        }
    }

    Ok(())
}

/// Forward BFS from every start node, then reverse BFS from every exit node.
fn check_reachability(dag: &Dag, violations: &mut Vec<ManifestViolation>) {
    let mut from_start: FxHashSet<&str> = FxHashSet::default();
    let mut queue: Vec<&str> = dag
        .nodes()
        .iter()
        .filter(|n| n.role == Role::Start)
        .map(|n| n.id.as_ref())
        .collect();
    from_start.extend(queue.iter().copied());

    while let Some(current) = queue.pop() {
        for edge in dag.outbound_edges(current) {
            if from_start.insert(edge.to.as_ref()) {
                queue.push(edge.to.as_ref());
            }
        }
    }

    let mut to_exit: FxHashSet<&str> = FxHashSet::default();
    let mut queue: Vec<&str> = dag
        .nodes()
        .iter()
        .filter(|n| n.role == Role::Exit)
        .map(|n| n.id.as_ref())
        .collect();
    to_exit.extend(queue.iter().copied());

    while let Some(current) = queue.pop() {
        for edge in dag.inbound_edges(current) {
            if to_exit.insert(edge.from.as_ref()) {
                queue.push(edge.from.as_ref());
            }
        }
    }

    for node in dag.nodes() {
        if !from_start.contains(node.id.as_ref()) {
            violations.push(ManifestViolation::UnreachableFromStart {
                node: node.id.to_string(),
            });
        }
        if node.role != Role::Exit && !to_exit.contains(node.id.as_ref()) {
            violations.push(ManifestViolation::NoPathToExit {
                node: node.id.to_string(),
            });
        }
    }
}
