//! Router - deterministic successor selection
//!
//! Given a completed node and its output, pick the next action. The router
//! consults only node output, the manifest graph, and task state; it never
//! touches context or memory. Ties always break by manifest declaration
//! order, which is what makes runs reproducible.

use std::sync::Arc;

use serde_json::Value;

use crate::dag::{Dag, Node};
use crate::error::{ArborError, Result};
use crate::manifest::{MatchMode, Role};

/// Fan-out flavor of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    /// Clones racing the same input; first success wins
    Branch,
    /// Subtasks over disjoint input slices; all must finish
    Split,
}

/// What the engine should do after a node completed
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Follow one edge (start/linear/decision/merge)
    Advance {
        edge_index: usize,
        decision_key: Option<String>,
    },
    /// Spawn children on every outbound edge (branch/split)
    FanOut { mode: FanMode },
    /// Exit node: the task is done
    Finish,
}

/// Role-dispatched successor selection over the validated graph
pub struct Router {
    dag: Arc<Dag>,
}

impl Router {
    pub fn new(dag: Arc<Dag>) -> Self {
        Self { dag }
    }

    pub fn dag(&self) -> &Arc<Dag> {
        &self.dag
    }

    /// Select the next action for a completed node
    pub fn route(&self, node: &Node, output: &Value) -> Result<RouteDecision> {
        match node.role {
            Role::Start | Role::Linear | Role::Merge => {
                let edge = self
                    .dag
                    .outbound_edges(&node.id)
                    .next()
                    .ok_or_else(|| ArborError::BranchEmpty {
                        node_id: node.id.to_string(),
                    })?;
                Ok(RouteDecision::Advance {
                    edge_index: edge.index,
                    decision_key: None,
                })
            }
            Role::Decision => self.route_decision(node, output),
            Role::Branch => {
                if self.dag.out_degree(&node.id) == 0 {
                    return Err(ArborError::BranchEmpty {
                        node_id: node.id.to_string(),
                    });
                }
                Ok(RouteDecision::FanOut {
                    mode: FanMode::Branch,
                })
            }
            Role::Split => {
                if self.dag.out_degree(&node.id) == 0 {
                    return Err(ArborError::BranchEmpty {
                        node_id: node.id.to_string(),
                    });
                }
                Ok(RouteDecision::FanOut {
                    mode: FanMode::Split,
                })
            }
            Role::Exit => Ok(RouteDecision::Finish),
        }
    }

    /// First label match in declaration order wins; no match is a routing
    /// failure.
    fn route_decision(&self, node: &Node, output: &Value) -> Result<RouteDecision> {
        let key = decision_key(output);

        for edge in self.dag.outbound_edges(&node.id) {
            let Some(label) = &edge.label else { continue };
            let matched = match node.decision.match_mode {
                MatchMode::Equality => label == &key,
                MatchMode::Substring => key.contains(label.as_str()),
            };
            if matched {
                return Ok(RouteDecision::Advance {
                    edge_index: edge.index,
                    decision_key: Some(key),
                });
            }
        }

        Err(ArborError::NoEdgeMatched {
            node_id: node.id.to_string(),
            key,
        })
    }

    /// Derive the subtask input for each outbound edge of a split node.
    ///
    /// An entry in `split.slices` (by edge position) is a JSON pointer into
    /// the parent output; an empty pointer or a missing entry is identity.
    pub fn split_inputs(&self, node: &Node, output: &Value) -> Vec<Value> {
        let slices = node.split.as_ref().and_then(|s| s.slices.as_ref());
        self.dag
            .outbound_edges(&node.id)
            .enumerate()
            .map(|(i, _)| {
                match slices.and_then(|s| s.get(i)).filter(|p| !p.is_empty()) {
                    Some(pointer) => output.pointer(pointer).cloned().unwrap_or(Value::Null),
                    None => output.clone(),
                }
            })
            .collect()
    }
}

/// Routing key extraction: an explicit `decision` field wins, otherwise the
/// string form of the output.
pub fn decision_key(output: &Value) -> String {
    if let Some(key) = output.get("decision").and_then(Value::as_str) {
        return key.to_string();
    }
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::build;
    use crate::manifest::Manifest;
    use serde_json::json;

    fn decision_dag(match_mode: &str) -> Arc<Dag> {
        let yaml = format!(
            r#"
schema: arbor/manifest@0.1
workflow:
  nodes:
    - id: entry
      kind: deterministic
      role: start
    - id: classify
      kind: deterministic
      role: decision
      decision:
        match: {match_mode}
    - id: create_path
      kind: deterministic
      role: linear
    - id: update_path
      kind: deterministic
      role: linear
    - id: join
      kind: deterministic
      role: merge
    - id: done
      kind: deterministic
      role: exit
  edges:
    - from: entry
      to: classify
    - from: classify
      to: create_path
      label: create
    - from: classify
      to: update_path
      label: update
    - from: create_path
      to: join
    - from: update_path
      to: join
    - from: join
      to: done
"#
        );
        let manifest: Manifest = serde_yaml::from_str(&yaml).unwrap();
        Arc::new(build(&manifest).unwrap())
    }

    #[test]
    fn decision_key_extraction() {
        assert_eq!(decision_key(&json!({"decision": "create"})), "create");
        assert_eq!(decision_key(&json!("update")), "update");
        assert_eq!(decision_key(&json!(42)), "42");
        assert_eq!(decision_key(&json!({"other": 1})), "{\"other\":1}");
    }

    #[test]
    fn decision_routes_by_equality() {
        let dag = decision_dag("equality");
        let router = Router::new(Arc::clone(&dag));
        let node = dag.node("classify").unwrap();

        let decision = router.route(node, &json!({"decision": "create"})).unwrap();
        let RouteDecision::Advance { edge_index, decision_key } = decision else {
            panic!("expected advance");
        };
        assert_eq!(dag.edge(edge_index).unwrap().to.as_ref(), "create_path");
        assert_eq!(decision_key.as_deref(), Some("create"));
    }

    #[test]
    fn decision_no_match_is_routing_error() {
        let dag = decision_dag("equality");
        let router = Router::new(Arc::clone(&dag));
        let node = dag.node("classify").unwrap();

        let err = router.route(node, &json!({"decision": "delete"})).unwrap_err();
        assert_eq!(err.code(), "ARBOR-030");
    }

    #[test]
    fn decision_substring_mode() {
        let dag = decision_dag("substring");
        let router = Router::new(Arc::clone(&dag));
        let node = dag.node("classify").unwrap();

        let decision = router
            .route(node, &json!({"decision": "please update the record"}))
            .unwrap();
        let RouteDecision::Advance { edge_index, .. } = decision else {
            panic!("expected advance");
        };
        assert_eq!(dag.edge(edge_index).unwrap().to.as_ref(), "update_path");
    }

    #[test]
    fn substring_ties_break_by_declaration_order() {
        let dag = decision_dag("substring");
        let router = Router::new(Arc::clone(&dag));
        let node = dag.node("classify").unwrap();

        // Both labels are substrings; the first declared edge wins
        let decision = router
            .route(node, &json!({"decision": "create or update"}))
            .unwrap();
        let RouteDecision::Advance { edge_index, .. } = decision else {
            panic!("expected advance");
        };
        assert_eq!(dag.edge(edge_index).unwrap().to.as_ref(), "create_path");
    }

    #[test]
    fn structural_roles_take_single_edge() {
        let dag = decision_dag("equality");
        let router = Router::new(Arc::clone(&dag));

        let entry = dag.node("entry").unwrap();
        let RouteDecision::Advance { edge_index, decision_key } =
            router.route(entry, &json!(null)).unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(dag.edge(edge_index).unwrap().to.as_ref(), "classify");
        assert!(decision_key.is_none());

        let join = dag.node("join").unwrap();
        let RouteDecision::Advance { edge_index, .. } = router.route(join, &json!(null)).unwrap()
        else {
            panic!("expected advance");
        };
        assert_eq!(dag.edge(edge_index).unwrap().to.as_ref(), "done");
    }

    #[test]
    fn exit_finishes() {
        let dag = decision_dag("equality");
        let router = Router::new(Arc::clone(&dag));
        let done = dag.node("done").unwrap();
        assert_eq!(router.route(done, &json!("x")).unwrap(), RouteDecision::Finish);
    }

    fn split_dag(slices: &str) -> Arc<Dag> {
        let yaml = format!(
            r#"
schema: arbor/manifest@0.1
workflow:
  nodes:
    - id: entry
      kind: deterministic
      role: start
    - id: fan
      kind: deterministic
      role: split
      split:
        {slices}
    - id: left
      kind: deterministic
      role: linear
    - id: right
      kind: deterministic
      role: linear
    - id: join
      kind: deterministic
      role: merge
      merge:
        policy: collect_all
    - id: done
      kind: deterministic
      role: exit
  edges:
    - from: entry
      to: fan
    - from: fan
      to: left
    - from: fan
      to: right
    - from: left
      to: join
    - from: right
      to: join
    - from: join
      to: done
"#
        );
        let manifest: Manifest = serde_yaml::from_str(&yaml).unwrap();
        Arc::new(build(&manifest).unwrap())
    }

    #[test]
    fn split_inputs_follow_slice_pointers() {
        let dag = split_dag("slices: [\"/first\", \"/second\"]");
        let router = Router::new(Arc::clone(&dag));
        let fan = dag.node("fan").unwrap();

        let inputs = router.split_inputs(fan, &json!({"first": "x", "second": "y"}));
        assert_eq!(inputs, vec![json!("x"), json!("y")]);
    }

    #[test]
    fn split_inputs_default_to_identity() {
        let dag = split_dag("slices: null");
        let router = Router::new(Arc::clone(&dag));
        let fan = dag.node("fan").unwrap();

        let output = json!(["a", "b"]);
        let inputs = router.split_inputs(fan, &output);
        assert_eq!(inputs, vec![output.clone(), output]);
    }

    #[test]
    fn split_missing_pointer_is_null() {
        let dag = split_dag("slices: [\"/nope\", \"\"]");
        let router = Router::new(Arc::clone(&dag));
        let fan = dag.node("fan").unwrap();

        let inputs = router.split_inputs(fan, &json!({"first": 1}));
        assert_eq!(inputs[0], Value::Null);
        assert_eq!(inputs[1], json!({"first": 1}));
    }

    #[test]
    fn branch_and_split_fan_out() {
        let dag = split_dag("slices: null");
        let router = Router::new(Arc::clone(&dag));
        let fan = dag.node("fan").unwrap();
        assert_eq!(
            router.route(fan, &json!(null)).unwrap(),
            RouteDecision::FanOut {
                mode: FanMode::Split
            }
        );
    }
}
