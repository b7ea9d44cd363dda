//! Override Layer - scoped runtime parameter replacement
//!
//! Three scopes with precedence task > project > global > manifest default.
//! Every override is validated on set: the target must exist, the parameter
//! must belong to the closed set for its target kind, ranges must be legal,
//! manifest ceilings are never exceeded, and permissions can only be
//! disabled, never enabled. Task-scoped overrides auto-expire when the task
//! reaches a terminal state.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};
use crate::manifest::Manifest;

/// Lifetime of an override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideScope {
    /// Engine-instance lifetime
    Global,
    /// Project-boundary lifetime (application-defined)
    Project,
    /// One task execution; cleared on terminal state
    Task(Arc<str>),
}

/// What an override targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Agent,
    Tool,
    Node,
}

/// The closed overridable parameter set. Which fields are legal depends on
/// the target kind: agents take model/temperature/max_tokens/top_p/timeout,
/// tools take enabled, nodes take timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl OverrideParams {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.temperature.is_none()
            && self.max_tokens.is_none()
            && self.top_p.is_none()
            && self.timeout_seconds.is_none()
            && self.enabled.is_none()
    }
}

/// A validated override at rest
#[derive(Debug, Clone, PartialEq)]
struct StoredOverride {
    params: OverrideParams,
    /// Set once ceiling validation passed; an invariant, kept for inspection
    ceiling_checked: bool,
}

type TargetKey = (TargetKind, String);
type ScopeMap = FxHashMap<TargetKey, StoredOverride>;

/// Fully resolved agent configuration after walking the scope chain
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub timeout_seconds: Option<u64>,
    pub system_prompt: Option<String>,
}

/// Layered override map owned by the engine
pub struct OverrideLayer {
    manifest: Arc<Manifest>,
    global: RwLock<ScopeMap>,
    project: RwLock<ScopeMap>,
    task: RwLock<FxHashMap<Arc<str>, ScopeMap>>,
}

impl OverrideLayer {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            global: RwLock::new(ScopeMap::default()),
            project: RwLock::new(ScopeMap::default()),
            task: RwLock::new(FxHashMap::default()),
        }
    }

    /// Validate and store an override. Invalid sets fail loudly.
    pub fn set(
        &self,
        scope: OverrideScope,
        kind: TargetKind,
        target_id: &str,
        params: OverrideParams,
    ) -> Result<()> {
        self.validate(kind, target_id, &params)?;

        let stored = StoredOverride {
            params,
            ceiling_checked: true,
        };
        let key = (kind, target_id.to_string());

        match scope {
            OverrideScope::Global => {
                self.global.write().insert(key, stored);
            }
            OverrideScope::Project => {
                self.project.write().insert(key, stored);
            }
            OverrideScope::Task(task_id) => {
                self.task.write().entry(task_id).or_default().insert(key, stored);
            }
        }
        Ok(())
    }

    /// Remove overrides in a scope; a target filter narrows the sweep.
    pub fn clear(&self, scope: OverrideScope, target: Option<(TargetKind, &str)>) {
        let clear_map = |map: &mut ScopeMap| match target {
            Some((kind, id)) => {
                map.remove(&(kind, id.to_string()));
            }
            None => map.clear(),
        };

        match scope {
            OverrideScope::Global => clear_map(&mut self.global.write()),
            OverrideScope::Project => clear_map(&mut self.project.write()),
            OverrideScope::Task(task_id) => {
                let mut tasks = self.task.write();
                if let Some(map) = tasks.get_mut(&task_id) {
                    clear_map(map);
                    if map.is_empty() {
                        tasks.remove(&task_id);
                    }
                }
            }
        }
    }

    /// Drop every task-scoped override of a terminal task
    pub fn expire_task(&self, task_id: &str) {
        self.task.write().remove(task_id);
    }

    /// Resolve an agent's effective configuration for a task
    pub fn resolve_agent(&self, task_id: &str, agent_id: &str) -> Result<ResolvedAgentConfig> {
        let spec = self
            .manifest
            .agents
            .get(agent_id)
            .ok_or_else(|| ArborError::OverrideUnknownTarget {
                target: format!("agent '{agent_id}'"),
            })?;

        let key = (TargetKind::Agent, agent_id.to_string());
        let chain = self.chain(task_id, &key);

        let mut resolved = ResolvedAgentConfig {
            model: spec.model.clone(),
            temperature: spec.temperature,
            max_tokens: spec.max_tokens,
            top_p: spec.top_p,
            timeout_seconds: spec.timeout_seconds,
            system_prompt: spec.system_prompt.clone(),
        };

        // Chain is task → project → global: the first Some per field wins.
        if let Some(v) = chain.iter().find_map(|l| l.model.clone()) {
            resolved.model = v;
        }
        if let Some(v) = chain.iter().find_map(|l| l.temperature) {
            resolved.temperature = v;
        }
        if let Some(v) = chain.iter().find_map(|l| l.max_tokens) {
            resolved.max_tokens = v;
        }
        if let Some(v) = chain.iter().find_map(|l| l.top_p) {
            resolved.top_p = v;
        }
        if let Some(v) = chain.iter().find_map(|l| l.timeout_seconds) {
            resolved.timeout_seconds = Some(v);
        }

        Ok(resolved)
    }

    /// Effective enabled flag for a tool. Overrides only ever disable.
    pub fn resolve_tool_enabled(&self, task_id: &str, tool_id: &str) -> bool {
        let manifest_enabled = self
            .manifest
            .tools
            .get(tool_id)
            .map(|t| t.enabled)
            .unwrap_or(false);
        if !manifest_enabled {
            return false;
        }

        let key = (TargetKind::Tool, tool_id.to_string());
        self.chain(task_id, &key)
            .iter()
            .find_map(|l| l.enabled)
            .unwrap_or(manifest_enabled)
    }

    /// Effective timeout override for a node, if any
    pub fn resolve_node_timeout(&self, task_id: &str, node_id: &str) -> Option<u64> {
        let key = (TargetKind::Node, node_id.to_string());
        self.chain(task_id, &key)
            .iter()
            .find_map(|l| l.timeout_seconds)
    }

    /// Collect the override chain for a target: task → project → global
    fn chain(&self, task_id: &str, key: &TargetKey) -> Vec<OverrideParams> {
        let mut chain = Vec::with_capacity(3);
        if let Some(map) = self.task.read().get(task_id) {
            if let Some(stored) = map.get(key) {
                chain.push(stored.params.clone());
            }
        }
        if let Some(stored) = self.project.read().get(key) {
            chain.push(stored.params.clone());
        }
        if let Some(stored) = self.global.read().get(key) {
            chain.push(stored.params.clone());
        }
        chain
    }

    fn validate(&self, kind: TargetKind, target_id: &str, params: &OverrideParams) -> Result<()> {
        match kind {
            TargetKind::Agent => {
                let spec = self.manifest.agents.get(target_id).ok_or_else(|| {
                    ArborError::OverrideUnknownTarget {
                        target: format!("agent '{target_id}'"),
                    }
                })?;

                if params.enabled.is_some() {
                    return Err(ArborError::OverrideRange {
                        parameter: "enabled".to_string(),
                        details: "not overridable for agents".to_string(),
                    });
                }

                if let Some(model) = &params.model {
                    let mut parts = model.splitn(2, '/');
                    let provider = parts.next().unwrap_or_default();
                    let name = parts.next().unwrap_or_default();
                    if provider.is_empty() || name.is_empty() {
                        return Err(ArborError::OverrideRange {
                            parameter: "model".to_string(),
                            details: format!("'{model}' must be 'provider/model'"),
                        });
                    }
                }

                if let Some(t) = params.temperature {
                    if !(0.0..=1.0).contains(&t) {
                        return Err(ArborError::OverrideRange {
                            parameter: "temperature".to_string(),
                            details: format!("{t} out of [0, 1]"),
                        });
                    }
                }

                if let Some(p) = params.top_p {
                    if !(0.0..=1.0).contains(&p) {
                        return Err(ArborError::OverrideRange {
                            parameter: "top_p".to_string(),
                            details: format!("{p} out of [0, 1]"),
                        });
                    }
                }

                if let Some(max_tokens) = params.max_tokens {
                    if max_tokens == 0 {
                        return Err(ArborError::OverrideRange {
                            parameter: "max_tokens".to_string(),
                            details: "must be at least 1".to_string(),
                        });
                    }
                    if let Some(ceiling) = spec.ceilings.max_tokens {
                        if max_tokens > ceiling {
                            return Err(ArborError::OverrideCeiling {
                                parameter: "max_tokens".to_string(),
                                value: max_tokens.to_string(),
                                ceiling: ceiling.to_string(),
                            });
                        }
                    }
                }

                if let Some(timeout) = params.timeout_seconds {
                    if timeout == 0 {
                        return Err(ArborError::OverrideRange {
                            parameter: "timeout_seconds".to_string(),
                            details: "must be positive".to_string(),
                        });
                    }
                    if let Some(ceiling) = spec.ceilings.timeout_seconds {
                        if timeout > ceiling {
                            return Err(ArborError::OverrideCeiling {
                                parameter: "timeout_seconds".to_string(),
                                value: timeout.to_string(),
                                ceiling: ceiling.to_string(),
                            });
                        }
                    }
                }
            }
            TargetKind::Tool => {
                let spec = self.manifest.tools.get(target_id).ok_or_else(|| {
                    ArborError::OverrideUnknownTarget {
                        target: format!("tool '{target_id}'"),
                    }
                })?;

                let only_enabled = params.model.is_none()
                    && params.temperature.is_none()
                    && params.max_tokens.is_none()
                    && params.top_p.is_none()
                    && params.timeout_seconds.is_none();
                if !only_enabled {
                    return Err(ArborError::OverrideRange {
                        parameter: "enabled".to_string(),
                        details: "tools only take the enabled flag".to_string(),
                    });
                }

                // Overrides may only disable, never grant, what the manifest refuses
                if params.enabled == Some(true) && !spec.enabled {
                    return Err(ArborError::OverrideEscalation {
                        tool: target_id.to_string(),
                    });
                }
            }
            TargetKind::Node => {
                if self.manifest.node_spec(target_id).is_none() {
                    return Err(ArborError::OverrideUnknownTarget {
                        target: format!("node '{target_id}'"),
                    });
                }

                let only_timeout = params.model.is_none()
                    && params.temperature.is_none()
                    && params.max_tokens.is_none()
                    && params.top_p.is_none()
                    && params.enabled.is_none();
                if !only_timeout {
                    return Err(ArborError::OverrideRange {
                        parameter: "timeout_seconds".to_string(),
                        details: "nodes only take timeout_seconds".to_string(),
                    });
                }

                if let Some(timeout) = params.timeout_seconds {
                    if timeout == 0 {
                        return Err(ArborError::OverrideRange {
                            parameter: "timeout_seconds".to_string(),
                            details: "must be positive".to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for OverrideLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverrideLayer")
            .field("global", &self.global.read().len())
            .field("project", &self.project.read().len())
            .field("tasks", &self.task.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn manifest() -> Arc<Manifest> {
        let yaml = r#"
schema: arbor/manifest@0.1
agents:
  writer:
    model: anthropic/claude-sonnet-4
    temperature: 0.7
    max_tokens: 1024
    ceilings:
      max_tokens: 2048
tools:
  search:
    enabled: true
  shell:
    enabled: false
workflow:
  nodes:
    - id: entry
      kind: deterministic
      role: start
    - id: gen
      kind: agent
      role: linear
      agent: writer
    - id: done
      kind: deterministic
      role: exit
  edges:
    - from: entry
      to: gen
    - from: gen
      to: done
"#;
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn layer() -> OverrideLayer {
        OverrideLayer::new(manifest())
    }

    fn agent_params(f: impl FnOnce(&mut OverrideParams)) -> OverrideParams {
        let mut p = OverrideParams::default();
        f(&mut p);
        p
    }

    #[test]
    fn precedence_task_over_project_over_global() {
        let layer = layer();
        let task_id: Arc<str> = "task-run-1".into();

        layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(0.1)),
            )
            .unwrap();
        layer
            .set(
                OverrideScope::Project,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(0.5)),
            )
            .unwrap();

        let resolved = layer.resolve_agent("task-run-1", "writer").unwrap();
        assert!((resolved.temperature - 0.5).abs() < f32::EPSILON);

        layer
            .set(
                OverrideScope::Task(Arc::clone(&task_id)),
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(0.9)),
            )
            .unwrap();

        let resolved = layer.resolve_agent("task-run-1", "writer").unwrap();
        assert!((resolved.temperature - 0.9).abs() < f32::EPSILON);

        // Other fields keep manifest defaults
        assert_eq!(resolved.model, "anthropic/claude-sonnet-4");
        assert_eq!(resolved.max_tokens, 1024);
    }

    #[test]
    fn ceiling_is_enforced_on_set() {
        let layer = layer();
        let err = layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.max_tokens = Some(4096)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-081");

        // At the ceiling is fine
        layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.max_tokens = Some(2048)),
            )
            .unwrap();
        assert_eq!(layer.resolve_agent("t", "writer").unwrap().max_tokens, 2048);
    }

    #[test]
    fn range_validation() {
        let layer = layer();
        assert!(layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(1.5)),
            )
            .is_err());
        assert!(layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.model = Some("nodash".to_string())),
            )
            .is_err());
        assert!(layer
            .set(
                OverrideScope::Global,
                TargetKind::Node,
                "gen",
                agent_params(|p| p.timeout_seconds = Some(0)),
            )
            .is_err());
    }

    #[test]
    fn unknown_target_rejected() {
        let layer = layer();
        let err = layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "ghost",
                agent_params(|p| p.temperature = Some(0.3)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-080");
    }

    #[test]
    fn tool_can_be_disabled_never_enabled() {
        let layer = layer();

        layer
            .set(
                OverrideScope::Project,
                TargetKind::Tool,
                "search",
                agent_params(|p| p.enabled = Some(false)),
            )
            .unwrap();
        assert!(!layer.resolve_tool_enabled("t", "search"));

        let err = layer
            .set(
                OverrideScope::Project,
                TargetKind::Tool,
                "shell",
                agent_params(|p| p.enabled = Some(true)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-083");

        // Manifest-disabled stays disabled regardless of overrides
        assert!(!layer.resolve_tool_enabled("t", "shell"));
    }

    #[test]
    fn closed_parameter_set_per_target_kind() {
        let layer = layer();
        // temperature on a node is rejected
        let err = layer
            .set(
                OverrideScope::Global,
                TargetKind::Node,
                "gen",
                agent_params(|p| p.temperature = Some(0.2)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-082");

        // model on a tool is rejected
        let err = layer
            .set(
                OverrideScope::Global,
                TargetKind::Tool,
                "search",
                agent_params(|p| p.model = Some("a/b".to_string())),
            )
            .unwrap_err();
        assert_eq!(err.code(), "ARBOR-082");
    }

    #[test]
    fn task_overrides_expire() {
        let layer = layer();
        let task_id: Arc<str> = "task-run-9".into();
        layer
            .set(
                OverrideScope::Task(Arc::clone(&task_id)),
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(0.9)),
            )
            .unwrap();

        layer.expire_task("task-run-9");
        let resolved = layer.resolve_agent("task-run-9", "writer").unwrap();
        assert!((resolved.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn clear_with_target_filter() {
        let layer = layer();
        layer
            .set(
                OverrideScope::Global,
                TargetKind::Agent,
                "writer",
                agent_params(|p| p.temperature = Some(0.2)),
            )
            .unwrap();
        layer
            .set(
                OverrideScope::Global,
                TargetKind::Node,
                "gen",
                agent_params(|p| p.timeout_seconds = Some(10)),
            )
            .unwrap();

        layer.clear(OverrideScope::Global, Some((TargetKind::Agent, "writer")));

        let resolved = layer.resolve_agent("t", "writer").unwrap();
        assert!((resolved.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(layer.resolve_node_timeout("t", "gen"), Some(10));
    }

    #[test]
    fn node_timeout_resolution() {
        let layer = layer();
        assert_eq!(layer.resolve_node_timeout("t", "gen"), None);
        layer
            .set(
                OverrideScope::Global,
                TargetKind::Node,
                "gen",
                agent_params(|p| p.timeout_seconds = Some(30)),
            )
            .unwrap();
        assert_eq!(layer.resolve_node_timeout("t", "gen"), Some(30));
    }
}
