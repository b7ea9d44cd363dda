//! Manifest Types - validated declarations the engine consumes
//!
//! The core treats a manifest as a single logical artifact: an engine is
//! rebuilt from scratch on any change. File loading belongs to the caller
//! (the CLI parses YAML); these structs are the contract.
//!
//! Key types:
//! - `Manifest`: Root declaration (workflow + agents + tools, optional rest)
//! - `NodeSpec` / `EdgeSpec`: The workflow graph as declared
//! - `AgentSpec` / `ToolSpec`: External collaborators by id
//! - `MergeSpec` / `SplitSpec` / `DecisionSpec`: Role-specific config

pub mod schema;

use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextProfile;
use crate::error::{ArborError, Result};

pub use schema::SchemaRegistry;

/// Expected schema version for v0.1 manifests
pub const SCHEMA_V01: &str = "arbor/manifest@0.1";

static NODE_ID_RE: OnceLock<Regex> = OnceLock::new();

/// Validate a node/agent/tool id: snake_case, starts with a letter
pub fn validate_id(id: &str) -> Result<()> {
    let re = NODE_ID_RE.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_]*$").expect("id pattern is valid")
    });
    if re.is_match(id) {
        Ok(())
    } else {
        Err(ArborError::ManifestParse {
            details: format!(
                "invalid id '{id}': must be snake_case (lowercase letters, digits, underscores)"
            ),
        })
    }
}

/// What a node is executed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A bound native function
    Deterministic,
    /// An LLM-backed agent
    Agent,
}

/// Structural role of a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Start,
    Linear,
    Decision,
    Branch,
    Split,
    Merge,
    Exit,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Linear => "linear",
            Self::Decision => "decision",
            Self::Branch => "branch",
            Self::Split => "split",
            Self::Merge => "merge",
            Self::Exit => "exit",
        }
    }
}

/// Context requirement of a node: nothing, the built-in default profile,
/// or a named profile from the manifest.
///
/// Serialized as a bare string: `none`, `global`, or a profile id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContextSpec {
    #[default]
    None,
    Global,
    Profile(String),
}

impl Serialize for ContextSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::None => serializer.serialize_str("none"),
            Self::Global => serializer.serialize_str("global"),
            Self::Profile(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for ContextSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "none" => Self::None,
            "global" => Self::Global,
            _ => Self::Profile(s),
        })
    }
}

/// How a merge node combines arrivals into one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergePolicy {
    Builtin(BuiltinMergePolicy),
    /// A named reducer bound at runtime via `Engine::bind_reducer`
    Reducer { reducer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinMergePolicy {
    /// All arrivals, in manifest edge order
    CollectAll,
    /// The first arrival that succeeded
    FirstSuccess,
}

/// Merge node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub policy: MergePolicy,
    /// Barrier ceiling; engine default applies when absent
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Split node configuration
///
/// `slices[i]` is a JSON pointer into the parent output selecting the input
/// of the subtask spawned on the i-th outbound edge. An empty pointer (or a
/// missing entry) passes the whole parent output through (identity).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SplitSpec {
    #[serde(default)]
    pub slices: Option<Vec<String>>,
}

/// How a decision node matches its routing key against edge labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Equality,
    Substring,
}

/// Decision node configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecisionSpec {
    #[serde(rename = "match", default)]
    pub match_mode: MatchMode,
}

/// A node as declared in the manifest. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub kind: NodeKind,
    pub role: Role,
    /// Agent id for `kind: agent` nodes
    #[serde(default)]
    pub agent: Option<String>,
    /// Bound-operation id for `kind: deterministic` nodes
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub schema_in: Option<String>,
    #[serde(default)]
    pub schema_out: Option<String>,
    #[serde(default)]
    pub context: ContextSpec,
    /// Tool ids this node's agent may call
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub default_start: bool,
    #[serde(default)]
    pub merge: Option<MergeSpec>,
    #[serde(default)]
    pub split: Option<SplitSpec>,
    #[serde(default)]
    pub decision: Option<DecisionSpec>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// A directed edge. Declaration order is load-bearing: it is the tie-break
/// for every routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// The workflow graph as declared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Ceilings the manifest declares for an agent; overrides never exceed them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCeilings {
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// An LLM-backed agent declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Opaque `provider/model` identifier handed to the adapter
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub ceilings: AgentCeilings,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    1.0
}

/// Permission set a tool invocation runs under.
///
/// The engine refuses calls whose implementation requires a capability the
/// grant lacks; the grant is then handed into the invocation so the tool
/// enforces the boundary on the operations it performs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPermissions {
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allow_shell: bool,
    /// Filesystem scoping root for tools that touch disk
    #[serde(default)]
    pub root_path: Option<String>,
}

impl ToolPermissions {
    /// Check a candidate path stays inside the declared filesystem root.
    ///
    /// Paths with parent-dir components are rejected outright; without a
    /// declared root nothing on disk is reachable.
    pub fn path_in_root(&self, path: &std::path::Path) -> bool {
        let Some(root) = &self.root_path else {
            return false;
        };
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return false;
        }
        path.starts_with(root)
    }
}

/// A tool declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schema_in: Option<String>,
    #[serde(default)]
    pub schema_out: Option<String>,
    #[serde(default)]
    pub permissions: ToolPermissions,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Which backend the long-lived memory tiers use
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum MemoryBackend {
    #[default]
    InMemory,
    /// One JSON record per line, flushed before `add` acknowledges
    AppendFile { path: String },
}

/// Memory tier configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySpec {
    #[serde(default)]
    pub backend: MemoryBackend,
    /// Count bound for the project tier; engine default applies when absent
    #[serde(default)]
    pub project_max_items: Option<usize>,
    /// Kinds whose global-tier writes require the confirmation hook
    #[serde(default)]
    pub confirm_kinds: Vec<String>,
}

/// Queue policy for top-level tasks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerSpec {
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default)]
    pub default_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub merge_timeout_seconds: Option<u64>,
}

/// A declared plugin slot. Only declared plugins with sinks the CLI knows
/// (currently `trace`) are attached automatically; everything else is
/// subscribed programmatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Credential declarations are metadata-only: the core never sees secret
/// material, only the provider name an adapter should resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSpec {
    pub provider: String,
}

/// Root manifest. Workflow, agents and tools are required surface; memory,
/// plugins, scheduler, profiles, schemas and credentials are optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema: String,
    pub workflow: WorkflowSpec,
    #[serde(default)]
    pub agents: FxHashMap<String, AgentSpec>,
    #[serde(default)]
    pub tools: FxHashMap<String, ToolSpec>,
    /// JSON Schemas by id, referenced from node/tool `schema_in`/`schema_out`
    #[serde(default)]
    pub schemas: FxHashMap<String, Value>,
    #[serde(default)]
    pub profiles: FxHashMap<String, ContextProfile>,
    #[serde(default)]
    pub memory: Option<MemorySpec>,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
    #[serde(default)]
    pub scheduler: Option<SchedulerSpec>,
    #[serde(default)]
    pub credentials: FxHashMap<String, CredentialSpec>,
}

impl Manifest {
    /// Validate the manifest schema version
    pub fn validate_schema_version(&self) -> Result<()> {
        if self.schema != SCHEMA_V01 {
            return Err(ArborError::InvalidSchemaVersion {
                expected: SCHEMA_V01.to_string(),
                actual: self.schema.clone(),
            });
        }
        Ok(())
    }

    /// Compute an identity hash of the manifest.
    ///
    /// Uses xxhash3 over the declaration surface that affects execution:
    /// schema version, node ids/roles, edge list in order, agent and tool
    /// ids. Checkpoints record this hash and refuse to restore across it.
    pub fn compute_hash(&self) -> String {
        use xxhash_rust::xxh3::xxh3_64;

        let mut input = String::new();
        input.push_str(&self.schema);
        for node in &self.workflow.nodes {
            input.push_str(&node.id);
            input.push(':');
            input.push_str(node.role.as_str());
            input.push(';');
        }
        for edge in &self.workflow.edges {
            input.push_str(&edge.from);
            input.push_str("->");
            input.push_str(&edge.to);
            if let Some(label) = &edge.label {
                input.push('[');
                input.push_str(label);
                input.push(']');
            }
            input.push(';');
        }
        let mut agent_ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        agent_ids.sort_unstable();
        for id in agent_ids {
            input.push_str(id);
            input.push(',');
        }
        let mut tool_ids: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        tool_ids.sort_unstable();
        for id in tool_ids {
            input.push_str(id);
            input.push(',');
        }

        format!("{:016x}", xxh3_64(input.as_bytes()))
    }

    /// Look up a node declaration by id
    pub fn node_spec(&self, id: &str) -> Option<&NodeSpec> {
        self.workflow.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
schema: arbor/manifest@0.1
workflow:
  nodes:
    - id: entry
      kind: deterministic
      role: start
    - id: done
      kind: deterministic
      role: exit
  edges:
    - from: entry
      to: done
"#
    }

    #[test]
    fn parse_minimal_manifest() {
        let manifest: Manifest = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(manifest.validate_schema_version().is_ok());
        assert_eq!(manifest.workflow.nodes.len(), 2);
        assert_eq!(manifest.workflow.edges.len(), 1);
        assert_eq!(manifest.workflow.nodes[0].role, Role::Start);
        assert_eq!(manifest.workflow.nodes[0].context, ContextSpec::None);
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let yaml = minimal_yaml().replace("arbor/manifest@0.1", "arbor/manifest@9.9");
        let manifest: Manifest = serde_yaml::from_str(&yaml).unwrap();
        let err = manifest.validate_schema_version().unwrap_err();
        assert!(err.to_string().contains("ARBOR-002"));
    }

    #[test]
    fn context_spec_parses_all_forms() {
        let yaml = r#"
schema: arbor/manifest@0.1
workflow:
  nodes:
    - id: a
      kind: agent
      role: start
      agent: writer
      context: global
    - id: b
      kind: agent
      role: linear
      agent: writer
      context: research
    - id: c
      kind: deterministic
      role: exit
      context: none
  edges:
    - from: a
      to: b
    - from: b
      to: c
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.workflow.nodes[0].context, ContextSpec::Global);
        assert_eq!(
            manifest.workflow.nodes[1].context,
            ContextSpec::Profile("research".to_string())
        );
        assert_eq!(manifest.workflow.nodes[2].context, ContextSpec::None);
    }

    #[test]
    fn merge_policy_parses_builtin_and_reducer() {
        let collect: MergeSpec = serde_yaml::from_str("policy: collect_all").unwrap();
        assert_eq!(
            collect.policy,
            MergePolicy::Builtin(BuiltinMergePolicy::CollectAll)
        );

        let reducer: MergeSpec = serde_yaml::from_str("policy:\n  reducer: join_lines").unwrap();
        assert_eq!(
            reducer.policy,
            MergePolicy::Reducer {
                reducer: "join_lines".to_string()
            }
        );
    }

    #[test]
    fn agent_spec_fills_defaults() {
        let agent: AgentSpec = serde_yaml::from_str("model: anthropic/claude-sonnet-4").unwrap();
        assert!((agent.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(agent.max_tokens, 1024);
        assert!(agent.ceilings.max_tokens.is_none());
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("fetch_data").is_ok());
        assert!(validate_id("step2").is_ok());
        assert!(validate_id("Fetch").is_err());
        assert!(validate_id("fetch-data").is_err());
        assert!(validate_id("2step").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn hash_is_stable_and_sensitive() {
        let a: Manifest = serde_yaml::from_str(minimal_yaml()).unwrap();
        let b: Manifest = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(a.compute_hash(), b.compute_hash());

        let yaml = minimal_yaml().replace("id: done", "id: finish");
        let yaml = yaml.replace("to: done", "to: finish");
        let c: Manifest = serde_yaml::from_str(&yaml).unwrap();
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn path_in_root_scopes_to_declared_root() {
        use std::path::Path;

        let scoped = ToolPermissions {
            root_path: Some("/srv/workspace".to_string()),
            ..Default::default()
        };
        assert!(scoped.path_in_root(Path::new("/srv/workspace/notes.txt")));
        assert!(scoped.path_in_root(Path::new("/srv/workspace/sub/deep.rs")));
        assert!(!scoped.path_in_root(Path::new("/etc/passwd")));
        assert!(!scoped.path_in_root(Path::new("/srv/workspace/../secrets")));

        let unscoped = ToolPermissions::default();
        assert!(!unscoped.path_in_root(Path::new("/srv/workspace/notes.txt")));
    }

    #[test]
    fn decision_match_mode_defaults_to_equality() {
        let spec: DecisionSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.match_mode, MatchMode::Equality);

        let spec: DecisionSpec = serde_yaml::from_str("match: substring").unwrap();
        assert_eq!(spec.match_mode, MatchMode::Substring);
    }
}
