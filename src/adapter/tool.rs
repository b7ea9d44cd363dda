//! Tool adapters - structured in, structured out, under a declared grant
//!
//! A tool is a function `(inputs) -> (output | error)` declared in the
//! manifest with IO schemas and a permission set. Every invocation receives
//! the manifest-declared `ToolPermissions`: the engine refuses calls whose
//! implementation requires a capability the grant lacks, and the tool
//! enforces the boundary (network endpoints, shell commands, filesystem
//! root) on the operations it actually performs.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::manifest::ToolPermissions;

/// What a tool implementation needs to do its job.
///
/// Checked against the manifest grant before every call; a missing
/// capability is a policy refusal, never a runtime surprise inside the
/// tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolCapabilities {
    pub network: bool,
    pub shell: bool,
    /// Touches disk; requires a declared scoping root
    pub filesystem: bool,
}

impl ToolCapabilities {
    pub fn network() -> Self {
        Self {
            network: true,
            ..Default::default()
        }
    }

    pub fn shell() -> Self {
        Self {
            shell: true,
            ..Default::default()
        }
    }

    pub fn filesystem() -> Self {
        Self {
            filesystem: true,
            ..Default::default()
        }
    }

    /// Check every required capability against the declared grant
    pub fn check(&self, grant: &ToolPermissions) -> std::result::Result<(), String> {
        if self.network && !grant.allow_network {
            return Err("network access not granted".to_string());
        }
        if self.shell && !grant.allow_shell {
            return Err("shell access not granted".to_string());
        }
        if self.filesystem && grant.root_path.is_none() {
            return Err("no filesystem root declared".to_string());
        }
        Ok(())
    }
}

/// One tool implementation behind the narrow invoke interface
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Capabilities this implementation needs; the engine checks them
    /// against the manifest grant before dispatch. Pure tools need nothing.
    fn requires(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }

    /// Run the tool under the declared grant
    async fn invoke(&self, inputs: &Value, permissions: &ToolPermissions)
        -> anyhow::Result<Value>;
}

/// Bound tool implementations keyed by manifest tool id
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn ToolAdapter>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, id: impl Into<String>, adapter: Arc<dyn ToolAdapter>) {
        self.tools.insert(id.into(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.tools.get(id).map(|t| Arc::clone(t.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("bound", &self.tools.len())
            .finish()
    }
}

type BoxedToolFn =
    Box<dyn Fn(&Value, &ToolPermissions) -> anyhow::Result<Value> + Send + Sync>;

/// Wrap a plain closure as a tool; the workhorse for tests and built-ins
pub struct FnTool {
    requires: ToolCapabilities,
    f: BoxedToolFn,
}

impl FnTool {
    /// A pure tool: no capabilities, the grant is irrelevant
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            requires: ToolCapabilities::default(),
            f: Box::new(move |inputs, _permissions| f(inputs)),
        })
    }

    /// A capability-bearing tool: sees the grant it was invoked under
    pub fn requiring<F>(requires: ToolCapabilities, f: F) -> Arc<Self>
    where
        F: Fn(&Value, &ToolPermissions) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Arc::new(Self {
            requires,
            f: Box::new(f),
        })
    }
}

#[async_trait]
impl ToolAdapter for FnTool {
    fn requires(&self) -> ToolCapabilities {
        self.requires
    }

    async fn invoke(
        &self,
        inputs: &Value,
        permissions: &ToolPermissions,
    ) -> anyhow::Result<Value> {
        (self.f)(inputs, permissions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(network: bool, shell: bool, root: Option<&str>) -> ToolPermissions {
        ToolPermissions {
            allow_network: network,
            allow_shell: shell,
            root_path: root.map(String::from),
        }
    }

    #[tokio::test]
    async fn fn_tool_roundtrip() {
        let registry = ToolRegistry::new();
        registry.bind(
            "upper",
            FnTool::new(|inputs| {
                let text = inputs["text"].as_str().unwrap_or_default();
                Ok(json!({"text": text.to_uppercase()}))
            }),
        );

        let tool = registry.get("upper").unwrap();
        let out = tool
            .invoke(&json!({"text": "hi"}), &ToolPermissions::default())
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "HI"}));
    }

    #[tokio::test]
    async fn tool_error_propagates() {
        let tool = FnTool::new(|_| anyhow::bail!("disk on fire"));
        let err = tool
            .invoke(&json!({}), &ToolPermissions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn registry_lookup_misses() {
        let registry = ToolRegistry::new();
        assert!(registry.get("ghost").is_none());
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn capabilities_check_against_grant() {
        assert!(ToolCapabilities::default()
            .check(&ToolPermissions::default())
            .is_ok());

        let err = ToolCapabilities::network()
            .check(&grant(false, false, None))
            .unwrap_err();
        assert!(err.contains("network"));
        assert!(ToolCapabilities::network()
            .check(&grant(true, false, None))
            .is_ok());

        let err = ToolCapabilities::shell()
            .check(&grant(true, false, None))
            .unwrap_err();
        assert!(err.contains("shell"));

        let err = ToolCapabilities::filesystem()
            .check(&grant(false, false, None))
            .unwrap_err();
        assert!(err.contains("filesystem root"));
        assert!(ToolCapabilities::filesystem()
            .check(&grant(false, false, Some("/srv/workspace")))
            .is_ok());
    }

    #[tokio::test]
    async fn requiring_tool_sees_the_grant() {
        let tool = FnTool::requiring(ToolCapabilities::filesystem(), |inputs, permissions| {
            let path = std::path::Path::new(inputs["path"].as_str().unwrap_or_default());
            if !permissions.path_in_root(path) {
                anyhow::bail!("path escapes the declared root");
            }
            Ok(json!({"read": path.display().to_string()}))
        });
        assert_eq!(tool.requires(), ToolCapabilities::filesystem());

        let scoped = grant(false, false, Some("/srv/workspace"));
        let ok = tool
            .invoke(&json!({"path": "/srv/workspace/a.txt"}), &scoped)
            .await
            .unwrap();
        assert_eq!(ok, json!({"read": "/srv/workspace/a.txt"}));

        let err = tool
            .invoke(&json!({"path": "/etc/passwd"}), &scoped)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }
}
