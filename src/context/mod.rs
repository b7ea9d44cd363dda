//! Context Module - token-budgeted, profile-driven assembly
//!
//! Key types:
//! - `ContextProfile`: Declared assembly policy (weights, kinds, pinning)
//! - `ContextPackage`: The materialized context for one node invocation
//! - `ContextFingerprint`: Hashed summary recorded for telemetry
//!
//! The assembly itself is one pure function in [`assembler`].

mod assembler;

use serde::{Deserialize, Serialize};

use crate::util::constants::DEFAULT_CONTEXT_BUDGET;

pub use crate::memory::ContextItem;
pub use assembler::assemble;

/// Per-tier budget weights; must sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierWeights {
    pub task: f32,
    pub project: f32,
    pub global: f32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            task: 0.5,
            project: 0.3,
            global: 0.2,
        }
    }
}

impl TierWeights {
    pub fn sum(&self) -> f32 {
        self.task + self.project + self.global
    }
}

/// Declared assembly policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextProfile {
    /// Token budget for the whole package
    #[serde(default = "default_budget")]
    pub budget: u32,
    #[serde(default)]
    pub tier_weights: TierWeights,
    /// Only these kinds are considered when non-empty
    #[serde(default)]
    pub preferred_kinds: Vec<String>,
    #[serde(default)]
    pub excluded_kinds: Vec<String>,
    #[serde(default)]
    pub min_importance: f32,
    /// Top-N by importance pinned regardless of tier share
    #[serde(default)]
    pub head_preserve: usize,
    /// Most-recent-N pinned regardless of tier share
    #[serde(default)]
    pub tail_preserve: usize,
    /// Compression allowance in [0, 1]; recorded, never enforced by the core
    #[serde(default = "default_compression")]
    pub compression: f32,
}

fn default_budget() -> u32 {
    DEFAULT_CONTEXT_BUDGET
}

fn default_compression() -> f32 {
    1.0
}

impl Default for ContextProfile {
    fn default() -> Self {
        Self {
            budget: DEFAULT_CONTEXT_BUDGET,
            tier_weights: TierWeights::default(),
            preferred_kinds: Vec::new(),
            excluded_kinds: Vec::new(),
            min_importance: 0.0,
            head_preserve: 1,
            tail_preserve: 1,
            compression: 1.0,
        }
    }
}

impl ContextProfile {
    /// The built-in profile used for `context: global` nodes
    pub fn default_global() -> Self {
        Self::default()
    }

    /// Structural validity; the manifest validator surfaces the message
    pub fn validate(&self) -> std::result::Result<(), String> {
        if (self.tier_weights.sum() - 1.0).abs() > 1e-3 {
            return Err(format!(
                "tier weights sum to {}, expected 1.0",
                self.tier_weights.sum()
            ));
        }
        if !(0.0..=1.0).contains(&self.min_importance) {
            return Err(format!(
                "min_importance {} out of [0, 1]",
                self.min_importance
            ));
        }
        if !(0.0..=1.0).contains(&self.compression) {
            return Err(format!("compression {} out of [0, 1]", self.compression));
        }
        if self.budget == 0 {
            return Err("budget must be positive".to_string());
        }
        Ok(())
    }
}

/// Hashed summary of one assembly, stable across identical inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFingerprint {
    /// sha256 over mode, sorted sources, profile id, sorted tier counts
    pub hash: String,
    /// Selected items per tier in task/project/global order
    pub tier_counts: [usize; 3],
}

/// The materialized context for one node invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPackage {
    /// Selected items in tier order task → project → global
    pub items: Vec<ContextItem>,
    pub total_tokens: u32,
    /// selected cost / available cost (1.0 when nothing was available)
    pub compression_ratio: f32,
    pub fingerprint: ContextFingerprint,
}

impl ContextPackage {
    /// The empty package used for `context: none` nodes
    pub fn empty(mode: &str) -> Self {
        Self {
            items: Vec::new(),
            total_tokens: 0,
            compression_ratio: 1.0,
            fingerprint: assembler::fingerprint(mode, &[], "none", [0, 0, 0]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
