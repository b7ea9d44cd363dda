//! Adapter Module - the narrow interfaces to external collaborators
//!
//! The core neither opens sockets nor launches processes. LLM providers and
//! tools live behind these traits; errors inside an adapter surface as
//! opaque `anyhow::Error` and are wrapped into the taxonomy at the boundary.

mod tool;

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

pub use tool::{FnTool, ToolAdapter, ToolCapabilities, ToolRegistry};

/// Resolved generation hyperparameters handed to the adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

/// LLM provider abstraction.
///
/// The core treats `model` as an opaque `provider/model` identifier;
/// authentication and transport belong to the implementation.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &Hyperparameters,
    ) -> anyhow::Result<String>;
}

/// Scripted adapter for tests and dry runs.
///
/// Replays a fixed sequence of responses (falling back to the last one) and
/// records every prompt it saw.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    /// Always answer with the same text
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: Some(response.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer with each response in turn, then keep repeating the last
    pub fn sequence(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let queue: VecDeque<String> = responses.into_iter().map(Into::into).collect();
        let fallback = queue.back().cloned();
        Self {
            responses: Mutex::new(queue),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts observed so far, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        _params: &Hyperparameters,
    ) -> anyhow::Result<String> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(next) = self.responses.lock().pop_front() {
            return Ok(next);
        }
        self.fallback
            .clone()
            .ok_or_else(|| anyhow::anyhow!("scripted adapter exhausted"))
    }
}

/// Adapter that always fails; exercises the `agent` error path
pub struct FailingLlm;

#[async_trait]
impl LlmAdapter for FailingLlm {
    async fn generate(
        &self,
        _model: &str,
        _prompt: &str,
        _params: &Hyperparameters,
    ) -> anyhow::Result<String> {
        anyhow::bail!("upstream unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Hyperparameters {
        Hyperparameters {
            temperature: 0.7,
            max_tokens: 256,
            top_p: 1.0,
        }
    }

    #[tokio::test]
    async fn scripted_always_repeats() {
        let llm = ScriptedLlm::always("hello");
        assert_eq!(llm.generate("x/y", "a", &params()).await.unwrap(), "hello");
        assert_eq!(llm.generate("x/y", "b", &params()).await.unwrap(), "hello");
        assert_eq!(llm.prompts(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn scripted_sequence_then_fallback() {
        let llm = ScriptedLlm::sequence(["one", "two"]);
        assert_eq!(llm.generate("x/y", "p", &params()).await.unwrap(), "one");
        assert_eq!(llm.generate("x/y", "p", &params()).await.unwrap(), "two");
        assert_eq!(llm.generate("x/y", "p", &params()).await.unwrap(), "two");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn failing_adapter_errors() {
        let llm = FailingLlm;
        assert!(llm.generate("x/y", "p", &params()).await.is_err());
    }
}
