//! Capability "interfaces" between the web layer and the pipeline.

use crate::core::pipeline::{GeneratedText, GenerationParams};
use async_trait::async_trait;
use thiserror::Error;

/// A fault raised while invoking the generation capability.
///
/// These never escape the query path as process faults; [`QueryService::reply`]
/// collapses them into a display string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationFault {
    /// The prompt alone does not fit the model's context window.
    #[error("prompt is too long: {tokens} tokens, limit is {limit}")]
    PromptTooLong { tokens: usize, limit: usize },

    /// The pipeline answered with zero generated sequences.
    #[error("no sequences were generated")]
    EmptyOutput,

    /// Anything that went wrong inside the inference backend.
    #[error("{0}")]
    Backend(String),

    /// The pipeline task is gone, so requests can no longer be served.
    #[error("generation worker is not running")]
    WorkerUnavailable,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Runs one generation call against the model.
    ///
    /// Returns one record per requested sequence. The record text keeps the
    /// prompt echo as a prefix.
    async fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<Vec<GeneratedText>, GenerationFault>;
}

#[async_trait]
pub trait QueryService: Send + Sync {
    /// Bridges one user query to one model response.
    ///
    /// Returns `Err` with the fault that interrupted generation; callers that
    /// only need display text should use [`QueryService::reply`].
    async fn answer(&self, input: &str) -> Result<String, GenerationFault>;

    /// Display form of [`QueryService::answer`]: the generated text, or the
    /// fault rendered as `Error: <description>`.
    async fn reply(&self, input: &str) -> String {
        match self.answer(input).await {
            Ok(text) => text,
            Err(fault) => format!("Error: {fault}"),
        }
    }
}
