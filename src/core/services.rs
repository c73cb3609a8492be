//! Implementations for the services the app needs.
//!

use crate::core::pipeline::{GeneratedText, GenerationParams, GenerationRequest};
use crate::core::traits::{GenerationFault, QueryService, TextGenerator};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum total length (prompt plus completion, in tokens) for one query.
const QUERY_MAX_LENGTH: usize = 150;

/// [`TextGenerator`] backed by the pipeline task's request channel.
pub struct ChannelTextGenerator {
    sender: mpsc::Sender<GenerationRequest>,
}

impl ChannelTextGenerator {
    pub fn new(sender: mpsc::Sender<GenerationRequest>) -> ChannelTextGenerator {
        ChannelTextGenerator { sender }
    }
}

#[async_trait]
impl TextGenerator for ChannelTextGenerator {
    async fn generate(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<Vec<GeneratedText>, GenerationFault> {
        let (request, receiver) = GenerationRequest::new(prompt.to_owned(), params);

        self.sender
            .send(request)
            .await
            .map_err(|_| GenerationFault::WorkerUnavailable)?;

        receiver
            .await
            .map_err(|_| GenerationFault::WorkerUnavailable)?
    }
}

/// The query handler: one user query in, one model reply out.
pub struct PlaygroundQueryService {
    generator: Arc<dyn TextGenerator>,
}

impl PlaygroundQueryService {
    pub fn new(generator: Arc<dyn TextGenerator>) -> PlaygroundQueryService {
        PlaygroundQueryService { generator }
    }
}

#[async_trait]
impl QueryService for PlaygroundQueryService {
    async fn answer(&self, input: &str) -> Result<String, GenerationFault> {
        let records = self
            .generator
            .generate(
                input,
                GenerationParams {
                    max_length: QUERY_MAX_LENGTH,
                    num_return_sequences: 1,
                },
            )
            .await?;

        let first = records.into_iter().next().ok_or(GenerationFault::EmptyOutput)?;

        Ok(first.generated_text)
    }
}
