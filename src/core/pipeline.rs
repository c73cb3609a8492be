//! Text-generation pipeline service.
//!

use crate::core::traits::GenerationFault;
use log::{debug, error, info};
use nalgebra::DVector;
use std::str::FromStr;
use tokio::fs::File;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use wgcore::gpu::GpuInstance;
use wgcore::kernel::CommandEncoderExt;
use wgcore::shapes::ViewShapeBuffers;
use wgml::gguf::Gguf;
use wgml::models::gpt2::Gpt2Tokenizer;
use wgml::models::llama2::cpu::Llama2Config;
use wgml::models::llama2::{Llama2, Llama2State, Llama2Weights, LlamaModelType};
use wgml::models::sampler::Sampler;

pub const DEFAULT_MODEL_FILE: &str = "models/Llama-3.2-3B-Instruct-Q4_K_M.gguf";
pub const DEFAULT_CONTEXT_SIZE: usize = 32_768;

/// Maximum total length (prompt plus completion, in tokens) when the caller
/// does not ask for anything shorter.
pub const DEFAULT_MAX_LENGTH: usize = 200;

pub type GenerationOutcome = Result<Vec<GeneratedText>, GenerationFault>;

/// Startup-time pipeline settings.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_file: String,
    pub context_size: usize,
}

impl ModelConfig {
    /// Reads `MODEL_FILE_NAME` and `CONTEXT_SIZE`, falling back to the
    /// compiled-in defaults.
    pub fn from_env() -> ModelConfig {
        let model_file =
            std::env::var("MODEL_FILE_NAME").unwrap_or_else(|_| DEFAULT_MODEL_FILE.to_owned());
        let context_size = std::env::var("CONTEXT_SIZE")
            .ok()
            .and_then(|s| usize::from_str(&s).ok())
            .unwrap_or(DEFAULT_CONTEXT_SIZE);

        ModelConfig {
            model_file,
            context_size,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            model_file: DEFAULT_MODEL_FILE.to_owned(),
            context_size: DEFAULT_CONTEXT_SIZE,
        }
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    /// Upper bound on prompt plus completion, in tokens. Clamped to the
    /// model's context length.
    pub max_length: usize,
    pub num_return_sequences: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationParams {
            max_length: DEFAULT_MAX_LENGTH,
            num_return_sequences: 1,
        }
    }
}

/// One generated sequence. The text starts with an echo of the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedText {
    pub generated_text: String,
}

/// A single query handed to the pipeline task, with a channel for the result.
pub struct GenerationRequest {
    prompt: String,
    params: GenerationParams,
    reply: oneshot::Sender<GenerationOutcome>,
}

impl GenerationRequest {
    pub fn new(
        prompt: String,
        params: GenerationParams,
    ) -> (GenerationRequest, oneshot::Receiver<GenerationOutcome>) {
        let (sender, receiver) = oneshot::channel();

        (
            GenerationRequest {
                prompt,
                params,
                reply: sender,
            },
            receiver,
        )
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Sends the outcome back to the requester. The requester may have hung
    /// up in the meantime; that is its problem.
    pub fn respond(self, outcome: GenerationOutcome) {
        let _ = self.reply.send(outcome);
    }
}

/// The loaded model and everything needed to run it.
///
/// Owned by [`background_task`] for the lifetime of the process.
pub struct LoadedModel {
    gpu: GpuInstance,
    transformer: Llama2,
    config: Llama2Config,
    weights: Llama2Weights,
    state: Llama2State,
    tokenizer: Gpt2Tokenizer,
    view_shapes: ViewShapeBuffers,
}

impl LoadedModel {
    /// Loads the GGUF file and builds the GPU-side model.
    ///
    /// Any failure here is fatal: there is no way to serve queries without a
    /// model, so the task panics and takes the process down with it.
    pub async fn load(config: &ModelConfig) -> LoadedModel {
        info!("Loading model: {}", config.model_file);

        let gguf_file = File::open(&config.model_file)
            .await
            .expect("failed to open model file");
        let gguf_start_time = Instant::now();
        let gguf_mmap = unsafe { memmap2::Mmap::map(&gguf_file) }.expect("failed to map file");
        let gguf = Gguf::from_bytes(&gguf_mmap[..]).expect("bad gguf");
        info!(
            "GGUF model loaded in {:.2} seconds.",
            gguf_start_time.elapsed().as_secs_f32()
        );

        let gpu = GpuInstance::new().await.expect("failed to create GPU");
        let device = gpu.device();
        info!("GPU device created.");
        debug!("GPU device features: {:?}", device.features());

        let transformer =
            Llama2::new(device, LlamaModelType::Llama).expect("failed to create LlamaModel");

        let mut model_config = Llama2Config::from_gguf(&gguf);
        model_config.seq_len = model_config.seq_len.min(config.context_size);
        let weights = Llama2Weights::from_gguf(device, &model_config, &gguf);
        let tokenizer = Gpt2Tokenizer::from_gguf(&gguf);
        let state = Llama2State::new(device, &model_config);

        LoadedModel {
            gpu,
            transformer,
            config: model_config,
            weights,
            state,
            tokenizer,
            view_shapes: ViewShapeBuffers::new(),
        }
    }

    /// Runs one generation call: `num_return_sequences` completions of the
    /// given prompt, each bounded by `max_length` total tokens.
    pub async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> GenerationOutcome {
        let mut prompt_tokens = self.tokenizer.encode(prompt);
        if prompt_tokens.is_empty() {
            // An empty query still needs a token to continue from.
            prompt_tokens.push(self.tokenizer.bos());
        }

        let limit = params.max_length.min(self.config.seq_len);
        if prompt_tokens.len() >= limit {
            return Err(GenerationFault::PromptTooLong {
                tokens: prompt_tokens.len(),
                limit,
            });
        }

        let mut records = Vec::with_capacity(params.num_return_sequences);
        for _ in 0..params.num_return_sequences.max(1) {
            let completion = self.generate_sequence(&prompt_tokens, limit).await?;
            records.push(GeneratedText {
                // The prompt echo is kept as-is, matching what callers typed.
                generated_text: format!("{prompt}{completion}"),
            });
        }

        Ok(records)
    }

    /// One full prefill-then-sample run over the transformer.
    async fn generate_sequence(
        &self,
        prompt_tokens: &[usize],
        limit: usize,
    ) -> Result<String, GenerationFault> {
        let gpu = &self.gpu;
        let config = &self.config;
        let state = &self.state;

        let mut token = prompt_tokens[0];
        let mut logits = DVector::zeros(config.vocab_size);
        self.view_shapes.clear_tmp();

        let inference_start = Instant::now();
        let mut completion = String::new();
        let mut total_generated = 0;

        for pos in 0..limit {
            let is_prefill = pos < prompt_tokens.len() - 1;

            let (rope_config, rms_norm_config, attn_params) =
                config.derived_configs(pos as u32);

            let mut encoder = gpu.device().create_command_encoder(&Default::default());
            gpu.queue().write_buffer(
                state.rope_config().buffer(),
                0,
                bytemuck::cast_slice(&[rope_config]),
            );
            gpu.queue().write_buffer(
                state.rms_norm_config().buffer(),
                0,
                bytemuck::cast_slice(&[rms_norm_config]),
            );
            gpu.queue().write_buffer(
                state.attn_params().buffer(),
                0,
                bytemuck::cast_slice(&[attn_params]),
            );

            // Token embeddings are stored as two half-vocab column blocks.
            if token < (config.vocab_size / 2) {
                state.x.copy_from_view(
                    &mut encoder,
                    self.weights.token_embd.column(token as u32),
                );
            } else {
                state.x.copy_from_view(
                    &mut encoder,
                    self.weights
                        .token_embd
                        .column((token - config.vocab_size / 2) as u32),
                );
            }

            let mut compute_pass = encoder.compute_pass("transformer", None);
            self.transformer.dispatch(
                gpu.device(),
                &self.view_shapes,
                gpu.queue(),
                &mut compute_pass,
                state,
                &self.weights,
                config,
                &attn_params,
                pos as u32,
            );
            drop(compute_pass);

            if is_prefill {
                gpu.queue().submit(Some(encoder.finish()));
                token = prompt_tokens[pos + 1];
                continue;
            }

            state
                .logits_readback()
                .copy_from(&mut encoder, state.logits());
            gpu.queue().submit(Some(encoder.finish()));
            state
                .logits_readback()
                .read_to(gpu.device(), logits.as_mut_slice())
                .await
                .map_err(|e| GenerationFault::Backend(format!("logits readback failed: {e:?}")))?;

            let mut sampler = Sampler::new(logits.len(), 0.9, 0.95);
            let next_token = sampler.sample(&mut logits);

            if next_token == self.tokenizer.eos() {
                break;
            }

            completion.push_str(&self.tokenizer.decode(&[next_token as u32]));
            token = next_token;
            total_generated += 1;
        }

        info!(
            "Generated {} tokens in {:.2}s ({} prompt tokens).",
            total_generated,
            inference_start.elapsed().as_secs_f32(),
            prompt_tokens.len()
        );

        Ok(completion)
    }
}

/// Loads the model, then serves generation requests until every sender is
/// dropped. Requests are handled one at a time, in arrival order.
pub async fn background_task(mut task_queue: mpsc::Receiver<GenerationRequest>, config: ModelConfig) {
    let model = LoadedModel::load(&config).await;
    info!("Model ready, serving generation requests.");

    while let Some(request) = task_queue.recv().await {
        debug!(
            "Generation request: {} bytes of input, max_length {}",
            request.prompt().len(),
            request.params().max_length
        );

        let outcome = model.generate(request.prompt(), request.params()).await;
        if let Err(ref fault) = outcome {
            error!("Generation failed: {fault}");
        }

        request.respond(outcome);
    }
}
