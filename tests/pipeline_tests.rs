//! Integration tests for the generation pipeline.
//!
//! These tests require a GGUF model file (and for some, a GPU) to be present.
//! They are ignored by default and can be run with:
//!
//! ```bash
//! cargo test --test pipeline_tests -- --ignored
//! ```
//!
//! Set the MODEL_FILE_NAME environment variable to use a different model:
//!
//! ```bash
//! MODEL_FILE_NAME=models/my-model.gguf cargo test --test pipeline_tests -- --ignored
//! ```

use local_llm_playground::core::pipeline::{
    self, GenerationParams, LoadedModel, ModelConfig,
};
use local_llm_playground::core::services::ChannelTextGenerator;
use local_llm_playground::core::traits::{GenerationFault, TextGenerator};
use std::path::Path;
use tokio::sync::mpsc;
use wgml::gguf::Gguf;
use wgml::models::gpt2::Gpt2Tokenizer;
use wgml::models::llama2::cpu::Llama2Config;

fn model_path() -> String {
    ModelConfig::from_env().model_file
}

fn model_exists() -> bool {
    Path::new(&model_path()).exists()
}

/// Helper to skip test if model doesn't exist (for non-ignored runs)
fn require_model() {
    if !model_exists() {
        eprintln!(
            "Skipping test: Model file not found at '{}'. \
             Set MODEL_FILE_NAME env var or place model in default location.",
            model_path()
        );
    }
}

fn load_gguf_fixture() -> memmap2::Mmap {
    let file = std::fs::File::open(model_path()).expect("failed to open model file");
    unsafe { memmap2::Mmap::map(&file) }.expect("failed to mmap file")
}

// =============================================================================
// GGUF Loading Tests
// =============================================================================

#[test]
#[ignore = "requires model file"]
fn test_gguf_file_loads_successfully() {
    require_model();
    if !model_exists() {
        return;
    }

    let mmap = load_gguf_fixture();
    let gguf = Gguf::from_bytes(&mmap[..]);

    assert!(gguf.is_ok(), "Failed to parse GGUF file: {:?}", gguf.err());
}

#[test]
#[ignore = "requires model file"]
fn test_gguf_contains_tokenizer_metadata() {
    require_model();
    if !model_exists() {
        return;
    }

    let mmap = load_gguf_fixture();
    let gguf = Gguf::from_bytes(&mmap[..]).expect("failed to parse GGUF");

    assert!(
        gguf.metadata.contains_key("tokenizer.ggml.tokens"),
        "GGUF missing tokenizer.ggml.tokens"
    );
    assert!(
        gguf.metadata.contains_key("tokenizer.ggml.bos_token_id"),
        "GGUF missing tokenizer.ggml.bos_token_id"
    );
    assert!(
        gguf.metadata.contains_key("tokenizer.ggml.eos_token_id"),
        "GGUF missing tokenizer.ggml.eos_token_id"
    );
}

// =============================================================================
// Tokenizer Tests
// =============================================================================

#[test]
#[ignore = "requires model file"]
fn test_tokenizer_encodes_text() {
    require_model();
    if !model_exists() {
        return;
    }

    let mmap = load_gguf_fixture();
    let gguf = Gguf::from_bytes(&mmap[..]).expect("failed to parse GGUF");

    let tokenizer = Gpt2Tokenizer::from_gguf(&gguf);
    let tokens = tokenizer.encode("Hello, world!");

    assert!(!tokens.is_empty(), "Tokenizer should produce tokens");
}

// =============================================================================
// Model Configuration Tests
// =============================================================================

#[test]
#[ignore = "requires model file"]
fn test_model_config_from_gguf_is_sane() {
    require_model();
    if !model_exists() {
        return;
    }

    let mmap = load_gguf_fixture();
    let gguf = Gguf::from_bytes(&mmap[..]).expect("failed to parse GGUF");

    let config = Llama2Config::from_gguf(&gguf);

    assert!(config.dim > 0, "Model dimension should be positive");
    assert!(config.n_layers > 0, "Number of layers should be positive");
    assert!(config.vocab_size > 0, "Vocab size should be positive");
    assert!(config.seq_len > 0, "Context length should be positive");
}

// =============================================================================
// GPU Initialization Tests
// =============================================================================

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_gpu_instance_creation() {
    use wgcore::gpu::GpuInstance;

    let gpu = GpuInstance::new().await;
    assert!(gpu.is_ok(), "Failed to create GPU instance: {:?}", gpu.err());
}

// =============================================================================
// End-to-End Generation Tests (Heavy - requires model file and GPU)
// =============================================================================

#[tokio::test]
#[ignore = "requires model file and GPU - heavy test"]
async fn test_loaded_model_rejects_oversized_prompt() {
    require_model();
    if !model_exists() {
        return;
    }

    let model = LoadedModel::load(&ModelConfig::from_env()).await;

    // With a max_length of 1, any non-empty prompt is already too long.
    let outcome = model
        .generate(
            "Hello",
            &GenerationParams {
                max_length: 1,
                num_return_sequences: 1,
            },
        )
        .await;

    assert!(matches!(
        outcome,
        Err(GenerationFault::PromptTooLong { .. })
    ));
}

#[tokio::test]
#[ignore = "requires model file and GPU - heavy test"]
async fn test_generation_echoes_prompt_prefix() {
    require_model();
    if !model_exists() {
        return;
    }

    let (sender, receiver) = mpsc::channel(1);
    let worker = tokio::spawn(pipeline::background_task(receiver, ModelConfig::from_env()));

    let generator = ChannelTextGenerator::new(sender);
    let prompt = "The quick brown fox";
    let records = generator
        .generate(
            prompt,
            GenerationParams {
                max_length: 64,
                num_return_sequences: 1,
            },
        )
        .await
        .expect("generation failed");

    assert_eq!(records.len(), 1);
    assert!(
        records[0].generated_text.starts_with(prompt),
        "Record should start with the prompt echo, got: {:?}",
        records[0].generated_text
    );

    drop(generator);
    worker.await.unwrap();
}
