//! Safe Rust binding over the llama.cpp C API.
//!
//! Provides RAII-managed types for models, contexts, batches, KV cache
//! and state, samplers, LoRA adapters, plus convenience layers for chat
//! templating, embeddings, quantization and streaming text generation.
//!
//! Ownership rules across the FFI boundary:
//! * a [`LlamaContext`] and every [`LoraAdapter`] hold an `Arc` of their
//!   [`LlamaModel`], so a model is never freed while something uses it;
//! * a [`LlamaBatch`] knows whether it allocated its buffers or borrows
//!   them from a token slice, and frees only the former;
//! * [`KvCache`] borrows its context mutably and cannot outlive it;
//! * [`SamplerChain::add`] consumes a [`LlamaSampler`], moving ownership of
//!   the native sampler into the chain.

pub mod backend;
pub mod batch;
pub mod chat;
pub mod context;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod lora;
pub mod memory;
pub mod model;
pub mod quantize;
pub mod sampler;
pub mod state;
pub mod token;
pub mod vocab;

pub use backend::{LlamaBackend, NumaStrategy};
pub use batch::LlamaBatch;
pub use chat::{ChatMessage, apply_model_template, apply_template, builtin_templates};
pub use context::{AttentionType, ContextParams, LlamaContext, PerfData, PoolingType, RopeScalingType};
pub use embedding::{cosine_similarity, embed, normalize_l2};
pub use error::{LlamaError, Result};
pub use generate::{Completion, FinishReason, GenerateEvent, GenerateRequest, StopMatcher, generate, generate_blocking};
pub use lora::LoraAdapter;
pub use memory::KvCache;
pub use model::{LlamaModel, ModelParams, SplitMode};
pub use quantize::{QuantType, QuantizeParams, quantize};
pub use sampler::{CustomSampler, LlamaSampler, SamplerChain, SamplerStage, SamplingParams, TokenData, TokenDataArray};
pub use state::ContextState;
pub use token::{LlamaToken, Utf8Decoder, detokenize, token_to_piece, tokenize};
pub use vocab::{TokenAttrs, Vocab, VocabType};
