//! Safe RAII wrapper around `llama_context`.

use std::sync::Arc;

use tracing::debug;

use crate::batch::LlamaBatch;
use crate::error::{LlamaError, Result};
use crate::lora::LoraAdapter;
use crate::model::LlamaModel;

/// Owns a `llama_context` pointer and its parent model reference.
pub struct LlamaContext {
    ptr: *mut llama_sys::llama_context,
    /// Adapters currently attached; held so they cannot be freed while in use.
    pub(crate) loras: Vec<(Arc<LoraAdapter>, f32)>,
    /// Keep the model alive for the lifetime of the context.
    model: Arc<LlamaModel>,
    /// Output rows produced by the last decode.
    n_outputs: usize,
    /// Mirrors the native flag, which has no getter.
    embeddings: bool,
}

// Safety: all mutation goes through &mut self, and the type is !Sync, so
// the native context is never touched from two threads at once.
unsafe impl Send for LlamaContext {}

impl std::fmt::Debug for LlamaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaContext")
            .field("n_ctx", &self.n_ctx())
            .field("n_batch", &self.n_batch())
            .field("loras", &self.loras.len())
            .finish()
    }
}

impl LlamaContext {
    /// Create a new inference context.
    pub fn new(model: Arc<LlamaModel>, params: &ContextParams) -> Result<Self> {
        let raw = params.to_raw();

        let ctx = unsafe { llama_sys::llama_init_from_model(model.as_ptr(), raw) };
        if ctx.is_null() {
            return Err(LlamaError::ContextCreationFailed(
                "llama_init_from_model returned null".into(),
            ));
        }

        let ctx = Self {
            ptr: ctx,
            loras: Vec::new(),
            model,
            n_outputs: 0,
            embeddings: params.embeddings,
        };
        debug!(n_ctx = ctx.n_ctx(), n_batch = ctx.n_batch(), "Context created");
        Ok(ctx)
    }

    //  Accessors

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_context {
        self.ptr
    }

    pub fn model(&self) -> &LlamaModel {
        &self.model
    }

    pub fn model_arc(&self) -> &Arc<LlamaModel> {
        &self.model
    }

    pub fn n_ctx(&self) -> u32 {
        unsafe { llama_sys::llama_n_ctx(self.ptr) }
    }

    pub fn n_batch(&self) -> u32 {
        unsafe { llama_sys::llama_n_batch(self.ptr) }
    }

    pub fn n_ubatch(&self) -> u32 {
        unsafe { llama_sys::llama_n_ubatch(self.ptr) }
    }

    pub fn n_seq_max(&self) -> u32 {
        unsafe { llama_sys::llama_n_seq_max(self.ptr) }
    }

    pub fn pooling_type(&self) -> PoolingType {
        PoolingType::from_raw(unsafe { llama_sys::llama_pooling_type(self.ptr) } as i32)
    }

    //  Threads & flags

    pub fn set_n_threads(&mut self, n_threads: i32, n_threads_batch: i32) {
        unsafe { llama_sys::llama_set_n_threads(self.ptr, n_threads, n_threads_batch) }
    }

    pub fn n_threads(&self) -> i32 {
        unsafe { llama_sys::llama_n_threads(self.ptr) }
    }

    pub fn n_threads_batch(&self) -> i32 {
        unsafe { llama_sys::llama_n_threads_batch(self.ptr) }
    }

    /// Switch between producing embeddings and logits.
    pub fn set_embeddings(&mut self, embeddings: bool) {
        unsafe { llama_sys::llama_set_embeddings(self.ptr, embeddings) }
        self.embeddings = embeddings;
    }

    pub fn embeddings_enabled(&self) -> bool {
        self.embeddings
    }

    pub fn set_causal_attn(&mut self, causal: bool) {
        unsafe { llama_sys::llama_set_causal_attn(self.ptr, causal) }
    }

    pub fn set_warmup(&mut self, warmup: bool) {
        unsafe { llama_sys::llama_set_warmup(self.ptr, warmup) }
    }

    /// Wait until all queued device work has finished.
    pub fn synchronize(&mut self) {
        unsafe { llama_sys::llama_synchronize(self.ptr) }
    }

    //  Core operations

    /// Decode (process) a batch of tokens.
    pub fn decode(&mut self, batch: &LlamaBatch<'_>) -> Result<()> {
        if batch.is_empty() {
            return Err(LlamaError::InvalidArgument("cannot decode an empty batch".into()));
        }
        let rc = unsafe { llama_sys::llama_decode(self.ptr, batch.raw()) };
        if rc != 0 {
            self.n_outputs = 0;
            return Err(LlamaError::DecodeFailed(rc));
        }
        self.n_outputs = batch.logits_count();
        Ok(())
    }

    /// Run the encoder of an encoder-decoder model over `batch`.
    pub fn encode(&mut self, batch: &LlamaBatch<'_>) -> Result<()> {
        if batch.is_empty() {
            return Err(LlamaError::InvalidArgument("cannot encode an empty batch".into()));
        }
        let rc = unsafe { llama_sys::llama_encode(self.ptr, batch.raw()) };
        if rc != 0 {
            return Err(LlamaError::EncodeFailed(rc));
        }
        Ok(())
    }

    /// Number of output rows from the last successful decode.
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Logits of every output row of the last decode, row-major
    /// (`n_outputs * n_vocab`).
    pub fn logits(&self) -> Option<&[f32]> {
        if self.n_outputs == 0 {
            return None;
        }
        unsafe {
            let p = llama_sys::llama_get_logits(self.ptr);
            if p.is_null() {
                None
            } else {
                let len = self.n_outputs * self.model.n_vocab() as usize;
                Some(std::slice::from_raw_parts(p, len))
            }
        }
    }

    /// Logits for the token at index `i` in the last batch. Negative
    /// indexes count back from the last output.
    pub fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        unsafe {
            let p = llama_sys::llama_get_logits_ith(self.ptr, i);
            if p.is_null() {
                None
            } else {
                Some(std::slice::from_raw_parts(p, self.model.n_vocab() as usize))
            }
        }
    }

    /// Per-token embedding for batch index `i` (negative = from the end).
    pub fn embeddings_ith(&self, i: i32) -> Option<&[f32]> {
        unsafe {
            let p = llama_sys::llama_get_embeddings_ith(self.ptr, i);
            if p.is_null() {
                None
            } else {
                Some(std::slice::from_raw_parts(p, self.model.n_embd() as usize))
            }
        }
    }

    /// Pooled embedding of a sequence. `None` when pooling is disabled.
    /// Rank pooling yields one score per classifier output.
    pub fn embeddings_seq(&self, seq_id: i32) -> Option<&[f32]> {
        let len = match self.pooling_type() {
            PoolingType::None => return None,
            PoolingType::Rank => {
                (unsafe { llama_sys::llama_model_n_cls_out(self.model.as_ptr()) }).max(1) as usize
            }
            _ => self.model.n_embd() as usize,
        };
        unsafe {
            let p = llama_sys::llama_get_embeddings_seq(self.ptr, seq_id);
            if p.is_null() {
                None
            } else {
                Some(std::slice::from_raw_parts(p, len))
            }
        }
    }

    //  Performance

    pub fn perf(&self) -> PerfData {
        let d = unsafe { llama_sys::llama_perf_context(self.ptr) };
        PerfData {
            t_start_ms: d.t_start_ms,
            t_load_ms: d.t_load_ms,
            t_p_eval_ms: d.t_p_eval_ms,
            t_eval_ms: d.t_eval_ms,
            n_p_eval: d.n_p_eval,
            n_eval: d.n_eval,
        }
    }

    pub fn perf_reset(&mut self) {
        unsafe { llama_sys::llama_perf_context_reset(self.ptr) }
    }

    /// Print llama.cpp's own timing report through the log callback.
    pub fn perf_print(&self) {
        unsafe { llama_sys::llama_perf_context_print(self.ptr) }
    }
}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama context");
            unsafe { llama_sys::llama_free(self.ptr) }
        }
        // Attached adapters (and then the model) are released after the
        // context that referenced them.
    }
}

//  Enums

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RopeScalingType {
    /// Use the model's setting.
    #[default]
    Unspecified,
    None,
    Linear,
    Yarn,
    LongRope,
}

impl RopeScalingType {
    fn as_raw(self) -> llama_sys::llama_rope_scaling_type {
        match self {
            Self::Unspecified => -1,
            Self::None => 0,
            Self::Linear => 1,
            Self::Yarn => 2,
            Self::LongRope => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    /// Use the model's setting.
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    /// Reranking: one relevance score per sequence.
    Rank,
}

impl PoolingType {
    fn as_raw(self) -> llama_sys::llama_pooling_type {
        match self {
            Self::Unspecified => -1,
            Self::None => 0,
            Self::Mean => 1,
            Self::Cls => 2,
            Self::Last => 3,
            Self::Rank => 4,
        }
    }

    fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Mean,
            2 => Self::Cls,
            3 => Self::Last,
            4 => Self::Rank,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    #[default]
    Unspecified,
    Causal,
    NonCausal,
}

impl AttentionType {
    fn as_raw(self) -> llama_sys::llama_attention_type {
        match self {
            Self::Unspecified => -1,
            Self::Causal => 0,
            Self::NonCausal => 1,
        }
    }
}

//  ContextParams

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context window; 0 → use model's training context size.
    pub n_ctx: u32,
    /// Logical maximum batch size submitted to `decode`.
    pub n_batch: u32,
    /// Physical maximum batch size.
    pub n_ubatch: u32,
    /// Maximum number of distinct sequences.
    pub n_seq_max: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
    pub rope_scaling_type: RopeScalingType,
    pub pooling_type: PoolingType,
    pub attention_type: AttentionType,
    /// 0 = from model.
    pub rope_freq_base: f32,
    /// 0 = from model.
    pub rope_freq_scale: f32,
    /// Negative = from model.
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    pub embeddings: bool,
    /// Keep the KV cache on the GPU.
    pub offload_kqv: bool,
    pub no_perf: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4);
        Self {
            n_ctx: 0,
            n_batch: 2048,
            n_ubatch: 512,
            n_seq_max: 1,
            n_threads: threads,
            n_threads_batch: threads,
            rope_scaling_type: RopeScalingType::Unspecified,
            pooling_type: PoolingType::Unspecified,
            attention_type: AttentionType::Unspecified,
            rope_freq_base: 0.0,
            rope_freq_scale: 0.0,
            yarn_ext_factor: -1.0,
            yarn_attn_factor: 1.0,
            yarn_beta_fast: 32.0,
            yarn_beta_slow: 1.0,
            yarn_orig_ctx: 0,
            embeddings: false,
            offload_kqv: true,
            no_perf: false,
        }
    }
}

impl ContextParams {
    pub(crate) fn to_raw(&self) -> llama_sys::llama_context_params {
        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = self.n_ctx;
        raw.n_batch = self.n_batch;
        raw.n_ubatch = self.n_ubatch.min(self.n_batch.max(1));
        raw.n_seq_max = self.n_seq_max.max(1);
        raw.n_threads = self.n_threads;
        raw.n_threads_batch = self.n_threads_batch;
        raw.rope_scaling_type = self.rope_scaling_type.as_raw();
        raw.pooling_type = self.pooling_type.as_raw();
        raw.attention_type = self.attention_type.as_raw();
        raw.rope_freq_base = self.rope_freq_base;
        raw.rope_freq_scale = self.rope_freq_scale;
        raw.yarn_ext_factor = self.yarn_ext_factor;
        raw.yarn_attn_factor = self.yarn_attn_factor;
        raw.yarn_beta_fast = self.yarn_beta_fast;
        raw.yarn_beta_slow = self.yarn_beta_slow;
        raw.yarn_orig_ctx = self.yarn_orig_ctx;
        raw.embeddings = self.embeddings;
        raw.offload_kqv = self.offload_kqv;
        raw.no_perf = self.no_perf;
        raw
    }
}

//  PerfData

#[derive(Debug, Clone, serde::Serialize)]
pub struct PerfData {
    pub t_start_ms: f64,
    pub t_load_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_p_eval: i32,
    pub n_eval: i32,
}

impl PerfData {
    /// Prompt processing speed (tokens/s).
    pub fn prompt_tokens_per_sec(&self) -> f64 {
        if self.t_p_eval_ms > 0.0 {
            self.n_p_eval as f64 / (self.t_p_eval_ms / 1000.0)
        } else {
            0.0
        }
    }

    /// Generation speed (tokens/s).
    pub fn generation_tokens_per_sec(&self) -> f64 {
        if self.t_eval_ms > 0.0 {
            self.n_eval as f64 / (self.t_eval_ms / 1000.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_rates() {
        let perf = PerfData {
            t_start_ms: 0.0,
            t_load_ms: 10.0,
            t_p_eval_ms: 500.0,
            t_eval_ms: 0.0,
            n_p_eval: 100,
            n_eval: 0,
        };
        assert_eq!(perf.prompt_tokens_per_sec(), 200.0);
        assert_eq!(perf.generation_tokens_per_sec(), 0.0);
    }

    #[test]
    fn test_context_params_to_raw() {
        let params = ContextParams {
            n_ctx: 1024,
            n_batch: 256,
            n_ubatch: 512,
            pooling_type: PoolingType::Mean,
            embeddings: true,
            ..Default::default()
        };
        let raw = params.to_raw();
        assert_eq!(raw.n_ctx, 1024);
        assert_eq!(raw.n_batch, 256);
        // micro-batch never exceeds the logical batch
        assert_eq!(raw.n_ubatch, 256);
        assert_eq!(raw.pooling_type, 1);
        assert_eq!(raw.rope_scaling_type, -1);
        assert!(raw.embeddings);
    }

    #[test]
    fn test_context_params_partial_json() {
        let p: ContextParams = serde_json::from_str(r#"{"n_ctx": 4096, "pooling_type": "cls"}"#).unwrap();
        assert_eq!(p.n_ctx, 4096);
        assert_eq!(p.pooling_type, PoolingType::Cls);
        assert_eq!(p.n_batch, 2048);
    }

    #[test]
    fn test_pooling_from_raw() {
        assert_eq!(PoolingType::from_raw(4), PoolingType::Rank);
        assert_eq!(PoolingType::from_raw(-1), PoolingType::Unspecified);
    }
}
