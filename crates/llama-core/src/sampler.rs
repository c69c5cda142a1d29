//! Samplers, sampler chains, and token selection.
//!
//! Ownership mirrors llama.cpp's contract: a [`LlamaSampler`] frees its
//! native object on drop *until* it is added to a [`SamplerChain`]. Adding
//! consumes the wrapper and hands the pointer to the chain, which frees it
//! together with itself. [`SamplerChain::remove`] gives ownership back.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char};
use std::marker::PhantomData;
use std::sync::OnceLock;

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::model::LlamaModel;
use crate::token::LlamaToken;
use crate::vocab::Vocab;

/// `LLAMA_DEFAULT_SEED`: draw a random seed.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

//  TokenDataArray

/// One candidate token. Layout-compatible with `llama_token_data`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: LlamaToken,
    pub logit: f32,
    pub p: f32,
}

const _: () = assert!(
    std::mem::size_of::<TokenData>() == std::mem::size_of::<llama_sys::llama_token_data>()
);

/// Owned list of candidates that samplers filter and select from.
#[derive(Debug, Clone, Default)]
pub struct TokenDataArray {
    data: Vec<TokenData>,
    selected: Option<usize>,
    sorted: bool,
}

impl TokenDataArray {
    pub fn new(data: Vec<TokenData>, sorted: bool) -> Self {
        Self {
            data,
            selected: None,
            sorted,
        }
    }

    /// One candidate per vocabulary entry, ids `0..logits.len()`.
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: LlamaToken(i as i32),
                logit,
                p: 0.0,
            })
            .collect();
        Self::new(data, false)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [TokenData] {
        &mut self.data
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// The candidate chosen by the last selecting sampler.
    pub fn selected(&self) -> Option<TokenData> {
        self.selected.and_then(|i| self.data.get(i).copied())
    }

    pub fn set_selected(&mut self, index: Option<usize>) {
        self.selected = index.filter(|&i| i < self.data.len());
    }

    /// Drop every candidate past `len`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        if self.selected.is_some_and(|i| i >= len) {
            self.selected = None;
        }
    }

    /// Expose the array to a native call. Samplers may reorder and shrink
    /// the buffer in place; `size`, `selected` and `sorted` are read back.
    fn with_raw(&mut self, f: impl FnOnce(*mut llama_sys::llama_token_data_array)) {
        let base = self.data.as_mut_ptr() as *mut llama_sys::llama_token_data;
        let mut raw = llama_sys::llama_token_data_array {
            data: base,
            size: self.data.len(),
            selected: self.selected.map_or(-1, |i| i as i64),
            sorted: self.sorted,
        };
        f(&mut raw as *mut _);
        unsafe { self.read_back(&raw, base) };
    }

    unsafe fn read_back(&mut self, raw: &llama_sys::llama_token_data_array, base: *mut llama_sys::llama_token_data) {
        if raw.data != base {
            let src = unsafe { std::slice::from_raw_parts(raw.data as *const TokenData, raw.size) };
            self.data = src.to_vec();
        } else {
            self.data.truncate(raw.size);
        }
        self.sorted = raw.sorted;
        self.selected = usize::try_from(raw.selected).ok().filter(|&i| i < self.data.len());
    }

    /// Copy a native array (used by custom sampler callbacks).
    unsafe fn copy_from_raw(raw: &llama_sys::llama_token_data_array) -> Self {
        let data = if raw.data.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(raw.data as *const TokenData, raw.size) }.to_vec()
        };
        Self {
            selected: usize::try_from(raw.selected).ok().filter(|&i| i < data.len()),
            data,
            sorted: raw.sorted,
        }
    }

    /// Write back into a native array. The native buffer never grows.
    unsafe fn write_to_raw(&self, raw: &mut llama_sys::llama_token_data_array) {
        let n = self.data.len().min(raw.size);
        if n > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(self.data.as_ptr(), raw.data as *mut TokenData, n);
            }
        }
        raw.size = n;
        raw.sorted = self.sorted;
        raw.selected = self.selected.filter(|&i| i < n).map_or(-1, |i| i as i64);
    }
}

//  LlamaSampler

/// A standalone sampler that owns its native object.
pub struct LlamaSampler {
    ptr: *mut llama_sys::llama_sampler,
}

unsafe impl Send for LlamaSampler {}

impl std::fmt::Debug for LlamaSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaSampler").field("name", &self.name()).finish()
    }
}

impl LlamaSampler {
    /// Take ownership of a native sampler.
    fn from_raw(ptr: *mut llama_sys::llama_sampler, what: &str) -> Result<Self> {
        if ptr.is_null() {
            return Err(LlamaError::SamplerError(format!("failed to create {what} sampler")));
        }
        Ok(Self { ptr })
    }

    /// Wrap a constructor that cannot report failure.
    fn infallible(ptr: *mut llama_sys::llama_sampler) -> Self {
        Self { ptr }
    }

    /// Give up ownership without freeing.
    fn into_raw(self) -> *mut llama_sys::llama_sampler {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    //  Constructors

    /// Always pick the most likely token.
    pub fn greedy() -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_greedy() })
    }

    /// Draw from the distribution. `DEFAULT_SEED` picks a random seed.
    pub fn dist(seed: u32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_dist(seed) })
    }

    pub fn top_k(k: i32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_top_k(k) })
    }

    pub fn top_p(p: f32, min_keep: usize) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_top_p(p, min_keep) })
    }

    pub fn min_p(p: f32, min_keep: usize) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_min_p(p, min_keep) })
    }

    /// Locally typical sampling.
    pub fn typical(p: f32, min_keep: usize) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_typical(p, min_keep) })
    }

    pub fn temp(t: f32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_temp(t) })
    }

    /// Dynamic temperature in `[t - delta, t + delta]`.
    pub fn temp_ext(t: f32, delta: f32, exponent: f32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_temp_ext(t, delta, exponent) })
    }

    /// Exclude top choices with probability `p` when above `t`.
    pub fn xtc(p: f32, t: f32, min_keep: usize, seed: u32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_xtc(p, t, min_keep, seed) })
    }

    pub fn top_n_sigma(n: f32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_top_n_sigma(n) })
    }

    /// Mirostat v1. Selects the token itself.
    pub fn mirostat(n_vocab: i32, seed: u32, tau: f32, eta: f32, m: i32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_mirostat(n_vocab, seed, tau, eta, m) })
    }

    /// Mirostat v2. Selects the token itself.
    pub fn mirostat_v2(seed: u32, tau: f32, eta: f32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_mirostat_v2(seed, tau, eta) })
    }

    /// Repetition, frequency and presence penalties over the last `last_n`
    /// accepted tokens (-1 = context size, 0 = disabled).
    pub fn penalties(last_n: i32, repeat: f32, freq: f32, present: f32) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_penalties(last_n, repeat, freq, present) })
    }

    /// DRY ("don't repeat yourself") repetition penalty.
    #[allow(clippy::too_many_arguments)]
    pub fn dry(
        vocab: &Vocab<'_>,
        n_ctx_train: i32,
        multiplier: f32,
        base: f32,
        allowed_length: i32,
        penalty_last_n: i32,
        seq_breakers: &[&str],
    ) -> Result<Self> {
        let breakers = seq_breakers
            .iter()
            .map(|s| CString::new(*s))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut ptrs: Vec<*const c_char> = breakers.iter().map(|c| c.as_ptr()).collect();
        let ptr = unsafe {
            llama_sys::llama_sampler_init_dry(
                vocab.as_ptr(),
                n_ctx_train,
                multiplier,
                base,
                allowed_length,
                penalty_last_n,
                ptrs.as_mut_ptr(),
                ptrs.len(),
            )
        };
        Self::from_raw(ptr, "dry")
    }

    /// Add fixed biases to token logits. The biases are copied.
    pub fn logit_bias(n_vocab: i32, biases: &[(LlamaToken, f32)]) -> Self {
        let raw: Vec<llama_sys::llama_logit_bias> = biases
            .iter()
            .map(|&(token, bias)| llama_sys::llama_logit_bias { token: token.0, bias })
            .collect();
        Self::infallible(unsafe {
            llama_sys::llama_sampler_init_logit_bias(n_vocab, raw.len() as i32, raw.as_ptr())
        })
    }

    /// Constrain output with a GBNF grammar starting at rule `root`.
    pub fn grammar(vocab: &Vocab<'_>, grammar: &str, root: &str) -> Result<Self> {
        let c_grammar = CString::new(grammar)?;
        let c_root = CString::new(root)?;
        let ptr = unsafe {
            llama_sys::llama_sampler_init_grammar(vocab.as_ptr(), c_grammar.as_ptr(), c_root.as_ptr())
        };
        Self::from_raw(ptr, "grammar")
    }

    /// Fill-in-the-middle post-processing; use after top-k / top-p.
    pub fn infill(vocab: &Vocab<'_>) -> Self {
        Self::infallible(unsafe { llama_sys::llama_sampler_init_infill(vocab.as_ptr()) })
    }

    /// Install a Rust-side sampler.
    pub fn custom(sampler: impl CustomSampler) -> Self {
        let state = Box::new(CustomState {
            name: CString::new(sampler.name()).unwrap_or_default(),
            inner: Box::new(sampler),
        });
        let ctx = Box::into_raw(state) as *mut std::ffi::c_void;
        Self::infallible(unsafe { llama_sys::llama_sampler_init(custom_iface(), ctx) })
    }

    //  Operations

    pub fn name(&self) -> String {
        sampler_name(self.ptr)
    }

    /// Record a token as part of the output (updates penalty history etc.).
    pub fn accept(&mut self, token: LlamaToken) {
        unsafe { llama_sys::llama_sampler_accept(self.ptr, token.0) }
    }

    pub fn apply(&mut self, candidates: &mut TokenDataArray) {
        candidates.with_raw(|raw| unsafe { llama_sys::llama_sampler_apply(self.ptr, raw) });
    }

    pub fn reset(&mut self) {
        unsafe { llama_sys::llama_sampler_reset(self.ptr) }
    }

    /// Fails for custom samplers (and chains holding one): llama.cpp aborts
    /// when asked to clone a sampler without a clone callback.
    pub fn try_clone(&self) -> Result<Self> {
        ensure_clonable(self.ptr)?;
        Self::from_raw(unsafe { llama_sys::llama_sampler_clone(self.ptr) }, "cloned")
    }

    /// Seed of a seeded sampler, `DEFAULT_SEED` otherwise.
    pub fn seed(&self) -> u32 {
        unsafe { llama_sys::llama_sampler_get_seed(self.ptr) }
    }

    /// Sample from the logits of output `idx` of the last decode, and
    /// accept the result.
    pub fn sample(&mut self, ctx: &LlamaContext, idx: i32) -> Result<LlamaToken> {
        sample_raw(self.ptr, ctx, idx)
    }
}

impl Drop for LlamaSampler {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
        }
    }
}

/// `llama_sampler_sample` dereferences the output row without a null check,
/// so the row must exist before we hand over.
fn sample_raw(
    ptr: *mut llama_sys::llama_sampler,
    ctx: &LlamaContext,
    idx: i32,
) -> Result<LlamaToken> {
    if ctx.logits_ith(idx).is_none() {
        return Err(LlamaError::InvalidArgument(format!(
            "no logits for output {idx}; decode a batch that requests it first"
        )));
    }
    Ok(LlamaToken(unsafe { llama_sys::llama_sampler_sample(ptr, ctx.as_ptr(), idx) }))
}

/// Whether `ptr` is a custom sampler, or a chain with one at any depth.
fn holds_custom(ptr: *const llama_sys::llama_sampler) -> bool {
    if ptr.is_null() {
        return false;
    }
    if std::ptr::eq(unsafe { (*ptr).iface }, custom_iface()) {
        return true;
    }
    if sampler_name(ptr) != "chain" {
        return false;
    }
    let n = unsafe { llama_sys::llama_sampler_chain_n(ptr) };
    (0..n).any(|i| holds_custom(unsafe { llama_sys::llama_sampler_chain_get(ptr, i) }))
}

fn ensure_clonable(ptr: *const llama_sys::llama_sampler) -> Result<()> {
    if holds_custom(ptr) {
        return Err(LlamaError::SamplerError(
            "cannot clone: contains a custom sampler".into(),
        ));
    }
    Ok(())
}

fn sampler_name(ptr: *const llama_sys::llama_sampler) -> String {
    unsafe {
        let p = llama_sys::llama_sampler_name(ptr);
        if p.is_null() {
            String::new()
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }
}

//  SamplerChain

/// RAII wrapper around a `llama_sampler` chain.
pub struct SamplerChain {
    ptr: *mut llama_sys::llama_sampler,
}

unsafe impl Send for SamplerChain {}

impl std::fmt::Debug for SamplerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = (0..self.len()).filter_map(|i| self.get(i)).map(|s| s.name()).collect();
        f.debug_struct("SamplerChain").field("samplers", &names).finish()
    }
}

impl SamplerChain {
    /// Create an empty sampler chain.
    pub fn new(no_perf: bool) -> Self {
        let mut params = unsafe { llama_sys::llama_sampler_chain_default_params() };
        params.no_perf = no_perf;
        let ptr = unsafe { llama_sys::llama_sampler_chain_init(params) };
        Self { ptr }
    }

    /// Append `sampler`; the chain takes over freeing it.
    pub fn add(&mut self, sampler: LlamaSampler) {
        unsafe { llama_sys::llama_sampler_chain_add(self.ptr, sampler.into_raw()) }
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, sampler: LlamaSampler) -> Self {
        self.add(sampler);
        self
    }

    pub fn len(&self) -> usize {
        (unsafe { llama_sys::llama_sampler_chain_n(self.ptr) }).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the sampler at `i`; it stays owned by the chain.
    pub fn get(&self, i: usize) -> Option<SamplerRef<'_>> {
        if i >= self.len() {
            return None;
        }
        let ptr = unsafe { llama_sys::llama_sampler_chain_get(self.ptr, i as i32) };
        (!ptr.is_null()).then_some(SamplerRef {
            ptr,
            _chain: PhantomData,
        })
    }

    /// Detach the sampler at `i`; ownership moves back to the caller.
    pub fn remove(&mut self, i: usize) -> Option<LlamaSampler> {
        if i >= self.len() {
            return None;
        }
        let ptr = unsafe { llama_sys::llama_sampler_chain_remove(self.ptr, i as i32) };
        LlamaSampler::from_raw(ptr, "removed").ok()
    }

    /// Turn the chain into a plain sampler, e.g. to nest it in another chain.
    pub fn into_sampler(self) -> LlamaSampler {
        let ptr = self.ptr;
        std::mem::forget(self);
        LlamaSampler::infallible(ptr)
    }

    /// Deep copy of every member. Fails if any member is a custom sampler.
    pub fn try_clone(&self) -> Result<Self> {
        ensure_clonable(self.ptr)?;
        let ptr = unsafe { llama_sys::llama_sampler_clone(self.ptr) };
        if ptr.is_null() {
            return Err(LlamaError::SamplerError("failed to clone sampler chain".into()));
        }
        Ok(Self { ptr })
    }

    //  Sampling

    /// Sample the next token from the model output at position `idx`.
    /// The token is accepted into every sampler of the chain.
    ///
    /// Fails with `InvalidArgument` when the last decode produced no
    /// logits for `idx`.
    pub fn sample(&mut self, ctx: &LlamaContext, idx: i32) -> Result<LlamaToken> {
        sample_raw(self.ptr, ctx, idx)
    }

    pub fn accept(&mut self, token: LlamaToken) {
        unsafe { llama_sys::llama_sampler_accept(self.ptr, token.0) }
    }

    pub fn apply(&mut self, candidates: &mut TokenDataArray) {
        candidates.with_raw(|raw| unsafe { llama_sys::llama_sampler_apply(self.ptr, raw) });
    }

    pub fn reset(&mut self) {
        unsafe { llama_sys::llama_sampler_reset(self.ptr) }
    }

    /// Seed of the first seeded sampler in the chain.
    pub fn seed(&self) -> u32 {
        unsafe { llama_sys::llama_sampler_get_seed(self.ptr) }
    }

    pub fn perf(&self) -> SamplerPerf {
        let d = unsafe { llama_sys::llama_perf_sampler(self.ptr) };
        SamplerPerf {
            t_sample_ms: d.t_sample_ms,
            n_sample: d.n_sample,
        }
    }

    pub fn perf_reset(&mut self) {
        unsafe { llama_sys::llama_perf_sampler_reset(self.ptr) }
    }
}

impl Drop for SamplerChain {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // Frees every sampler still in the chain.
            unsafe { llama_sys::llama_sampler_free(self.ptr) }
        }
    }
}

/// A sampler borrowed from a chain.
#[derive(Clone, Copy)]
pub struct SamplerRef<'a> {
    ptr: *mut llama_sys::llama_sampler,
    _chain: PhantomData<&'a SamplerChain>,
}

impl SamplerRef<'_> {
    pub fn name(&self) -> String {
        sampler_name(self.ptr)
    }

    pub fn seed(&self) -> u32 {
        unsafe { llama_sys::llama_sampler_get_seed(self.ptr) }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SamplerPerf {
    pub t_sample_ms: f64,
    pub n_sample: i32,
}

//  Custom samplers

/// A sampler implemented in Rust and driven by llama.cpp.
///
/// Panicking inside a callback aborts the process.
pub trait CustomSampler: Send + 'static {
    fn name(&self) -> &str {
        "custom"
    }

    /// Filter, reweight or select among `candidates`.
    fn apply(&mut self, candidates: &mut TokenDataArray);

    fn accept(&mut self, _token: LlamaToken) {}

    fn reset(&mut self) {}
}

struct CustomState {
    name: CString,
    inner: Box<dyn CustomSampler>,
}

fn custom_iface() -> &'static llama_sys::llama_sampler_i {
    static IFACE: OnceLock<llama_sys::llama_sampler_i> = OnceLock::new();
    IFACE.get_or_init(|| llama_sys::llama_sampler_i {
        name: Some(custom_name),
        accept: Some(custom_accept),
        apply: Some(custom_apply),
        reset: Some(custom_reset),
        clone: None,
        free: Some(custom_free),
        ..Default::default()
    })
}

/// Safety: `smpl` was created by [`LlamaSampler::custom`].
unsafe fn custom_state<'a>(smpl: *const llama_sys::llama_sampler) -> &'a mut CustomState {
    unsafe { &mut *((*smpl).ctx as *mut CustomState) }
}

unsafe extern "C" fn custom_name(smpl: *const llama_sys::llama_sampler) -> *const c_char {
    unsafe { custom_state(smpl) }.name.as_ptr()
}

unsafe extern "C" fn custom_accept(smpl: *mut llama_sys::llama_sampler, token: llama_sys::llama_token) {
    unsafe { custom_state(smpl) }.inner.accept(LlamaToken(token));
}

unsafe extern "C" fn custom_apply(
    smpl: *mut llama_sys::llama_sampler,
    cur_p: *mut llama_sys::llama_token_data_array,
) {
    let state = unsafe { custom_state(smpl) };
    let raw = unsafe { &mut *cur_p };
    let mut candidates = unsafe { TokenDataArray::copy_from_raw(raw) };
    state.inner.apply(&mut candidates);
    unsafe { candidates.write_to_raw(raw) };
}

unsafe extern "C" fn custom_reset(smpl: *mut llama_sys::llama_sampler) {
    unsafe { custom_state(smpl) }.inner.reset();
}

unsafe extern "C" fn custom_free(smpl: *mut llama_sys::llama_sampler) {
    let ctx = unsafe { (*smpl).ctx } as *mut CustomState;
    if !ctx.is_null() {
        drop(unsafe { Box::from_raw(ctx) });
    }
}

//  High-level SamplingParams

/// User-facing sampling configuration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temp")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_min_p")]
    pub min_p: f32,
    #[serde(default = "default_one")]
    pub typical_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    /// 0 = off, 1 = Mirostat, 2 = Mirostat 2.0.
    #[serde(default)]
    pub mirostat: u8,
    #[serde(default = "default_mirostat_tau")]
    pub mirostat_tau: f32,
    #[serde(default = "default_mirostat_eta")]
    pub mirostat_eta: f32,
    /// GBNF grammar; output is constrained from the `root` rule.
    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub logit_bias: BTreeMap<i32, f32>,
    #[serde(default)]
    pub seed: Option<u32>,
}

fn default_temp() -> f32 {
    0.8
}
fn default_top_k() -> i32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_min_p() -> f32 {
    0.05
}
fn default_one() -> f32 {
    1.0
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_repeat_last_n() -> i32 {
    64
}
fn default_mirostat_tau() -> f32 {
    5.0
}
fn default_mirostat_eta() -> f32 {
    0.1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temp(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            typical_p: default_one(),
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            repeat_last_n: default_repeat_last_n(),
            mirostat: 0,
            mirostat_tau: default_mirostat_tau(),
            mirostat_eta: default_mirostat_eta(),
            grammar: None,
            logit_bias: BTreeMap::new(),
            seed: None,
        }
    }
}

/// One step of the chain built from [`SamplingParams`].
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerStage {
    Grammar(String),
    LogitBias(Vec<(LlamaToken, f32)>),
    Penalties {
        last_n: i32,
        repeat: f32,
        freq: f32,
        present: f32,
    },
    TopK(i32),
    Typical(f32),
    TopP(f32),
    MinP(f32),
    Temp(f32),
    Mirostat { tau: f32, eta: f32 },
    MirostatV2 { tau: f32, eta: f32 },
    Dist(u32),
    Greedy,
}

impl SamplingParams {
    /// The ordered stages this configuration expands to. Neutral settings
    /// (top_p = 1, penalty = 1, ...) are skipped.
    pub fn stages(&self) -> Vec<SamplerStage> {
        let mut stages = Vec::new();
        let seed = self.seed.unwrap_or(DEFAULT_SEED);

        if let Some(g) = self.grammar.as_ref().filter(|g| !g.trim().is_empty()) {
            stages.push(SamplerStage::Grammar(g.clone()));
        }
        if !self.logit_bias.is_empty() {
            stages.push(SamplerStage::LogitBias(
                self.logit_bias.iter().map(|(&t, &b)| (LlamaToken(t), b)).collect(),
            ));
        }
        if self.repeat_penalty != 1.0 || self.frequency_penalty != 0.0 || self.presence_penalty != 0.0 {
            stages.push(SamplerStage::Penalties {
                last_n: self.repeat_last_n,
                repeat: self.repeat_penalty,
                freq: self.frequency_penalty,
                present: self.presence_penalty,
            });
        }

        if self.temperature <= 0.0 {
            stages.push(SamplerStage::Greedy);
            return stages;
        }

        match self.mirostat {
            1 => {
                stages.push(SamplerStage::Temp(self.temperature));
                stages.push(SamplerStage::Mirostat {
                    tau: self.mirostat_tau,
                    eta: self.mirostat_eta,
                });
            }
            2 => {
                stages.push(SamplerStage::Temp(self.temperature));
                stages.push(SamplerStage::MirostatV2 {
                    tau: self.mirostat_tau,
                    eta: self.mirostat_eta,
                });
            }
            _ => {
                if self.top_k > 0 {
                    stages.push(SamplerStage::TopK(self.top_k));
                }
                if self.typical_p < 1.0 {
                    stages.push(SamplerStage::Typical(self.typical_p));
                }
                if self.top_p < 1.0 {
                    stages.push(SamplerStage::TopP(self.top_p));
                }
                if self.min_p > 0.0 {
                    stages.push(SamplerStage::MinP(self.min_p));
                }
                stages.push(SamplerStage::Temp(self.temperature));
                stages.push(SamplerStage::Dist(seed));
            }
        }

        stages
    }

    /// Build and return a ready-to-use [`SamplerChain`].
    pub fn build_chain(&self, model: &LlamaModel) -> Result<SamplerChain> {
        let vocab = model.vocab();
        let n_vocab = vocab.n_tokens();
        let seed = self.seed.unwrap_or(DEFAULT_SEED);
        let mut chain = SamplerChain::new(false);

        for stage in self.stages() {
            let sampler = match stage {
                SamplerStage::Grammar(g) => LlamaSampler::grammar(&vocab, &g, "root")?,
                SamplerStage::LogitBias(b) => LlamaSampler::logit_bias(n_vocab, &b),
                SamplerStage::Penalties {
                    last_n,
                    repeat,
                    freq,
                    present,
                } => LlamaSampler::penalties(last_n, repeat, freq, present),
                SamplerStage::TopK(k) => LlamaSampler::top_k(k),
                SamplerStage::Typical(p) => LlamaSampler::typical(p, 1),
                SamplerStage::TopP(p) => LlamaSampler::top_p(p, 1),
                SamplerStage::MinP(p) => LlamaSampler::min_p(p, 1),
                SamplerStage::Temp(t) => LlamaSampler::temp(t),
                SamplerStage::Mirostat { tau, eta } => LlamaSampler::mirostat(n_vocab, seed, tau, eta, 100),
                SamplerStage::MirostatV2 { tau, eta } => LlamaSampler::mirostat_v2(seed, tau, eta),
                SamplerStage::Dist(s) => LlamaSampler::dist(s),
                SamplerStage::Greedy => LlamaSampler::greedy(),
            };
            chain.add(sampler);
        }

        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_greedy_selects_max_logit() {
        let mut cands = TokenDataArray::from_logits(&[0.1, 2.0, 0.5]);
        LlamaSampler::greedy().apply(&mut cands);
        assert_eq!(cands.selected().map(|t| t.id), Some(LlamaToken(1)));
    }

    #[test]
    fn test_top_k_shrinks_candidates() {
        let mut cands = TokenDataArray::from_logits(&[0.1, 2.0, 0.5, 1.0]);
        LlamaSampler::top_k(2).apply(&mut cands);
        assert_eq!(cands.len(), 2);
        let ids: Vec<_> = cands.as_slice().iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_sampler_names_and_seed() {
        assert_eq!(LlamaSampler::greedy().name(), "greedy");
        assert_eq!(LlamaSampler::top_k(5).name(), "top-k");
        assert_eq!(LlamaSampler::dist(42).seed(), 42);
        let clone = LlamaSampler::min_p(0.1, 1).try_clone().unwrap();
        assert_eq!(clone.name(), "min-p");
    }

    #[test]
    fn test_chain_takes_and_returns_ownership() {
        let mut chain = SamplerChain::new(true);
        assert!(chain.is_empty());
        chain.add(LlamaSampler::top_k(10));
        chain.add(LlamaSampler::greedy());
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.get(1).map(|s| s.name()).as_deref(), Some("greedy"));
        assert!(chain.get(2).is_none());

        let removed = chain.remove(0).unwrap();
        assert_eq!(removed.name(), "top-k");
        assert_eq!(chain.len(), 1);
        assert!(chain.remove(5).is_none());

        // The removed sampler can join another chain.
        let other = SamplerChain::new(true).with(removed);
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_chain_apply_runs_in_order() {
        let mut chain = SamplerChain::new(true)
            .with(LlamaSampler::logit_bias(4, &[(LlamaToken(0), 10.0)]))
            .with(LlamaSampler::greedy());
        let mut cands = TokenDataArray::from_logits(&[0.0, 1.0, 0.5, 0.2]);
        chain.apply(&mut cands);
        assert_eq!(cands.selected().map(|t| t.id), Some(LlamaToken(0)));
    }

    #[test]
    fn test_nested_chain() {
        let inner = SamplerChain::new(true).with(LlamaSampler::top_k(1));
        let mut outer = SamplerChain::new(true)
            .with(inner.into_sampler())
            .with(LlamaSampler::greedy());
        assert_eq!(outer.get(0).map(|s| s.name()).as_deref(), Some("chain"));
        let mut cands = TokenDataArray::from_logits(&[3.0, 1.0]);
        outer.apply(&mut cands);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands.selected().map(|t| t.id), Some(LlamaToken(0)));
    }

    struct BanToken {
        banned: LlamaToken,
        drops: Arc<AtomicUsize>,
    }

    impl CustomSampler for BanToken {
        fn name(&self) -> &str {
            "ban-token"
        }

        fn apply(&mut self, candidates: &mut TokenDataArray) {
            for c in candidates.as_mut_slice() {
                if c.id == self.banned {
                    c.logit = f32::NEG_INFINITY;
                }
            }
        }
    }

    impl Drop for BanToken {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_custom_sampler_in_chain_is_freed_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let custom = LlamaSampler::custom(BanToken {
            banned: LlamaToken(2),
            drops: Arc::clone(&drops),
        });
        assert_eq!(custom.name(), "ban-token");

        let mut chain = SamplerChain::new(true).with(custom).with(LlamaSampler::greedy());
        let mut cands = TokenDataArray::from_logits(&[0.0, 1.0, 5.0]);
        chain.apply(&mut cands);
        assert_eq!(cands.selected().map(|t| t.id), Some(LlamaToken(1)));

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(chain);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_rejects_custom_sampler() {
        let drops = Arc::new(AtomicUsize::new(0));
        let ban = || BanToken {
            banned: LlamaToken(0),
            drops: Arc::clone(&drops),
        };

        let custom = LlamaSampler::custom(ban());
        assert!(matches!(custom.try_clone(), Err(LlamaError::SamplerError(_))));

        let chain = SamplerChain::new(true)
            .with(LlamaSampler::top_k(2))
            .with(LlamaSampler::custom(ban()));
        assert!(matches!(chain.try_clone(), Err(LlamaError::SamplerError(_))));

        // Nested one level down.
        let outer = SamplerChain::new(true)
            .with(chain.into_sampler())
            .with(LlamaSampler::greedy());
        assert!(matches!(outer.try_clone(), Err(LlamaError::SamplerError(_))));

        // Detaching the custom sampler makes the rest clonable again.
        let mut chain = SamplerChain::new(true).with(custom).with(LlamaSampler::greedy());
        let detached = chain.remove(0).unwrap();
        assert_eq!(detached.name(), "ban-token");
        let copy = chain.try_clone().unwrap();
        assert_eq!(copy.len(), 1);

        drop((detached, chain, copy, outer));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_chain_clone_is_independent() {
        let chain = SamplerChain::new(true)
            .with(LlamaSampler::top_k(1))
            .with(LlamaSampler::dist(7));
        let copy = chain.try_clone().unwrap();
        drop(chain);
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.get(0).map(|s| s.name()).as_deref(), Some("top-k"));
        assert_eq!(copy.seed(), 7);
    }

    #[test]
    fn test_token_data_array_truncate_clears_selection() {
        let mut cands = TokenDataArray::from_logits(&[1.0, 2.0, 3.0]);
        cands.set_selected(Some(2));
        assert_eq!(cands.selected().map(|t| t.id), Some(LlamaToken(2)));
        cands.truncate(2);
        assert!(cands.selected().is_none());
        cands.set_selected(Some(9));
        assert!(cands.selected().is_none());
    }

    #[test]
    fn test_stages_default() {
        let params = SamplingParams {
            seed: Some(7),
            ..Default::default()
        };
        assert_eq!(
            params.stages(),
            vec![
                SamplerStage::Penalties {
                    last_n: 64,
                    repeat: 1.1,
                    freq: 0.0,
                    present: 0.0
                },
                SamplerStage::TopK(40),
                SamplerStage::TopP(0.95),
                SamplerStage::MinP(0.05),
                SamplerStage::Temp(0.8),
                SamplerStage::Dist(7),
            ]
        );
    }

    #[test]
    fn test_stages_greedy_when_temperature_zero() {
        let params = SamplingParams {
            temperature: 0.0,
            repeat_penalty: 1.0,
            ..Default::default()
        };
        assert_eq!(params.stages(), vec![SamplerStage::Greedy]);
    }

    #[test]
    fn test_stages_mirostat_and_bias() {
        let mut params = SamplingParams {
            mirostat: 2,
            repeat_penalty: 1.0,
            grammar: Some("root ::= \"yes\"".into()),
            ..Default::default()
        };
        params.logit_bias.insert(5, -100.0);
        assert_eq!(
            params.stages(),
            vec![
                SamplerStage::Grammar("root ::= \"yes\"".into()),
                SamplerStage::LogitBias(vec![(LlamaToken(5), -100.0)]),
                SamplerStage::Temp(0.8),
                SamplerStage::MirostatV2 { tau: 5.0, eta: 0.1 },
            ]
        );
    }

    #[test]
    fn test_sampling_params_json() {
        let p: SamplingParams =
            serde_json::from_str(r#"{"temperature": 0.2, "logit_bias": {"15": 2.5}}"#).unwrap();
        assert_eq!(p.temperature, 0.2);
        assert_eq!(p.top_k, 40);
        assert_eq!(p.logit_bias.get(&15), Some(&2.5));
    }
}
