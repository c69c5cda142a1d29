//! Safe RAII wrapper around `llama_model`.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char};
use std::path::Path;
use std::ptr;

use tracing::{debug, info};

use crate::error::{LlamaError, Result};
use crate::token::{self, LlamaToken};
use crate::vocab::Vocab;

/// Owns a `llama_model` pointer and frees it on drop.
pub struct LlamaModel {
    ptr: *mut llama_sys::llama_model,
}

// Safety: llama_model is internally read-only after creation.
unsafe impl Send for LlamaModel {}
unsafe impl Sync for LlamaModel {}

impl std::fmt::Debug for LlamaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaModel")
            .field("desc", &self.desc())
            .field("n_params", &self.n_params())
            .finish()
    }
}

impl LlamaModel {
    /// Load a GGUF model from `path`.
    pub fn load_from_file(path: &Path, params: &ModelParams) -> Result<Self> {
        let path_str = path.to_str().ok_or_else(|| LlamaError::ModelLoadFailed {
            path: path.display().to_string(),
            reason: "Invalid UTF-8 in path".into(),
        })?;
        if !path.exists() {
            return Err(LlamaError::ModelLoadFailed {
                path: path_str.into(),
                reason: "file not found".into(),
            });
        }
        let c_path = CString::new(path_str).map_err(|_| LlamaError::ModelLoadFailed {
            path: path_str.into(),
            reason: "Path contains null byte".into(),
        })?;

        let raw = params.to_raw();

        info!(path = %path.display(), n_gpu_layers = params.n_gpu_layers, "Loading model…");
        let model = unsafe { llama_sys::llama_model_load_from_file(c_path.as_ptr(), raw) };

        if model.is_null() {
            return Err(LlamaError::ModelLoadFailed {
                path: path_str.into(),
                reason: "llama_model_load_from_file returned null".into(),
            });
        }

        let model = Self { ptr: model };
        info!(path = %path.display(), desc = %model.desc(), "Model loaded");
        Ok(model)
    }

    //  Accessors

    pub(crate) fn as_ptr(&self) -> *mut llama_sys::llama_model {
        self.ptr
    }

    /// Vocabulary handle (valid for the lifetime of the model).
    pub fn vocab(&self) -> Vocab<'_> {
        Vocab::new(self)
    }

    pub fn n_params(&self) -> u64 {
        unsafe { llama_sys::llama_model_n_params(self.ptr) }
    }

    /// Total size of all tensors in bytes.
    pub fn size(&self) -> u64 {
        unsafe { llama_sys::llama_model_size(self.ptr) }
    }

    pub fn desc(&self) -> String {
        read_c_string(256, |buf, len| unsafe {
            llama_sys::llama_model_desc(self.ptr, buf, len)
        })
        .unwrap_or_default()
    }

    pub fn n_ctx_train(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(self.ptr) }
    }

    pub fn n_embd(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_embd(self.ptr) }
    }

    pub fn n_layer(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_layer(self.ptr) }
    }

    pub fn n_head(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_head(self.ptr) }
    }

    pub fn n_head_kv(&self) -> i32 {
        unsafe { llama_sys::llama_model_n_head_kv(self.ptr) }
    }

    /// Raw `llama_rope_type` value (-1 = none).
    pub fn rope_type(&self) -> i32 {
        unsafe { llama_sys::llama_model_rope_type(self.ptr) as i32 }
    }

    pub fn rope_freq_scale_train(&self) -> f32 {
        unsafe { llama_sys::llama_model_rope_freq_scale_train(self.ptr) }
    }

    pub fn has_encoder(&self) -> bool {
        unsafe { llama_sys::llama_model_has_encoder(self.ptr) }
    }

    pub fn has_decoder(&self) -> bool {
        unsafe { llama_sys::llama_model_has_decoder(self.ptr) }
    }

    /// Recurrent architectures (Mamba, RWKV) cannot rewind their memory.
    pub fn is_recurrent(&self) -> bool {
        unsafe { llama_sys::llama_model_is_recurrent(self.ptr) }
    }

    /// Token the decoder starts from in encoder-decoder models.
    pub fn decoder_start_token(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_model_decoder_start_token(self.ptr) })
    }

    /// Built-in chat template. `name` selects a named variant
    /// (e.g. `"tool_use"`); `None` is the default template.
    pub fn chat_template(&self, name: Option<&str>) -> Option<String> {
        let c_name = match name {
            Some(n) => Some(CString::new(n).ok()?),
            None => None,
        };
        let name_ptr = c_name.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        unsafe {
            let p = llama_sys::llama_model_chat_template(self.ptr, name_ptr);
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    //  Metadata

    /// Read an arbitrary metadata string by key.
    pub fn meta_val_str(&self, key: &str) -> Option<String> {
        let c_key = CString::new(key).ok()?;
        read_c_string(128, |buf, len| unsafe {
            llama_sys::llama_model_meta_val_str(self.ptr, c_key.as_ptr(), buf, len)
        })
    }

    pub fn meta_count(&self) -> i32 {
        unsafe { llama_sys::llama_model_meta_count(self.ptr) }
    }

    pub fn meta_key_by_index(&self, i: i32) -> Option<String> {
        read_c_string(128, |buf, len| unsafe {
            llama_sys::llama_model_meta_key_by_index(self.ptr, i, buf, len)
        })
    }

    pub fn meta_val_str_by_index(&self, i: i32) -> Option<String> {
        read_c_string(128, |buf, len| unsafe {
            llama_sys::llama_model_meta_val_str_by_index(self.ptr, i, buf, len)
        })
    }

    /// All metadata key/value pairs.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        (0..self.meta_count())
            .filter_map(|i| Some((self.meta_key_by_index(i)?, self.meta_val_str_by_index(i)?)))
            .collect()
    }

    //  Vocabulary helpers

    pub fn n_vocab(&self) -> i32 {
        self.vocab().n_tokens()
    }
    pub fn token_bos(&self) -> Option<LlamaToken> {
        self.vocab().bos()
    }
    pub fn token_eos(&self) -> Option<LlamaToken> {
        self.vocab().eos()
    }
    pub fn token_eot(&self) -> Option<LlamaToken> {
        self.vocab().eot()
    }
    pub fn is_eog(&self, token: LlamaToken) -> bool {
        self.vocab().is_eog(token)
    }

    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<LlamaToken>> {
        token::tokenize(&self.vocab(), text, add_special, parse_special)
    }

    pub fn token_to_piece(&self, token: LlamaToken, special: bool) -> String {
        token::token_to_piece(&self.vocab(), token, special)
    }

    pub fn detokenize(&self, tokens: &[LlamaToken], remove_special: bool, unparse_special: bool) -> Result<String> {
        token::detokenize(&self.vocab(), tokens, remove_special, unparse_special)
    }
}

impl Drop for LlamaModel {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!("Freeing llama model");
            unsafe { llama_sys::llama_model_free(self.ptr) }
        }
    }
}

/// Call an `snprintf`-style getter, growing the buffer once if the value
/// was truncated. Negative returns mean "not found".
fn read_c_string(initial: usize, f: impl Fn(*mut c_char, usize) -> i32) -> Option<String> {
    let mut buf = vec![0u8; initial];
    let len = f(buf.as_mut_ptr() as *mut c_char, buf.len());
    if len < 0 {
        return None;
    }
    let len = len as usize;
    if len >= buf.len() {
        buf.resize(len + 1, 0);
        f(buf.as_mut_ptr() as *mut c_char, buf.len());
    }
    buf.truncate(len);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

//  ModelParams

/// How layers are spread over several GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Single GPU (`main_gpu`).
    None,
    /// Split layers and KV across GPUs.
    #[default]
    Layer,
    /// Split rows across GPUs.
    Row,
}

impl SplitMode {
    fn as_raw(self) -> llama_sys::llama_split_mode {
        match self {
            Self::None => 0,
            Self::Layer => 1,
            Self::Row => 2,
        }
    }
}

/// Parameters for [`LlamaModel::load_from_file`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelParams {
    /// Layers to offload to GPU. -1 = all.
    #[serde(default = "default_gpu_layers")]
    pub n_gpu_layers: i32,
    #[serde(default)]
    pub split_mode: SplitMode,
    #[serde(default)]
    pub main_gpu: i32,
    /// Only load the vocabulary, no weights.
    #[serde(default)]
    pub vocab_only: bool,
    /// Use memory-mapped I/O.
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    /// Lock model memory (prevent swapping).
    #[serde(default)]
    pub use_mlock: bool,
    /// Validate tensor data while loading.
    #[serde(default)]
    pub check_tensors: bool,
}

fn default_gpu_layers() -> i32 {
    -1
}
fn default_true() -> bool {
    true
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: default_gpu_layers(),
            split_mode: SplitMode::default(),
            main_gpu: 0,
            vocab_only: false,
            use_mmap: true,
            use_mlock: false,
            check_tensors: false,
        }
    }
}

impl ModelParams {
    pub(crate) fn to_raw(&self) -> llama_sys::llama_model_params {
        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = self.n_gpu_layers;
        raw.split_mode = self.split_mode.as_raw();
        raw.main_gpu = self.main_gpu;
        raw.vocab_only = self.vocab_only;
        raw.use_mmap = self.use_mmap;
        raw.use_mlock = self.use_mlock;
        raw.check_tensors = self.check_tensors;
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_params_serde_defaults() {
        let p: ModelParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.n_gpu_layers, -1);
        assert!(p.use_mmap);
        assert_eq!(p.split_mode, SplitMode::Layer);

        let p: ModelParams =
            serde_json::from_str(r#"{"n_gpu_layers": 0, "split_mode": "row"}"#).unwrap();
        assert_eq!(p.n_gpu_layers, 0);
        assert_eq!(p.split_mode, SplitMode::Row);
    }

    #[test]
    fn test_model_params_to_raw() {
        let params = ModelParams {
            n_gpu_layers: 7,
            vocab_only: true,
            use_mmap: false,
            ..Default::default()
        };
        let raw = params.to_raw();
        assert_eq!(raw.n_gpu_layers, 7);
        assert!(raw.vocab_only);
        assert!(!raw.use_mmap);
    }

    #[test]
    fn test_load_missing_file() {
        let err = LlamaModel::load_from_file(Path::new("/nonexistent/model.gguf"), &ModelParams::default())
            .unwrap_err();
        match err {
            LlamaError::ModelLoadFailed { reason, .. } => assert_eq!(reason, "file not found"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_c_string_grows_buffer() {
        let value = "a fairly long metadata value";
        let got = read_c_string(4, |buf, len| {
            let bytes = value.as_bytes();
            let n = bytes.len().min(len.saturating_sub(1));
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n) };
            bytes.len() as i32
        });
        assert_eq!(got.as_deref(), Some(value));
        assert_eq!(read_c_string(4, |_, _| -1), None);
    }
}
