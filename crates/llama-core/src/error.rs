use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Failed to create context: {0}")]
    ContextCreationFailed(String),

    #[error("Decode failed with code {0}")]
    DecodeFailed(i32),

    #[error("Encode failed with code {0}")]
    EncodeFailed(i32),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Detokenization failed: {0}")]
    DetokenizationFailed(String),

    #[error("Chat template error: {0}")]
    ChatTemplate(String),

    #[error("Sampler error: {0}")]
    SamplerError(String),

    #[error("Batch capacity ({capacity}) exceeded")]
    BatchCapacityExceeded { capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to save state: {0}")]
    StateSaveFailed(String),

    #[error("Failed to load state: {0}")]
    StateLoadFailed(String),

    #[error("LoRA adapter error: {0}")]
    LoraAdapter(String),

    #[error("Control vector error (code {0})")]
    ControlVector(i32),

    #[error("Quantization failed with code {0}")]
    QuantizeFailed(u32),

    #[error("Null pointer from FFI call: {0}")]
    NullPointer(&'static str),

    #[error("{0}")]
    Other(String),
}

impl LlamaError {
    /// `llama_decode` returns `1` when no KV slot was found for the batch.
    /// The caller can recover by shrinking the batch or freeing cache space.
    pub fn is_no_kv_slot(&self) -> bool {
        matches!(self, Self::DecodeFailed(1))
    }

    /// `llama_decode`/`llama_encode` return `2` when the abort callback fired.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::DecodeFailed(2) | Self::EncodeFailed(2))
    }
}

impl From<std::ffi::NulError> for LlamaError {
    fn from(e: std::ffi::NulError) -> Self {
        Self::InvalidArgument(format!("interior NUL byte at position {}", e.nul_position()))
    }
}

pub type Result<T> = std::result::Result<T, LlamaError>;
