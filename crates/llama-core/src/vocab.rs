//! Borrowed view of a model's vocabulary.

use std::ffi::CStr;
use std::marker::PhantomData;

use crate::error::Result;
use crate::model::LlamaModel;
use crate::token::{self, LlamaToken};

/// Vocabulary handle. Owned by the model; the lifetime ties it there.
#[derive(Clone, Copy)]
pub struct Vocab<'a> {
    ptr: *const llama_sys::llama_vocab,
    _model: PhantomData<&'a LlamaModel>,
}

impl std::fmt::Debug for Vocab<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocab")
            .field("n_tokens", &self.n_tokens())
            .field("type", &self.vocab_type())
            .finish()
    }
}

impl<'a> Vocab<'a> {
    pub(crate) fn new(model: &'a LlamaModel) -> Self {
        let ptr = unsafe { llama_sys::llama_model_get_vocab(model.as_ptr()) };
        Self {
            ptr,
            _model: PhantomData,
        }
    }

    pub(crate) fn as_ptr(&self) -> *const llama_sys::llama_vocab {
        self.ptr
    }

    pub fn n_tokens(&self) -> i32 {
        unsafe { llama_sys::llama_vocab_n_tokens(self.ptr) }
    }

    pub fn vocab_type(&self) -> VocabType {
        VocabType::from_raw(unsafe { llama_sys::llama_vocab_type(self.ptr) })
    }

    //  Special tokens

    pub fn bos(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_bos(self.ptr) })
    }
    pub fn eos(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_eos(self.ptr) })
    }
    pub fn eot(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_eot(self.ptr) })
    }
    pub fn sep(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_sep(self.ptr) })
    }
    pub fn nl(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_nl(self.ptr) })
    }
    pub fn pad(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_pad(self.ptr) })
    }

    // Fill-in-the-middle
    pub fn fim_pre(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_pre(self.ptr) })
    }
    pub fn fim_suf(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_suf(self.ptr) })
    }
    pub fn fim_mid(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_mid(self.ptr) })
    }
    pub fn fim_pad(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_pad(self.ptr) })
    }
    pub fn fim_rep(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_rep(self.ptr) })
    }
    pub fn fim_sep(&self) -> Option<LlamaToken> {
        LlamaToken::from_raw(unsafe { llama_sys::llama_vocab_fim_sep(self.ptr) })
    }

    /// Whether tokenization with `add_special` prepends BOS.
    pub fn add_bos(&self) -> bool {
        unsafe { llama_sys::llama_vocab_get_add_bos(self.ptr) }
    }

    pub fn add_eos(&self) -> bool {
        unsafe { llama_sys::llama_vocab_get_add_eos(self.ptr) }
    }

    /// End-of-generation check (EOS, EOT, and any model-specific stop ids).
    pub fn is_eog(&self, token: LlamaToken) -> bool {
        unsafe { llama_sys::llama_vocab_is_eog(self.ptr, token.0) }
    }

    pub fn is_control(&self, token: LlamaToken) -> bool {
        unsafe { llama_sys::llama_vocab_is_control(self.ptr, token.0) }
    }

    //  Per-token data

    /// Raw vocabulary text of a token (not the rendered piece).
    pub fn text(&self, token: LlamaToken) -> Option<String> {
        if !self.contains(token) {
            return None;
        }
        unsafe {
            let p = llama_sys::llama_vocab_get_text(self.ptr, token.0);
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    pub fn score(&self, token: LlamaToken) -> Option<f32> {
        self.contains(token)
            .then(|| unsafe { llama_sys::llama_vocab_get_score(self.ptr, token.0) })
    }

    pub fn attr(&self, token: LlamaToken) -> Option<TokenAttrs> {
        self.contains(token).then(|| {
            TokenAttrs(unsafe { llama_sys::llama_vocab_get_attr(self.ptr, token.0) } as u32)
        })
    }

    fn contains(&self, token: LlamaToken) -> bool {
        token.0 >= 0 && token.0 < self.n_tokens()
    }

    //  Convenience wrappers over `crate::token`

    pub fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<LlamaToken>> {
        token::tokenize(self, text, add_special, parse_special)
    }

    pub fn token_to_piece(&self, token: LlamaToken, special: bool) -> String {
        token::token_to_piece(self, token, special)
    }

    pub fn detokenize(&self, tokens: &[LlamaToken], remove_special: bool, unparse_special: bool) -> Result<String> {
        token::detokenize(self, tokens, remove_special, unparse_special)
    }
}

//  VocabType

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VocabType {
    None,
    /// SentencePiece (byte-level BPE with byte fallback).
    Spm,
    /// GPT-2 style byte-level BPE.
    Bpe,
    /// BERT WordPiece.
    Wpm,
    /// T5 Unigram.
    Ugm,
    Rwkv,
    Plamo2,
    Unknown(u32),
}

impl VocabType {
    fn from_raw(raw: llama_sys::llama_vocab_type) -> Self {
        match raw as u32 {
            0 => Self::None,
            1 => Self::Spm,
            2 => Self::Bpe,
            3 => Self::Wpm,
            4 => Self::Ugm,
            5 => Self::Rwkv,
            6 => Self::Plamo2,
            other => Self::Unknown(other),
        }
    }
}

//  TokenAttrs

/// Bit set of `llama_token_attr` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenAttrs(pub u32);

impl TokenAttrs {
    pub const UNKNOWN: u32 = 1 << 0;
    pub const UNUSED: u32 = 1 << 1;
    pub const NORMAL: u32 = 1 << 2;
    pub const CONTROL: u32 = 1 << 3;
    pub const USER_DEFINED: u32 = 1 << 4;
    pub const BYTE: u32 = 1 << 5;
    pub const NORMALIZED: u32 = 1 << 6;
    pub const LSTRIP: u32 = 1 << 7;
    pub const RSTRIP: u32 = 1 << 8;
    pub const SINGLE_WORD: u32 = 1 << 9;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn is_control(self) -> bool {
        self.contains(Self::CONTROL)
    }

    pub fn is_byte(self) -> bool {
        self.contains(Self::BYTE)
    }
}
