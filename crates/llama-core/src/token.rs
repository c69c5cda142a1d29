//! Tokenization / detokenization helpers.

use std::ffi::CString;
use std::fmt;

use crate::error::{LlamaError, Result};
use crate::vocab::Vocab;

/// A token id in a model's vocabulary.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LlamaToken(pub i32);

impl LlamaToken {
    /// `LLAMA_TOKEN_NULL`: the id llama.cpp uses for "no such token".
    pub const NULL: Self = Self(-1);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn id(self) -> i32 {
        self.0
    }

    pub(crate) fn from_raw(raw: llama_sys::llama_token) -> Option<Self> {
        (raw != Self::NULL.0).then_some(Self(raw))
    }
}

impl fmt::Display for LlamaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for LlamaToken {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

pub(crate) fn as_raw_tokens(tokens: &[LlamaToken]) -> &[llama_sys::llama_token] {
    // SAFETY: `LlamaToken` is `repr(transparent)` over `i32`.
    unsafe { std::slice::from_raw_parts(tokens.as_ptr().cast(), tokens.len()) }
}

fn c_len(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len).map_err(|_| LlamaError::InvalidArgument(format!("{what} too long ({len})")))
}

/// Tokenize `text` using the model's vocabulary.
pub fn tokenize(
    vocab: &Vocab<'_>,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> Result<Vec<LlamaToken>> {
    let c_text = CString::new(text)
        .map_err(|_| LlamaError::TokenizationFailed("text contains null byte".into()))?;
    let text_len = c_len(text.len(), "text")?;

    // Guess generously so most calls need a single round-trip; a negative
    // return is the exact size needed.
    let mut tokens: Vec<llama_sys::llama_token> =
        vec![0; text.len() / 2 + usize::from(add_special) + 8];

    let mut n = unsafe {
        llama_sys::llama_tokenize(
            vocab.as_ptr(),
            c_text.as_ptr(),
            text_len,
            tokens.as_mut_ptr(),
            c_len(tokens.len(), "token buffer")?,
            add_special,
            parse_special,
        )
    };

    if n == i32::MIN {
        return Err(LlamaError::TokenizationFailed(
            "token count overflows i32".into(),
        ));
    }

    if n < 0 {
        tokens.resize(n.unsigned_abs() as usize, 0);
        n = unsafe {
            llama_sys::llama_tokenize(
                vocab.as_ptr(),
                c_text.as_ptr(),
                text_len,
                tokens.as_mut_ptr(),
                c_len(tokens.len(), "token buffer")?,
                add_special,
                parse_special,
            )
        };
        if n < 0 {
            return Err(LlamaError::TokenizationFailed(format!(
                "llama_tokenize returned {n}"
            )));
        }
    }

    tokens.truncate(n as usize);
    Ok(tokens.into_iter().map(LlamaToken).collect())
}

/// Raw bytes of a single token. A piece may end in the middle of a UTF-8
/// sequence; feed it through [`Utf8Decoder`] when streaming.
pub fn token_to_bytes(vocab: &Vocab<'_>, token: LlamaToken, lstrip: i32, special: bool) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    let len = piece_into(vocab, token, &mut buf, lstrip, special);

    let len = if len < 0 {
        buf.resize(len.unsigned_abs() as usize, 0);
        piece_into(vocab, token, &mut buf, lstrip, special)
    } else {
        len
    };

    if len <= 0 {
        return Vec::new();
    }
    buf.truncate(len as usize);
    buf
}

fn piece_into(vocab: &Vocab<'_>, token: LlamaToken, buf: &mut [u8], lstrip: i32, special: bool) -> i32 {
    unsafe {
        llama_sys::llama_token_to_piece(
            vocab.as_ptr(),
            token.0,
            buf.as_mut_ptr() as *mut std::ffi::c_char,
            buf.len() as i32,
            lstrip,
            special,
        )
    }
}

/// Convert a single token id to its text piece (lossy).
pub fn token_to_piece(vocab: &Vocab<'_>, token: LlamaToken, special: bool) -> String {
    String::from_utf8_lossy(&token_to_bytes(vocab, token, 0, special)).into_owned()
}

/// Detokenize a token sequence back to text.
pub fn detokenize(
    vocab: &Vocab<'_>,
    tokens: &[LlamaToken],
    remove_special: bool,
    unparse_special: bool,
) -> Result<String> {
    if tokens.is_empty() {
        return Ok(String::new());
    }

    let raw = as_raw_tokens(tokens);
    let n_tokens = c_len(raw.len(), "token slice")?;
    let mut buf = vec![0u8; tokens.len() * 8];

    let call = |buf: &mut Vec<u8>| unsafe {
        llama_sys::llama_detokenize(
            vocab.as_ptr(),
            raw.as_ptr(),
            n_tokens,
            buf.as_mut_ptr() as *mut std::ffi::c_char,
            buf.len() as i32,
            remove_special,
            unparse_special,
        )
    };

    let mut len = call(&mut buf);
    if len < 0 {
        buf.resize(len.unsigned_abs() as usize, 0);
        len = call(&mut buf);
        if len < 0 {
            return Err(LlamaError::DetokenizationFailed(format!(
                "llama_detokenize returned {len} on retry"
            )));
        }
    }

    buf.truncate(len as usize);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

//  Streaming UTF-8

/// Incremental UTF-8 decoder for token pieces.
///
/// Byte-level vocabularies split multi-byte characters across tokens.
/// Incomplete trailing sequences are held back until the next push;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return all text that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Number of bytes waiting for the rest of their character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush whatever is left, replacing an incomplete tail with U+FFFD.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
