//! Saving and restoring context state (KV cache, logits, embeddings).

use std::ffi::CString;
use std::path::Path;

use tracing::debug;

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::token::{LlamaToken, as_raw_tokens};

/// In-memory snapshot of a context.
///
/// Carries the tokens it covers so the caller can resume generation, and
/// the context size it was taken with.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContextState {
    pub n_ctx: u32,
    pub tokens: Vec<LlamaToken>,
    pub data: Vec<u8>,
}

impl ContextState {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

fn c_path(path: &Path) -> Result<CString> {
    let s = path
        .to_str()
        .ok_or_else(|| LlamaError::InvalidArgument(format!("non UTF-8 path {}", path.display())))?;
    Ok(CString::new(s)?)
}

impl LlamaContext {
    /// Upper bound of the serialised state size in bytes.
    pub fn state_size(&self) -> usize {
        unsafe { llama_sys::llama_state_get_size(self.as_ptr()) }
    }

    /// Snapshot the whole context; `tokens` are the tokens currently in
    /// the cache.
    pub fn save_state(&self, tokens: &[LlamaToken]) -> Result<ContextState> {
        let mut data = vec![0u8; self.state_size()];
        let written =
            unsafe { llama_sys::llama_state_get_data(self.as_ptr(), data.as_mut_ptr(), data.len()) };
        if written == 0 {
            return Err(LlamaError::StateSaveFailed("llama_state_get_data wrote 0 bytes".into()));
        }
        data.truncate(written);
        debug!(bytes = written, tokens = tokens.len(), "Context state saved");
        Ok(ContextState {
            n_ctx: self.n_ctx(),
            tokens: tokens.to_vec(),
            data,
        })
    }

    /// Restore a snapshot taken by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, state: &ContextState) -> Result<()> {
        if state.tokens.len() > self.n_ctx() as usize {
            return Err(LlamaError::StateLoadFailed(format!(
                "state covers {} tokens but context holds {}",
                state.tokens.len(),
                self.n_ctx()
            )));
        }
        let read = unsafe {
            llama_sys::llama_state_set_data(self.as_ptr(), state.data.as_ptr(), state.data.len())
        };
        if read != state.data.len() {
            return Err(LlamaError::StateLoadFailed(format!(
                "read {read} of {} bytes",
                state.data.len()
            )));
        }
        debug!(bytes = read, "Context state restored");
        Ok(())
    }

    /// Write the context state plus `tokens` to a session file.
    pub fn save_state_file(&self, path: &Path, tokens: &[LlamaToken]) -> Result<()> {
        let c_path = c_path(path)?;
        let raw = as_raw_tokens(tokens);
        let ok = unsafe {
            llama_sys::llama_state_save_file(self.as_ptr(), c_path.as_ptr(), raw.as_ptr(), raw.len())
        };
        if !ok {
            return Err(LlamaError::StateSaveFailed(format!("{}", path.display())));
        }
        Ok(())
    }

    /// Load a session file; returns the stored tokens (at most
    /// `token_capacity`, typically `n_ctx`).
    pub fn load_state_file(&mut self, path: &Path, token_capacity: usize) -> Result<Vec<LlamaToken>> {
        let c_path = c_path(path)?;
        let mut tokens: Vec<i32> = vec![0; token_capacity];
        let mut n_out = 0usize;
        let ok = unsafe {
            llama_sys::llama_state_load_file(
                self.as_ptr(),
                c_path.as_ptr(),
                tokens.as_mut_ptr(),
                tokens.len(),
                &mut n_out,
            )
        };
        if !ok {
            return Err(LlamaError::StateLoadFailed(format!("{}", path.display())));
        }
        tokens.truncate(n_out);
        Ok(tokens.into_iter().map(LlamaToken).collect())
    }

    //  Per-sequence state

    pub fn seq_state_size(&self, seq_id: i32) -> usize {
        unsafe { llama_sys::llama_state_seq_get_size(self.as_ptr(), seq_id) }
    }

    /// Serialise the cache cells of one sequence.
    pub fn save_seq_state(&self, seq_id: i32) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.seq_state_size(seq_id)];
        let written = unsafe {
            llama_sys::llama_state_seq_get_data(self.as_ptr(), data.as_mut_ptr(), data.len(), seq_id)
        };
        if written == 0 {
            return Err(LlamaError::StateSaveFailed(format!("sequence {seq_id} is empty")));
        }
        data.truncate(written);
        Ok(data)
    }

    /// Restore sequence data into `dest_seq_id`.
    pub fn load_seq_state(&mut self, data: &[u8], dest_seq_id: i32) -> Result<()> {
        let read = unsafe {
            llama_sys::llama_state_seq_set_data(self.as_ptr(), data.as_ptr(), data.len(), dest_seq_id)
        };
        if read == 0 {
            return Err(LlamaError::StateLoadFailed(format!(
                "could not restore sequence {dest_seq_id}"
            )));
        }
        Ok(())
    }

    pub fn save_seq_state_file(&self, path: &Path, seq_id: i32, tokens: &[LlamaToken]) -> Result<usize> {
        let c_path = c_path(path)?;
        let raw = as_raw_tokens(tokens);
        let written = unsafe {
            llama_sys::llama_state_seq_save_file(
                self.as_ptr(),
                c_path.as_ptr(),
                seq_id,
                raw.as_ptr(),
                raw.len(),
            )
        };
        if written == 0 {
            return Err(LlamaError::StateSaveFailed(format!("{}", path.display())));
        }
        Ok(written)
    }

    pub fn load_seq_state_file(
        &mut self,
        path: &Path,
        dest_seq_id: i32,
        token_capacity: usize,
    ) -> Result<Vec<LlamaToken>> {
        let c_path = c_path(path)?;
        let mut tokens: Vec<i32> = vec![0; token_capacity];
        let mut n_out = 0usize;
        let read = unsafe {
            llama_sys::llama_state_seq_load_file(
                self.as_ptr(),
                c_path.as_ptr(),
                dest_seq_id,
                tokens.as_mut_ptr(),
                tokens.len(),
                &mut n_out,
            )
        };
        if read == 0 {
            return Err(LlamaError::StateLoadFailed(format!("{}", path.display())));
        }
        tokens.truncate(n_out);
        Ok(tokens.into_iter().map(LlamaToken).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_roundtrip_keeps_tokens() {
        let state = ContextState {
            n_ctx: 512,
            tokens: vec![LlamaToken(1), LlamaToken(42)],
            data: vec![0xde, 0xad],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"tokens\":[1,42]"));
        let back: ContextState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.size(), 2);
    }

    #[test]
    fn test_c_path_rejects_nul() {
        assert!(c_path(Path::new("a\0b")).is_err());
        assert!(c_path(Path::new("/tmp/session.bin")).is_ok());
    }
}
