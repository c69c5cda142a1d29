//! Safe wrapper around `llama_batch`.
//!
//! A batch either owns its buffers (allocated by `llama_batch_init`, freed
//! on drop) or is a read-only view over a caller's token slice
//! (`llama_batch_get_one`), in which case nothing is freed and the slice
//! must outlive the batch.

use std::marker::PhantomData;

use crate::error::{LlamaError, Result};
use crate::token::LlamaToken;

pub struct LlamaBatch<'a> {
    inner: llama_sys::llama_batch,
    capacity: usize,
    n_seq_max: usize,
    /// Embedding width; 0 for token batches.
    n_embd: usize,
    /// `true` when we own the internal allocations (and must free them).
    owned: bool,
    _tokens: PhantomData<&'a [LlamaToken]>,
}

// Safety: the raw buffers are either owned exclusively by this value or
// borrowed immutably for 'a.
unsafe impl Send for LlamaBatch<'_> {}

impl std::fmt::Debug for LlamaBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaBatch")
            .field("n_tokens", &self.inner.n_tokens)
            .field("capacity", &self.capacity)
            .field("n_embd", &self.n_embd)
            .field("owned", &self.owned)
            .finish()
    }
}

impl LlamaBatch<'static> {
    /// Allocate a token batch with room for `n_tokens_max` tokens, each
    /// belonging to at most `n_seq_max` sequences.
    pub fn new(n_tokens_max: usize, n_seq_max: usize) -> Result<Self> {
        Self::alloc(n_tokens_max, 0, n_seq_max)
    }

    /// Allocate an embedding batch: each entry is an `n_embd`-wide vector
    /// instead of a token id.
    pub fn new_embd(n_tokens_max: usize, n_embd: usize, n_seq_max: usize) -> Result<Self> {
        Self::alloc(n_tokens_max, n_embd, n_seq_max)
    }

    fn alloc(n_tokens_max: usize, n_embd: usize, n_seq_max: usize) -> Result<Self> {
        let n_tokens_max = n_tokens_max.max(1);
        let n_seq_max = n_seq_max.max(1);
        let native = (
            native_dim(n_tokens_max, "token capacity")?,
            native_dim(n_embd, "embedding width")?,
            native_dim(n_seq_max, "sequence count")?,
        );
        // llama_batch_init sizes the float buffer as n_tokens * n_embd.
        if n_tokens_max
            .checked_mul(n_embd)
            .and_then(|n| n.checked_mul(size_of::<f32>()))
            .is_none()
        {
            return Err(LlamaError::InvalidArgument(format!(
                "embedding batch of {n_tokens_max} x {n_embd} is too large"
            )));
        }
        let inner = unsafe { llama_sys::llama_batch_init(native.0, native.1, native.2) };
        let data = if n_embd == 0 {
            inner.token.is_null()
        } else {
            inner.embd.is_null()
        };
        if data || inner.pos.is_null() || inner.seq_id.is_null() || inner.logits.is_null() {
            unsafe { llama_sys::llama_batch_free(inner) };
            return Err(LlamaError::NullPointer("llama_batch_init"));
        }
        Ok(Self {
            inner,
            capacity: n_tokens_max,
            n_seq_max,
            n_embd,
            owned: true,
            _tokens: PhantomData,
        })
    }
}

/// Batch dimensions are C ints.
fn native_dim(n: usize, what: &str) -> Result<i32> {
    i32::try_from(n).map_err(|_| LlamaError::InvalidArgument(format!("{what} {n} exceeds i32::MAX")))
}

impl<'a> LlamaBatch<'a> {
    /// Wrap `tokens` as a single-sequence batch. Positions are assigned by
    /// llama.cpp from the current memory state and only the last token
    /// produces logits.
    pub fn get_one(tokens: &'a [LlamaToken]) -> Result<Self> {
        if tokens.is_empty() {
            return Err(LlamaError::InvalidArgument("empty token slice".into()));
        }
        let n = i32::try_from(tokens.len())
            .map_err(|_| LlamaError::InvalidArgument("too many tokens for one batch".into()))?;
        // llama_batch_get_one takes a mutable pointer but never writes through it.
        let inner = unsafe { llama_sys::llama_batch_get_one(tokens.as_ptr() as *mut i32, n) };
        Ok(Self {
            inner,
            capacity: tokens.len(),
            n_seq_max: 1,
            n_embd: 0,
            owned: false,
            _tokens: PhantomData,
        })
    }

    /// Return the raw batch struct (passed by value, `Copy` in C).
    pub(crate) fn raw(&self) -> llama_sys::llama_batch {
        self.inner
    }

    /// Number of tokens currently stored.
    pub fn n_tokens(&self) -> usize {
        self.inner.n_tokens as usize
    }

    pub fn is_empty(&self) -> bool {
        self.inner.n_tokens == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Token ids stored so far (empty for embedding batches).
    pub fn tokens(&self) -> &[LlamaToken] {
        if self.inner.token.is_null() || self.is_empty() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.inner.token.cast(), self.n_tokens()) }
    }

    /// Explicit positions, or `None` when llama.cpp assigns them.
    pub fn positions(&self) -> Option<&[i32]> {
        if self.inner.pos.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.inner.pos, self.n_tokens()) })
    }

    /// Number of entries that request output logits. A view produced by
    /// [`get_one`](Self::get_one) always outputs exactly its last token.
    pub fn logits_count(&self) -> usize {
        if self.inner.logits.is_null() {
            return usize::from(!self.is_empty());
        }
        let flags = unsafe { std::slice::from_raw_parts(self.inner.logits, self.n_tokens()) };
        flags.iter().filter(|&&f| f != 0).count()
    }

    /// Remove all tokens. Views are not affected.
    pub fn clear(&mut self) {
        if self.owned {
            self.inner.n_tokens = 0;
        }
    }

    fn check_push(&self, seq_ids: &[i32]) -> Result<usize> {
        if !self.owned {
            return Err(LlamaError::InvalidArgument(
                "batch is a read-only view over borrowed tokens".into(),
            ));
        }
        let i = self.n_tokens();
        if i >= self.capacity {
            return Err(LlamaError::BatchCapacityExceeded {
                capacity: self.capacity,
            });
        }
        if seq_ids.is_empty() || seq_ids.len() > self.n_seq_max {
            return Err(LlamaError::InvalidArgument(format!(
                "expected 1..={} sequence ids, got {}",
                self.n_seq_max,
                seq_ids.len()
            )));
        }
        Ok(i)
    }

    /// Write the per-entry metadata shared by token and embedding entries.
    ///
    /// Safety: `i < capacity` and `seq_ids.len() <= n_seq_max`.
    unsafe fn write_meta(&mut self, i: usize, pos: i32, seq_ids: &[i32], logits: bool) {
        unsafe {
            *self.inner.pos.add(i) = pos;
            *self.inner.n_seq_id.add(i) = seq_ids.len() as i32;
            for (j, &sid) in seq_ids.iter().enumerate() {
                *(*self.inner.seq_id.add(i)).add(j) = sid;
            }
            *self.inner.logits.add(i) = i8::from(logits);
        }
    }

    /// Push a token into the batch.
    ///
    /// * `token`: token id
    /// * `pos`: absolute position
    /// * `seq_ids`: sequence ids this token belongs to
    /// * `logits`: request logits output for this position
    pub fn add(&mut self, token: LlamaToken, pos: i32, seq_ids: &[i32], logits: bool) -> Result<()> {
        if self.n_embd != 0 {
            return Err(LlamaError::InvalidArgument(
                "cannot add a token to an embedding batch".into(),
            ));
        }
        let i = self.check_push(seq_ids)?;
        unsafe {
            *self.inner.token.add(i) = token.0;
            self.write_meta(i, pos, seq_ids, logits);
        }
        self.inner.n_tokens += 1;
        Ok(())
    }

    /// Push an embedding vector of exactly `n_embd` floats.
    pub fn add_embd(&mut self, embd: &[f32], pos: i32, seq_ids: &[i32], logits: bool) -> Result<()> {
        if self.n_embd == 0 || embd.len() != self.n_embd {
            return Err(LlamaError::InvalidArgument(format!(
                "embedding width {} does not match batch width {}",
                embd.len(),
                self.n_embd
            )));
        }
        let i = self.check_push(seq_ids)?;
        unsafe {
            std::ptr::copy_nonoverlapping(embd.as_ptr(), self.inner.embd.add(i * self.n_embd), self.n_embd);
            self.write_meta(i, pos, seq_ids, logits);
        }
        self.inner.n_tokens += 1;
        Ok(())
    }

    /// Append `tokens` to sequence `seq_id` at positions `pos0..`. Only the
    /// last token requests logits unless `logits_all` is set. Nothing is
    /// written when the tokens do not fit or the positions overflow.
    pub fn add_sequence(&mut self, tokens: &[LlamaToken], pos0: i32, seq_id: i32, logits_all: bool) -> Result<()> {
        if self.n_tokens() + tokens.len() > self.capacity {
            return Err(LlamaError::BatchCapacityExceeded {
                capacity: self.capacity,
            });
        }
        let overflow = || LlamaError::InvalidArgument(format!("positions from {pos0} overflow i32"));
        let span = i32::try_from(tokens.len()).map_err(|_| overflow())?;
        if span > 0 {
            pos0.checked_add(span - 1).ok_or_else(overflow)?;
        }
        let last = tokens.len().saturating_sub(1);
        for (i, &tok) in tokens.iter().enumerate() {
            self.add(tok, pos0 + i as i32, &[seq_id], logits_all || i == last)?;
        }
        Ok(())
    }

    /// Request logits for the last entry only.
    pub fn set_logits_last(&mut self) {
        let n = self.n_tokens();
        if !self.owned || n == 0 {
            return;
        }
        unsafe {
            for i in 0..n {
                *self.inner.logits.add(i) = 0;
            }
            *self.inner.logits.add(n - 1) = 1;
        }
    }
}

impl Drop for LlamaBatch<'_> {
    fn drop(&mut self) {
        if self.owned {
            unsafe { llama_sys::llama_batch_free(self.inner) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(ids: &[i32]) -> Vec<LlamaToken> {
        ids.iter().copied().map(LlamaToken).collect()
    }

    #[test]
    fn test_add_and_clear() {
        let mut batch = LlamaBatch::new(4, 1).unwrap();
        assert!(batch.is_empty());
        batch.add(LlamaToken(10), 0, &[0], false).unwrap();
        batch.add(LlamaToken(11), 1, &[0], true).unwrap();

        assert_eq!(batch.n_tokens(), 2);
        assert_eq!(batch.tokens(), &toks(&[10, 11])[..]);
        assert_eq!(batch.positions(), Some(&[0, 1][..]));
        assert_eq!(batch.logits_count(), 1);

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.capacity(), 4);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut batch = LlamaBatch::new(1, 1).unwrap();
        batch.add(LlamaToken(1), 0, &[0], true).unwrap();
        let err = batch.add(LlamaToken(2), 1, &[0], true).unwrap_err();
        assert!(matches!(err, LlamaError::BatchCapacityExceeded { capacity: 1 }));
    }

    #[test]
    fn test_seq_id_count_is_enforced() {
        let mut batch = LlamaBatch::new(4, 2).unwrap();
        batch.add(LlamaToken(1), 0, &[0, 1], false).unwrap();
        assert!(batch.add(LlamaToken(1), 1, &[0, 1, 2], false).is_err());
        assert!(batch.add(LlamaToken(1), 1, &[], false).is_err());
    }

    #[test]
    fn test_add_sequence_marks_last_logits() {
        let mut batch = LlamaBatch::new(8, 1).unwrap();
        batch.add_sequence(&toks(&[5, 6, 7]), 10, 0, false).unwrap();
        assert_eq!(batch.positions(), Some(&[10, 11, 12][..]));
        assert_eq!(batch.logits_count(), 1);

        let err = batch.add_sequence(&toks(&[1; 6]), 13, 0, false).unwrap_err();
        assert!(matches!(err, LlamaError::BatchCapacityExceeded { .. }));
        // Nothing from the rejected sequence was written.
        assert_eq!(batch.n_tokens(), 3);
    }

    #[test]
    fn test_add_sequence_rejects_position_overflow() {
        let mut batch = LlamaBatch::new(4, 1).unwrap();
        let err = batch.add_sequence(&toks(&[1, 2]), i32::MAX, 0, false).unwrap_err();
        assert!(matches!(err, LlamaError::InvalidArgument(_)));
        assert!(batch.is_empty());

        batch.add_sequence(&toks(&[1]), i32::MAX, 0, false).unwrap();
        assert_eq!(batch.positions(), Some(&[i32::MAX][..]));
    }

    #[test]
    fn test_oversized_dimensions_are_rejected() {
        let huge = i32::MAX as usize + 2;
        assert!(matches!(LlamaBatch::new(huge, 1), Err(LlamaError::InvalidArgument(_))));
        assert!(matches!(LlamaBatch::new(4, huge), Err(LlamaError::InvalidArgument(_))));
        assert!(matches!(LlamaBatch::new_embd(4, huge, 1), Err(LlamaError::InvalidArgument(_))));
        assert_eq!(native_dim(i32::MAX as usize, "n").unwrap(), i32::MAX);
    }

    #[test]
    fn test_set_logits_last() {
        let mut batch = LlamaBatch::new(4, 1).unwrap();
        batch.add_sequence(&toks(&[1, 2, 3]), 0, 0, true).unwrap();
        assert_eq!(batch.logits_count(), 3);
        batch.set_logits_last();
        assert_eq!(batch.logits_count(), 1);
    }

    #[test]
    fn test_get_one_is_a_borrowed_view() {
        let tokens = toks(&[1, 2, 3]);
        let mut view = LlamaBatch::get_one(&tokens).unwrap();
        assert!(!view.is_owned());
        assert_eq!(view.n_tokens(), 3);
        assert_eq!(view.tokens(), &tokens[..]);
        assert_eq!(view.positions(), None);
        assert_eq!(view.logits_count(), 1);
        assert!(view.add(LlamaToken(4), 3, &[0], true).is_err());
        view.clear();
        assert_eq!(view.n_tokens(), 3);
    }

    #[test]
    fn test_get_one_rejects_empty() {
        assert!(LlamaBatch::get_one(&[]).is_err());
    }

    #[test]
    fn test_embedding_batch() {
        let mut batch = LlamaBatch::new_embd(2, 3, 1).unwrap();
        batch.add_embd(&[0.1, 0.2, 0.3], 0, &[0], true).unwrap();
        assert_eq!(batch.n_tokens(), 1);
        assert!(batch.tokens().is_empty());
        assert!(batch.add_embd(&[0.1, 0.2], 1, &[0], true).is_err());
        assert!(batch.add(LlamaToken(1), 1, &[0], true).is_err());
    }
}
