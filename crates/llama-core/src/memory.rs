//! KV cache (llama.cpp "memory") of a context.
//!
//! The handle mutably borrows its [`LlamaContext`], so it cannot outlive
//! the context or be used while a decode is in flight.

use std::marker::PhantomData;

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};

pub struct KvCache<'ctx> {
    mem: llama_sys::llama_memory_t,
    _ctx: PhantomData<&'ctx mut LlamaContext>,
}

impl LlamaContext {
    /// Borrow the context's memory. `None` for models without a cache.
    pub fn memory(&mut self) -> Option<KvCache<'_>> {
        let mem = unsafe { llama_sys::llama_get_memory(self.as_ptr()) };
        if mem.is_null() {
            None
        } else {
            Some(KvCache {
                mem,
                _ctx: PhantomData,
            })
        }
    }

    /// Drop all cached tokens (metadata only; buffers are reused).
    pub fn kv_cache_clear(&mut self) {
        if let Some(mut kv) = self.memory() {
            kv.clear(false);
        }
    }
}

impl KvCache<'_> {
    /// Clear all sequences. With `data`, the buffers are zeroed too.
    pub fn clear(&mut self, data: bool) {
        unsafe { llama_sys::llama_memory_clear(self.mem, data) }
    }

    /// Remove positions `[p0, p1)` of `seq_id`.
    ///
    /// `seq_id < 0` matches every sequence; `p0 < 0` means 0 and `p1 < 0`
    /// means infinity. Returns `false` if a partial sequence cannot be
    /// removed (recurrent models); removing a whole sequence never fails.
    pub fn seq_rm(&mut self, seq_id: i32, p0: i32, p1: i32) -> bool {
        unsafe { llama_sys::llama_memory_seq_rm(self.mem, seq_id, p0, p1) }
    }

    /// Keep positions `[0, pos)` of `seq_id`, drop the rest.
    pub fn truncate(&mut self, seq_id: i32, pos: i32) -> bool {
        self.seq_rm(seq_id, pos, -1)
    }

    /// Copy `[p0, p1)` of `src` into `dst` (shares cells, no data copy).
    pub fn seq_cp(&mut self, src: i32, dst: i32, p0: i32, p1: i32) {
        unsafe { llama_sys::llama_memory_seq_cp(self.mem, src, dst, p0, p1) }
    }

    /// Remove every sequence except `seq_id`.
    pub fn seq_keep(&mut self, seq_id: i32) {
        unsafe { llama_sys::llama_memory_seq_keep(self.mem, seq_id) }
    }

    /// Shift positions `[p0, p1)` of `seq_id` by `delta`.
    pub fn seq_add(&mut self, seq_id: i32, p0: i32, p1: i32, delta: i32) -> Result<()> {
        if delta != 0 && !self.can_shift() {
            return Err(LlamaError::InvalidArgument(
                "memory does not support position shifting".into(),
            ));
        }
        unsafe { llama_sys::llama_memory_seq_add(self.mem, seq_id, p0, p1, delta) }
        Ok(())
    }

    /// Integer-divide positions `[p0, p1)` of `seq_id` by `d` (> 1).
    pub fn seq_div(&mut self, seq_id: i32, p0: i32, p1: i32, d: i32) -> Result<()> {
        if d <= 1 {
            return Err(LlamaError::InvalidArgument(format!(
                "position divisor must be > 1, got {d}"
            )));
        }
        if !self.can_shift() {
            return Err(LlamaError::InvalidArgument(
                "memory does not support position shifting".into(),
            ));
        }
        unsafe { llama_sys::llama_memory_seq_div(self.mem, seq_id, p0, p1, d) }
        Ok(())
    }

    /// Smallest cached position of `seq_id`, `None` if the sequence is empty.
    pub fn seq_pos_min(&self, seq_id: i32) -> Option<i32> {
        let p = unsafe { llama_sys::llama_memory_seq_pos_min(self.mem, seq_id) };
        (p >= 0).then_some(p)
    }

    /// Largest cached position of `seq_id`, `None` if the sequence is empty.
    pub fn seq_pos_max(&self, seq_id: i32) -> Option<i32> {
        let p = unsafe { llama_sys::llama_memory_seq_pos_max(self.mem, seq_id) };
        (p >= 0).then_some(p)
    }

    /// Next free position of `seq_id` (0 when empty).
    pub fn seq_next_pos(&self, seq_id: i32) -> i32 {
        self.seq_pos_max(seq_id).map_or(0, |p| p + 1)
    }

    pub fn can_shift(&self) -> bool {
        unsafe { llama_sys::llama_memory_can_shift(self.mem) }
    }
}
