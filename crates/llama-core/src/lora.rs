//! LoRA adapters and control vectors.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::context::LlamaContext;
use crate::error::{LlamaError, Result};
use crate::model::LlamaModel;

/// A LoRA adapter loaded for a specific model.
pub struct LoraAdapter {
    ptr: *mut llama_sys::llama_adapter_lora,
    /// The adapter references the model's tensors.
    model: Arc<LlamaModel>,
    path: PathBuf,
}

// Safety: the adapter is immutable after loading.
unsafe impl Send for LoraAdapter {}
unsafe impl Sync for LoraAdapter {}

impl std::fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapter").field("path", &self.path).finish()
    }
}

impl LoraAdapter {
    pub fn load(model: Arc<LlamaModel>, path: &Path) -> Result<Arc<Self>> {
        let path_str = path
            .to_str()
            .ok_or_else(|| LlamaError::LoraAdapter(format!("non UTF-8 path {}", path.display())))?;
        let c_path = CString::new(path_str)?;

        let ptr = unsafe { llama_sys::llama_adapter_lora_init(model.as_ptr(), c_path.as_ptr()) };
        if ptr.is_null() {
            return Err(LlamaError::LoraAdapter(format!(
                "failed to load adapter from '{path_str}'"
            )));
        }

        info!(path = %path.display(), "LoRA adapter loaded");
        Ok(Arc::new(Self {
            ptr,
            model,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model(&self) -> &Arc<LlamaModel> {
        &self.model
    }
}

impl Drop for LoraAdapter {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            debug!(path = %self.path.display(), "Freeing LoRA adapter");
            unsafe { llama_sys::llama_adapter_lora_free(self.ptr) }
        }
    }
}

impl LlamaContext {
    /// Attach `adapter` with `scale`, replacing the scale if already attached.
    pub fn set_lora(&mut self, adapter: &Arc<LoraAdapter>, scale: f32) -> Result<()> {
        if !Arc::ptr_eq(adapter.model(), self.model_arc()) {
            return Err(LlamaError::LoraAdapter(
                "adapter was loaded for a different model".into(),
            ));
        }
        let rc = unsafe { llama_sys::llama_set_adapter_lora(self.as_ptr(), adapter.ptr, scale) };
        if rc != 0 {
            return Err(LlamaError::LoraAdapter(format!(
                "llama_set_adapter_lora returned {rc}"
            )));
        }

        match self.loras.iter_mut().find(|(a, _)| Arc::ptr_eq(a, adapter)) {
            Some(entry) => entry.1 = scale,
            None => self.loras.push((Arc::clone(adapter), scale)),
        }
        debug!(path = %adapter.path().display(), scale, "LoRA adapter attached");
        Ok(())
    }

    /// Detach `adapter`. Returns `false` if it was not attached.
    pub fn remove_lora(&mut self, adapter: &Arc<LoraAdapter>) -> bool {
        let rc = unsafe { llama_sys::llama_rm_adapter_lora(self.as_ptr(), adapter.ptr) };
        self.loras.retain(|(a, _)| !Arc::ptr_eq(a, adapter));
        rc == 0
    }

    /// Detach every adapter.
    pub fn clear_lora(&mut self) {
        unsafe { llama_sys::llama_clear_adapter_lora(self.as_ptr()) }
        self.loras.clear();
    }

    /// Adapters currently attached, with their scales.
    pub fn loras(&self) -> impl Iterator<Item = (&Arc<LoraAdapter>, f32)> {
        self.loras.iter().map(|(a, s)| (a, *s))
    }

    /// Apply a control vector: `data` holds one `n_embd` row per layer,
    /// starting at layer 1. Layers outside `[il_start, il_end]` are unaffected.
    pub fn apply_control_vector(&mut self, data: &[f32], il_start: i32, il_end: i32) -> Result<()> {
        let n_embd = self.model().n_embd();
        if n_embd <= 0 || data.len() % n_embd as usize != 0 {
            return Err(LlamaError::InvalidArgument(format!(
                "control vector length {} is not a multiple of n_embd {n_embd}",
                data.len()
            )));
        }
        let rc = unsafe {
            llama_sys::llama_apply_adapter_cvec(
                self.as_ptr(),
                data.as_ptr(),
                data.len(),
                n_embd,
                il_start,
                il_end,
            )
        };
        if rc != 0 {
            return Err(LlamaError::ControlVector(rc));
        }
        Ok(())
    }

    pub fn clear_control_vector(&mut self) -> Result<()> {
        let n_embd = self.model().n_embd();
        let rc = unsafe {
            llama_sys::llama_apply_adapter_cvec(self.as_ptr(), std::ptr::null(), 0, n_embd, 0, 0)
        };
        if rc != 0 {
            return Err(LlamaError::ControlVector(rc));
        }
        Ok(())
    }
}
