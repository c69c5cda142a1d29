//! Model quantization.

use std::ffi::CString;
use std::path::Path;
use std::str::FromStr;

use tracing::info;

use crate::error::{LlamaError, Result};

/// Target tensor format of a quantized model (`llama_ftype`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[allow(non_camel_case_types)]
pub enum QuantType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q8_0 = 7,
    Q5_0 = 8,
    Q5_1 = 9,
    Q2_K = 10,
    Q3_K_S = 11,
    Q3_K_M = 12,
    Q3_K_L = 13,
    Q4_K_S = 14,
    Q4_K_M = 15,
    Q5_K_S = 16,
    Q5_K_M = 17,
    Q6_K = 18,
    IQ2_XXS = 19,
    IQ2_XS = 20,
    Q2_K_S = 21,
    IQ3_XS = 22,
    IQ3_XXS = 23,
    IQ1_S = 24,
    IQ4_NL = 25,
    IQ3_S = 26,
    IQ3_M = 27,
    IQ2_S = 28,
    IQ2_M = 29,
    IQ4_XS = 30,
    IQ1_M = 31,
    BF16 = 32,
    TQ1_0 = 36,
    TQ2_0 = 37,
}

impl QuantType {
    pub const ALL: &'static [QuantType] = &[
        Self::F32,
        Self::F16,
        Self::BF16,
        Self::Q4_0,
        Self::Q4_1,
        Self::Q5_0,
        Self::Q5_1,
        Self::Q8_0,
        Self::Q2_K,
        Self::Q2_K_S,
        Self::Q3_K_S,
        Self::Q3_K_M,
        Self::Q3_K_L,
        Self::Q4_K_S,
        Self::Q4_K_M,
        Self::Q5_K_S,
        Self::Q5_K_M,
        Self::Q6_K,
        Self::IQ1_S,
        Self::IQ1_M,
        Self::IQ2_XXS,
        Self::IQ2_XS,
        Self::IQ2_S,
        Self::IQ2_M,
        Self::IQ3_XXS,
        Self::IQ3_XS,
        Self::IQ3_S,
        Self::IQ3_M,
        Self::IQ4_NL,
        Self::IQ4_XS,
        Self::TQ1_0,
        Self::TQ2_0,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
            Self::Q2_K => "Q2_K",
            Self::Q2_K_S => "Q2_K_S",
            Self::Q3_K_S => "Q3_K_S",
            Self::Q3_K_M => "Q3_K_M",
            Self::Q3_K_L => "Q3_K_L",
            Self::Q4_K_S => "Q4_K_S",
            Self::Q4_K_M => "Q4_K_M",
            Self::Q5_K_S => "Q5_K_S",
            Self::Q5_K_M => "Q5_K_M",
            Self::Q6_K => "Q6_K",
            Self::IQ1_S => "IQ1_S",
            Self::IQ1_M => "IQ1_M",
            Self::IQ2_XXS => "IQ2_XXS",
            Self::IQ2_XS => "IQ2_XS",
            Self::IQ2_S => "IQ2_S",
            Self::IQ2_M => "IQ2_M",
            Self::IQ3_XXS => "IQ3_XXS",
            Self::IQ3_XS => "IQ3_XS",
            Self::IQ3_S => "IQ3_S",
            Self::IQ3_M => "IQ3_M",
            Self::IQ4_NL => "IQ4_NL",
            Self::IQ4_XS => "IQ4_XS",
            Self::TQ1_0 => "TQ1_0",
            Self::TQ2_0 => "TQ2_0",
        }
    }

    fn as_raw(self) -> llama_sys::llama_ftype {
        self as u32 as llama_sys::llama_ftype
    }
}

impl std::fmt::Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QuantType {
    type Err = LlamaError;

    /// Case-insensitive; `Q4_K` and `Q5_K` alias the `_M` variants.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let key = match upper.as_str() {
            "Q4_K" => "Q4_K_M",
            "Q5_K" => "Q5_K_M",
            other => other,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.name() == key)
            .ok_or_else(|| LlamaError::InvalidArgument(format!("unknown quantization type '{s}'")))
    }
}

/// Options for [`quantize`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QuantizeParams {
    /// Worker threads; 0 uses every hardware thread.
    pub n_threads: i32,
    pub ftype: QuantType,
    /// Allow re-quantizing tensors that are already quantized.
    pub allow_requantize: bool,
    pub quantize_output_tensor: bool,
    /// Copy tensors as-is; `ftype` is ignored.
    pub only_copy: bool,
    /// Quantize every tensor to `ftype`, with no mixture.
    pub pure: bool,
    /// Keep the shard layout of a split input model.
    pub keep_split: bool,
}

impl Default for QuantizeParams {
    fn default() -> Self {
        Self {
            n_threads: 0,
            ftype: QuantType::Q4_K_M,
            allow_requantize: false,
            quantize_output_tensor: true,
            only_copy: false,
            pure: false,
            keep_split: false,
        }
    }
}

impl QuantizeParams {
    fn to_raw(&self) -> llama_sys::llama_model_quantize_params {
        let mut p = unsafe { llama_sys::llama_model_quantize_default_params() };
        p.nthread = self.n_threads;
        p.ftype = self.ftype.as_raw();
        p.allow_requantize = self.allow_requantize;
        p.quantize_output_tensor = self.quantize_output_tensor;
        p.only_copy = self.only_copy;
        p.pure = self.pure;
        p.keep_split = self.keep_split;
        p
    }
}

/// Quantize the GGUF model at `input` into `output`. Blocks until done.
pub fn quantize(input: &Path, output: &Path, params: &QuantizeParams) -> Result<()> {
    if !input.exists() {
        return Err(LlamaError::InvalidArgument(format!("input model not found: {}", input.display())));
    }
    let to_c = |p: &Path| -> Result<CString> {
        let s = p
            .to_str()
            .ok_or_else(|| LlamaError::InvalidArgument(format!("path is not valid UTF-8: {}", p.display())))?;
        Ok(CString::new(s)?)
    };
    let c_in = to_c(input)?;
    let c_out = to_c(output)?;
    let raw = params.to_raw();

    info!(input = %input.display(), output = %output.display(), ftype = %params.ftype, "quantizing model");
    let rc = unsafe { llama_sys::llama_model_quantize(c_in.as_ptr(), c_out.as_ptr(), &raw) };
    if rc != 0 {
        return Err(LlamaError::QuantizeFailed(rc));
    }
    Ok(())
}
