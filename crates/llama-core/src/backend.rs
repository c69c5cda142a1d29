//! Global llama.cpp backend initialization and system queries.

use std::ffi::CStr;
use std::sync::Once;
use tracing::{debug, info};

static BACKEND_INIT: Once = Once::new();

/// Handle proving the llama.cpp backend has been initialized.
///
/// The first call to [`LlamaBackend::init`] initializes the C backend;
/// subsequent calls are no-ops. The backend lives until process exit.
#[derive(Debug, Clone, Copy)]
pub struct LlamaBackend {
    _private: (),
}

impl LlamaBackend {
    /// Initialize the llama.cpp backend (idempotent).
    pub fn init() -> Self {
        BACKEND_INIT.call_once(|| {
            unsafe {
                llama_sys::llama_backend_init();
            }
            info!("llama.cpp backend initialized");
        });
        Self { _private: () }
    }

    /// Initialize NUMA optimizations.
    pub fn numa_init(&self, strategy: NumaStrategy) {
        unsafe {
            llama_sys::llama_numa_init(strategy.as_raw());
        }
        debug!(?strategy, "NUMA initialized");
    }

    /// Route llama.cpp / ggml logs into `tracing` under the `llama.cpp`
    /// target. Replaces any previously installed callback.
    pub fn set_log_callback(&self) {
        unsafe extern "C" fn cb(
            level: llama_sys::ggml_log_level,
            text: *const std::ffi::c_char,
            _user_data: *mut std::ffi::c_void,
        ) {
            if text.is_null() {
                return;
            }
            let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
            let msg = msg.trim();
            if msg.is_empty() {
                return;
            }
            // ggml_log_level: DEBUG=1, INFO=2, WARN=3, ERROR=4, CONT=5
            match level {
                4 => tracing::error!(target: "llama.cpp", "{msg}"),
                3 => tracing::warn!(target: "llama.cpp", "{msg}"),
                2 => tracing::info!(target: "llama.cpp", "{msg}"),
                _ => tracing::debug!(target: "llama.cpp", "{msg}"),
            }
        }

        unsafe {
            llama_sys::llama_log_set(Some(cb), std::ptr::null_mut());
        }
        debug!("llama.cpp log callback installed");
    }

    /// Drop every native log line.
    pub fn void_logs(&self) {
        unsafe extern "C" fn cb(
            _level: llama_sys::ggml_log_level,
            _text: *const std::ffi::c_char,
            _user_data: *mut std::ffi::c_void,
        ) {
        }

        unsafe {
            llama_sys::llama_log_set(Some(cb), std::ptr::null_mut());
        }
    }

    /// Return a human-readable system information string.
    pub fn system_info() -> String {
        unsafe {
            let p = llama_sys::llama_print_system_info();
            if p.is_null() {
                return String::new();
            }
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    }

    pub fn supports_mmap() -> bool {
        unsafe { llama_sys::llama_supports_mmap() }
    }

    pub fn supports_mlock() -> bool {
        unsafe { llama_sys::llama_supports_mlock() }
    }

    pub fn supports_gpu_offload() -> bool {
        unsafe { llama_sys::llama_supports_gpu_offload() }
    }

    /// Maximum number of devices a model can be split across.
    pub fn max_devices() -> usize {
        unsafe { llama_sys::llama_max_devices() }
    }

    /// Monotonic timestamp in microseconds, as used by llama.cpp perf counters.
    pub fn time_us() -> i64 {
        unsafe { llama_sys::llama_time_us() }
    }
}

//  NUMA strategy

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumaStrategy {
    Disabled,
    Distribute,
    Isolate,
    #[serde(rename = "numactl")]
    NUMACtl,
    Mirror,
}

impl NumaStrategy {
    fn as_raw(self) -> llama_sys::ggml_numa_strategy {
        match self {
            Self::Disabled => 0,
            Self::Distribute => 1,
            Self::Isolate => 2,
            Self::NUMACtl => 3,
            Self::Mirror => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _a = LlamaBackend::init();
        let _b = LlamaBackend::init();
        assert!(LlamaBackend::max_devices() >= 1);
    }

    #[test]
    fn test_system_info_not_empty() {
        let _backend = LlamaBackend::init();
        assert!(!LlamaBackend::system_info().is_empty());
    }

    #[test]
    fn test_time_is_monotonic() {
        let _backend = LlamaBackend::init();
        let t0 = LlamaBackend::time_us();
        let t1 = LlamaBackend::time_us();
        assert!(t1 >= t0);
    }

    #[test]
    fn test_numa_strategy_serde_names() {
        let s = serde_json::to_string(&NumaStrategy::NUMACtl).unwrap();
        assert_eq!(s, "\"numactl\"");
        let d: NumaStrategy = serde_json::from_str("\"distribute\"").unwrap();
        assert_eq!(d, NumaStrategy::Distribute);
    }
}
