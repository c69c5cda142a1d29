//! Application configuration, persisted as JSON.

use std::path::{Path, PathBuf};

use llama_core::SamplingParams;
use serde::{Deserialize, Serialize};

/// Defaults applied when a flag is not given on the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model used when `--model` is omitted.
    #[serde(default)]
    pub default_model: Option<PathBuf>,
    /// Default context size (0 = model default).
    #[serde(default = "default_ctx_size")]
    pub default_ctx_size: u32,
    /// Default GPU layers (-1 = all).
    #[serde(default = "default_gpu_layers")]
    pub default_n_gpu_layers: i32,
    #[serde(default)]
    pub threads: Option<i32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub sampling: SamplingParams,
}

fn default_ctx_size() -> u32 {
    4096
}
fn default_gpu_layers() -> i32 {
    -1
}
fn default_max_tokens() -> u32 {
    512
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            default_ctx_size: default_ctx_size(),
            default_n_gpu_layers: default_gpu_layers(),
            threads: None,
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            sampling: SamplingParams::default(),
        }
    }
}

impl AppConfig {
    /// Platform config directory: `~/.config/llama-cli/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-cli")
    }

    pub fn config_file() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from disk, or return defaults if the file doesn't exist.
    pub fn load_or_default() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_file())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&data)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_file())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Update one value by its dotted key, e.g. `sampling.temperature`.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "default_model" | "model" => {
                self.default_model = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "default_ctx_size" | "ctx_size" => self.default_ctx_size = value.parse()?,
            "default_n_gpu_layers" | "n_gpu_layers" => self.default_n_gpu_layers = value.parse()?,
            "threads" => self.threads = (!value.is_empty()).then(|| value.parse()).transpose()?,
            "max_tokens" => self.max_tokens = value.parse()?,
            "system_prompt" => self.system_prompt = value.to_string(),
            "sampling.temperature" | "temperature" => self.sampling.temperature = value.parse()?,
            "sampling.top_k" | "top_k" => self.sampling.top_k = value.parse()?,
            "sampling.top_p" | "top_p" => self.sampling.top_p = value.parse()?,
            "sampling.min_p" | "min_p" => self.sampling.min_p = value.parse()?,
            "sampling.repeat_penalty" | "repeat_penalty" => self.sampling.repeat_penalty = value.parse()?,
            "sampling.mirostat" | "mirostat" => self.sampling.mirostat = value.parse()?,
            "sampling.seed" | "seed" => self.sampling.seed = (!value.is_empty()).then(|| value.parse()).transpose()?,
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = AppConfig::default();
        cfg.set("model", "/models/tiny.gguf").unwrap();
        cfg.set("sampling.temperature", "0.3").unwrap();
        cfg.set("threads", "6").unwrap();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.default_model.as_deref(), Some(Path::new("/models/tiny.gguf")));
        assert_eq!(loaded.threads, Some(6));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_tokens": 64, "sampling": {"top_k": 5}}"#).unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.max_tokens, 64);
        assert_eq!(cfg.sampling.top_k, 5);
        assert_eq!(cfg.sampling.temperature, 0.8);
        assert_eq!(cfg.default_ctx_size, 4096);
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let mut cfg = AppConfig::default();
        assert!(cfg.set("no_such_key", "1").is_err());
        assert!(cfg.set("top_k", "many").is_err());
        cfg.set("seed", "").unwrap();
        assert_eq!(cfg.sampling.seed, None);
        cfg.set("seed", "42").unwrap();
        assert_eq!(cfg.sampling.seed, Some(42));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }
}
