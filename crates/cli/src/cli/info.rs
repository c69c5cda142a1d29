use crate::cli::InfoArgs;
use crate::config::AppConfig;

pub async fn execute(cfg: &AppConfig, args: InfoArgs) -> anyhow::Result<()> {
    let path = args.model.resolve(cfg)?;
    // Hyper-parameters and metadata need no weights.
    let params = llama_core::ModelParams {
        vocab_only: true,
        ..Default::default()
    };
    let model = llama_core::LlamaModel::load_from_file(&path, &params)?;
    let vocab = model.vocab();

    let info = serde_json::json!({
        "path": path,
        "desc": model.desc(),
        "n_params": model.n_params(),
        "size": model.size(),
        "size_human": human_size(model.size()),
        "n_ctx_train": model.n_ctx_train(),
        "n_embd": model.n_embd(),
        "n_layer": model.n_layer(),
        "n_head": model.n_head(),
        "n_head_kv": model.n_head_kv(),
        "has_encoder": model.has_encoder(),
        "is_recurrent": model.is_recurrent(),
        "vocab": {
            "type": format!("{:?}", vocab.vocab_type()),
            "n_tokens": vocab.n_tokens(),
            "bos": vocab.bos(),
            "eos": vocab.eos(),
            "eot": vocab.eot(),
            "add_bos": vocab.add_bos(),
        },
        "chat_template": model.chat_template(None),
        "metadata": model.metadata(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

pub fn system_info() -> anyhow::Result<()> {
    use llama_core::LlamaBackend;

    println!("{}", LlamaBackend::system_info());
    println!("mmap:        {}", LlamaBackend::supports_mmap());
    println!("mlock:       {}", LlamaBackend::supports_mlock());
    println!("gpu offload: {}", LlamaBackend::supports_gpu_offload());
    println!("max devices: {}", LlamaBackend::max_devices());
    Ok(())
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512.0 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
