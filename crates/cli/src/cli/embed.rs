use std::sync::Arc;

use crate::cli::{EmbedArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: &GlobalArgs, cfg: &AppConfig, args: EmbedArgs) -> anyhow::Result<()> {
    let model = super::load_model(global, cfg, &args.model, false)?;

    let mut params = super::context_params(global, cfg);
    params.embeddings = true;
    params.n_seq_max = args.texts.len().clamp(1, 16) as u32;
    // Non-causal models need a whole input in one micro-batch.
    params.n_ubatch = params.n_batch;
    let mut ctx = llama_core::LlamaContext::new(Arc::clone(&model), &params)?;

    let inputs = args
        .texts
        .iter()
        .map(|t| model.tokenize(t, true, false))
        .collect::<Result<Vec<_>, _>>()?;

    let vectors = tokio::task::spawn_blocking(move || llama_core::embed(&mut ctx, &inputs, !args.no_normalize))
        .await??;

    let similarity: Vec<Vec<f32>> = vectors
        .iter()
        .map(|a| vectors.iter().map(|b| llama_core::cosine_similarity(a, b)).collect())
        .collect();

    let out = serde_json::json!({
        "n_embd": model.n_embd(),
        "embeddings": vectors,
        "similarity": similarity,
    });
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}
