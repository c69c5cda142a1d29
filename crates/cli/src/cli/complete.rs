use std::sync::Arc;

use tracing::info;

use crate::cli::{CompleteArgs, GlobalArgs};
use crate::config::AppConfig;

pub async fn execute(global: &GlobalArgs, cfg: &AppConfig, args: CompleteArgs) -> anyhow::Result<()> {
    let model = super::load_model(global, cfg, &args.model, false)?;
    let mut ctx = llama_core::LlamaContext::new(Arc::clone(&model), &super::context_params(global, cfg))?;
    args.generation.attach_loras(&model, &mut ctx)?;

    let request = llama_core::GenerateRequest {
        tokens: model.tokenize(&args.prompt, true, true)?,
        max_tokens: args.generation.max_tokens.unwrap_or(cfg.max_tokens),
        stop_words: args.generation.stop.clone(),
        sampling_params: args.generation.sampling(cfg)?,
    };

    print!("{}", args.prompt);
    let (_, ctx) = super::stream_to_stdout(ctx, request).await?;

    let perf = ctx.perf();
    info!(
        prompt_tps = perf.prompt_tokens_per_sec(),
        gen_tps = perf.generation_tokens_per_sec(),
        "Done"
    );
    Ok(())
}
