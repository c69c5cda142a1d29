use tracing::info;

use crate::cli::{GlobalArgs, QuantizeArgs};

pub async fn execute(global: &GlobalArgs, args: QuantizeArgs) -> anyhow::Result<()> {
    let params = llama_core::QuantizeParams {
        n_threads: global.threads.unwrap_or(0),
        ftype: args.quant_type,
        allow_requantize: args.allow_requantize,
        pure: args.pure,
        ..Default::default()
    };

    let started = std::time::Instant::now();
    let (input, output) = (args.input.clone(), args.output.clone());
    tokio::task::spawn_blocking(move || llama_core::quantize(&input, &output, &params)).await??;

    let size = std::fs::metadata(&args.output).map(|m| m.len()).unwrap_or(0);
    info!(
        output = %args.output.display(),
        size = %super::info::human_size(size),
        elapsed_s = started.elapsed().as_secs_f32(),
        "Quantization finished"
    );
    Ok(())
}
