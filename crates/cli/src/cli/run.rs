use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cli::{GlobalArgs, RunArgs};
use crate::config::AppConfig;

pub async fn execute(global: &GlobalArgs, cfg: &AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let model = super::load_model(global, cfg, &args.model, false)?;
    let mut ctx = llama_core::LlamaContext::new(Arc::clone(&model), &super::context_params(global, cfg))?;
    args.generation.attach_loras(&model, &mut ctx)?;
    info!(n_ctx = ctx.n_ctx(), "Starting interactive chat");

    let sampling = args.generation.sampling(cfg)?;
    let max_tokens = args.generation.max_tokens.unwrap_or(cfg.max_tokens);
    let system_msg = args.system.as_deref().unwrap_or(&cfg.system_prompt);

    let mut history = vec![llama_core::ChatMessage::system(system_msg)];

    println!("Model loaded. Type your message (Ctrl-D to quit, /reset to clear history).\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            history.truncate(1);
            println!("History cleared.\n");
            continue;
        }

        history.push(llama_core::ChatMessage::user(line));

        let prompt = llama_core::apply_model_template(&model, &history, true)?;
        let tokens = model.tokenize(&prompt, true, true)?;
        debug!(prompt_tokens = tokens.len(), "Prompt rendered");

        let request = llama_core::GenerateRequest {
            tokens,
            max_tokens,
            stop_words: args.generation.stop.clone(),
            sampling_params: sampling.clone(),
        };

        let (reply, returned) = super::stream_to_stdout(ctx, request).await?;
        ctx = returned;

        history.push(llama_core::ChatMessage::assistant(reply));
        println!();
    }

    Ok(())
}
