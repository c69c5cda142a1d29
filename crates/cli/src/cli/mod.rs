pub mod complete;
pub mod config_cmd;
pub mod embed;
pub mod info;
pub mod quantize;
pub mod run;
pub mod tokenize;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "llama-cli", version, about = "Run GGUF models through llama.cpp")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Args, Clone)]
pub struct GlobalArgs {
    /// Context size (0 = model default).
    #[arg(long, global = true, env = "LLAMA_CTX_SIZE")]
    pub ctx_size: Option<u32>,

    /// GPU layers (-1 = all, 0 = CPU only).
    #[arg(long, global = true, allow_hyphen_values = true, env = "LLAMA_N_GPU_LAYERS")]
    pub n_gpu_layers: Option<i32>,

    /// Threads.
    #[arg(long, global = true, env = "LLAMA_THREADS")]
    pub threads: Option<i32>,

    /// Forward llama.cpp's own logs.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Complete a raw text prompt.
    Complete(CompleteArgs),

    /// Load a model and start an interactive chat.
    Run(RunArgs),

    /// Print the tokens of a text.
    Tokenize(TokenizeArgs),

    /// Compute embeddings for one or more texts.
    Embed(EmbedArgs),

    /// Show model hyper-parameters and GGUF metadata.
    Info(InfoArgs),

    /// Quantize a GGUF model.
    Quantize(QuantizeArgs),

    /// Show backend capabilities.
    SystemInfo,

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone)]
pub struct ModelArg {
    /// Path to a GGUF model file (defaults to `default_model` in the config).
    #[arg(short, long, env = "LLAMA_MODEL")]
    pub model: Option<PathBuf>,
}

impl ModelArg {
    pub fn resolve(&self, cfg: &AppConfig) -> anyhow::Result<PathBuf> {
        self.model
            .clone()
            .or_else(|| cfg.default_model.clone())
            .ok_or_else(|| anyhow::anyhow!("no model given; pass --model or run `llama-cli config set model <path>`"))
    }
}

#[derive(Debug, clap::Args, Clone)]
pub struct GenerationArgs {
    /// Maximum tokens to generate.
    #[arg(short = 'n', long)]
    pub max_tokens: Option<u32>,

    /// Temperature.
    #[arg(long)]
    pub temp: Option<f32>,

    /// RNG seed.
    #[arg(long)]
    pub seed: Option<u32>,

    /// Stop generating at this text (can be repeated).
    #[arg(long)]
    pub stop: Vec<String>,

    /// GBNF grammar file constraining the output.
    #[arg(long)]
    pub grammar_file: Option<PathBuf>,

    /// LoRA adapter to apply (can be repeated).
    #[arg(long)]
    pub lora: Vec<PathBuf>,

    /// Scale for every `--lora` adapter.
    #[arg(long, default_value_t = 1.0)]
    pub lora_scale: f32,
}

#[derive(Debug, clap::Args, Clone)]
pub struct CompleteArgs {
    #[command(flatten)]
    pub model: ModelArg,

    /// Prompt text.
    pub prompt: String,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[derive(Debug, clap::Args, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub model: ModelArg,

    /// System prompt.
    #[arg(long)]
    pub system: Option<String>,

    #[command(flatten)]
    pub generation: GenerationArgs,
}

#[derive(Debug, clap::Args, Clone)]
pub struct TokenizeArgs {
    #[command(flatten)]
    pub model: ModelArg,

    /// Text to tokenize.
    pub text: String,

    /// Do not add BOS/EOS.
    #[arg(long)]
    pub no_special: bool,

    /// Print only a JSON array of token ids.
    #[arg(long)]
    pub ids: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct EmbedArgs {
    #[command(flatten)]
    pub model: ModelArg,

    /// Texts to embed.
    #[arg(required = true)]
    pub texts: Vec<String>,

    /// Keep raw (unnormalized) vectors.
    #[arg(long)]
    pub no_normalize: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct InfoArgs {
    #[command(flatten)]
    pub model: ModelArg,
}

#[derive(Debug, clap::Args, Clone)]
pub struct QuantizeArgs {
    /// Input GGUF model.
    pub input: PathBuf,

    /// Output path.
    pub output: PathBuf,

    /// Target type, e.g. Q4_K_M, Q8_0, IQ4_XS.
    #[arg(short = 't', long = "type", default_value = "Q4_K_M")]
    pub quant_type: llama_core::QuantType,

    /// Allow re-quantizing already quantized tensors.
    #[arg(long)]
    pub allow_requantize: bool,

    /// Use the target type for every tensor.
    #[arg(long)]
    pub pure: bool,
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
    /// Print the configuration file location.
    Path,
}

//  Shared loading helpers

pub fn load_model(
    global: &GlobalArgs,
    cfg: &AppConfig,
    model: &ModelArg,
    vocab_only: bool,
) -> anyhow::Result<Arc<llama_core::LlamaModel>> {
    let path = model.resolve(cfg)?;
    info!(model = %path.display(), "Loading model…");

    let params = llama_core::ModelParams {
        n_gpu_layers: global.n_gpu_layers.unwrap_or(cfg.default_n_gpu_layers),
        vocab_only,
        ..Default::default()
    };
    Ok(Arc::new(llama_core::LlamaModel::load_from_file(&path, &params)?))
}

pub fn context_params(global: &GlobalArgs, cfg: &AppConfig) -> llama_core::ContextParams {
    let n_threads = global.threads.or(cfg.threads).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(4)
    });
    llama_core::ContextParams {
        n_ctx: global.ctx_size.unwrap_or(cfg.default_ctx_size),
        n_threads,
        n_threads_batch: n_threads,
        ..Default::default()
    }
}

impl GenerationArgs {
    /// Config sampling defaults with command-line overrides applied.
    pub fn sampling(&self, cfg: &AppConfig) -> anyhow::Result<llama_core::SamplingParams> {
        let mut params = cfg.sampling.clone();
        if let Some(t) = self.temp {
            params.temperature = t;
        }
        if self.seed.is_some() {
            params.seed = self.seed;
        }
        if let Some(path) = &self.grammar_file {
            params.grammar = Some(std::fs::read_to_string(path)?);
        }
        Ok(params)
    }

    pub fn attach_loras(
        &self,
        model: &Arc<llama_core::LlamaModel>,
        ctx: &mut llama_core::LlamaContext,
    ) -> anyhow::Result<()> {
        for path in &self.lora {
            let adapter = llama_core::LoraAdapter::load(Arc::clone(model), path)?;
            ctx.set_lora(&adapter, self.lora_scale)?;
        }
        Ok(())
    }
}

/// Stream generation events to stdout; returns the generated text and
/// the context handed back by the blocking task.
pub async fn stream_to_stdout(
    ctx: llama_core::LlamaContext,
    request: llama_core::GenerateRequest,
) -> anyhow::Result<(String, llama_core::LlamaContext)> {
    use std::io::Write;

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let task = tokio::task::spawn_blocking(move || {
        let mut ctx = ctx;
        llama_core::generate_blocking(&mut ctx, &request, tx);
        ctx
    });

    let mut stdout = std::io::stdout();
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            llama_core::GenerateEvent::Token(piece) => {
                print!("{piece}");
                stdout.flush()?;
                text.push_str(&piece);
            }
            llama_core::GenerateEvent::Done {
                finish_reason,
                prompt_tokens,
                completion_tokens,
            } => {
                println!();
                eprintln!("  [{finish_reason} | prompt: {prompt_tokens} tok, gen: {completion_tokens} tok]");
                break;
            }
            llama_core::GenerateEvent::Error(e) => {
                eprintln!("\nError: {e}");
                break;
            }
        }
    }

    let ctx = task.await?;
    Ok((text, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_quantize() {
        let cli = Cli::try_parse_from(["llama-cli", "quantize", "in.gguf", "out.gguf", "-t", "q8_0"]).unwrap();
        match cli.command {
            Commands::Quantize(q) => assert_eq!(q.quant_type, llama_core::QuantType::Q8_0),
            _ => panic!("expected quantize"),
        }
    }

    #[test]
    fn test_generation_overrides_config() {
        let cli = Cli::try_parse_from([
            "llama-cli", "complete", "-m", "m.gguf", "hello", "--temp", "0", "--seed", "9", "--stop", "###",
        ])
        .unwrap();
        let Commands::Complete(args) = cli.command else {
            panic!("expected complete");
        };
        let sampling = args.generation.sampling(&AppConfig::default()).unwrap();
        assert_eq!(sampling.temperature, 0.0);
        assert_eq!(sampling.seed, Some(9));
        assert_eq!(args.generation.stop, vec!["###".to_string()]);
        assert_eq!(args.model.model.as_deref(), Some(std::path::Path::new("m.gguf")));
    }

    #[test]
    fn test_model_falls_back_to_config() {
        let arg = ModelArg { model: None };
        assert!(arg.resolve(&AppConfig::default()).is_err());
        let cfg = AppConfig {
            default_model: Some("/m/default.gguf".into()),
            ..Default::default()
        };
        assert_eq!(arg.resolve(&cfg).unwrap(), PathBuf::from("/m/default.gguf"));
    }

    #[test]
    fn test_negative_gpu_layers() {
        let cli = Cli::try_parse_from(["llama-cli", "--n-gpu-layers", "-1", "system-info"]).unwrap();
        assert_eq!(cli.global.n_gpu_layers, Some(-1));
    }
}
