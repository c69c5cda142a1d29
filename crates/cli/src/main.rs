mod cli;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    //  Logging
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,llama_cli=debug")),
        )
        .with_writer(std::io::stderr);
    if args.global.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let backend = llama_core::LlamaBackend::init();
    if args.global.verbose {
        backend.set_log_callback();
    } else {
        backend.void_logs();
    }

    let cfg = config::AppConfig::load_or_default()?;

    match args.command {
        cli::Commands::Complete(a) => cli::complete::execute(&args.global, &cfg, a).await,
        cli::Commands::Run(a) => cli::run::execute(&args.global, &cfg, a).await,
        cli::Commands::Tokenize(a) => cli::tokenize::execute(&args.global, &cfg, a).await,
        cli::Commands::Embed(a) => cli::embed::execute(&args.global, &cfg, a).await,
        cli::Commands::Info(a) => cli::info::execute(&cfg, a).await,
        cli::Commands::Quantize(a) => cli::quantize::execute(&args.global, a).await,
        cli::Commands::SystemInfo => cli::info::system_info(),
        cli::Commands::Config(c) => cli::config_cmd::execute(c).await,
    }
}
