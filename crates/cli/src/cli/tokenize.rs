use crate::cli::{GlobalArgs, TokenizeArgs};
use crate::config::AppConfig;

pub async fn execute(global: &GlobalArgs, cfg: &AppConfig, args: TokenizeArgs) -> anyhow::Result<()> {
    let model = super::load_model(global, cfg, &args.model, true)?;
    let vocab = model.vocab();
    let tokens = vocab.tokenize(&args.text, !args.no_special, true)?;

    if args.ids {
        println!("{}", serde_json::to_string(&tokens)?);
        return Ok(());
    }

    for &token in &tokens {
        let piece = vocab.token_to_piece(token, true);
        println!("{:>8} -> {:?}", token.id(), piece);
    }
    eprintln!("{} token(s)", tokens.len());
    Ok(())
}
