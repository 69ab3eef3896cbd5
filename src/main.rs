use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hearth::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides server.log_level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                hearth::cli::configured_log_directive(&cli.config).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve { port, host } => {
            hearth::cli::serve(&cli.config, port, host).await?;
        }
        Commands::Generate {
            prompt,
            max_tokens,
            temperature,
            raw,
        } => {
            hearth::cli::generate(&cli.config, prompt, max_tokens, temperature, raw).await?;
        }
        Commands::Pull { repo } => {
            hearth::cli::pull(&cli.config, repo).await?;
        }
        Commands::Info => {
            hearth::cli::info(&cli.config).await?;
        }
    }

    Ok(())
}
