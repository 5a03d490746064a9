mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();

    match cli.command {
        cli::Commands::Run {
            config,
            run_id,
            collection,
            in_situ,
            confirm_destructive,
            reset_checkpoint,
            reset_destination,
            limit,
            dry_run,
        } => {
            let args = commands::run::RunArgs {
                run_id,
                collections: collection,
                in_situ,
                confirm_destructive,
                reset_checkpoint,
                reset_destination,
                limit,
                dry_run,
            };
            commands::run::handle(config, args).await
        }
        cli::Commands::Validate {
            config,
            collection,
            sample,
            json,
        } => commands::validate::handle(config, collection, sample, json).await,
        cli::Commands::Checkpoint(cmd) => commands::checkpoint::handle(cmd).await,
    }
}
