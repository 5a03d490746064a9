use anyhow::Result;
use phimask_storage::CheckpointStore;

use super::{load_config, open_stores};
use crate::cli::CheckpointCommands;

pub async fn handle(cmd: CheckpointCommands) -> Result<()> {
    match cmd {
        CheckpointCommands::Show { config, run_id, json } => show(config, run_id, json).await,
        CheckpointCommands::Reset {
            config,
            run_id,
            collection,
        } => reset(config, run_id, collection).await,
    }
}

async fn show(config: Option<std::path::PathBuf>, run_id: String, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let stores = open_stores(&config).await?;
    let checkpoints = stores.checkpoints.list(&run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&checkpoints)?);
        return Ok(());
    }
    if checkpoints.is_empty() {
        println!("No checkpoints for run {}", run_id);
        return Ok(());
    }

    println!("Run {}:", run_id);
    for checkpoint in checkpoints {
        let last_key = checkpoint
            .last_key
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} [{}] last_key={} processed={} failed={}",
            checkpoint.collection,
            checkpoint.status.as_str(),
            last_key,
            checkpoint.processed_count,
            checkpoint.failed_count()
        );
    }
    Ok(())
}

async fn reset(config: Option<std::path::PathBuf>, run_id: String, collection: Option<String>) -> Result<()> {
    let config = load_config(config)?;
    let stores = open_stores(&config).await?;
    let removed = stores
        .checkpoints
        .delete(&run_id, collection.as_deref())
        .await?;
    println!("✓ Removed {} checkpoint(s) for run {}", removed, run_id);
    Ok(())
}
