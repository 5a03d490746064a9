pub mod checkpoint;
pub mod run;
pub mod validate;

use anyhow::{Context, Result};
use phimask_config::{CheckpointLocation, JobConfig};
use phimask_storage::{CheckpointStore, Database, DocumentStore, FileCheckpointStore};
use std::path::PathBuf;
use std::sync::Arc;

pub fn load_config(path: Option<PathBuf>) -> Result<JobConfig> {
    let path = path.unwrap_or_else(JobConfig::default_path);
    JobConfig::load(&path).with_context(|| format!("Loading job config {}", path.display()))
}

pub struct Stores {
    pub documents: Arc<dyn DocumentStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

/// Open the document and checkpoint stores named by the config.
pub async fn open_stores(config: &JobConfig) -> Result<Stores> {
    let database = match &config.storage.documents_url {
        Some(url) => Database::connect(url).await,
        None => Database::open(None).await,
    }
    .context("Opening document database")?;

    let checkpoints: Arc<dyn CheckpointStore> = match config.storage.checkpoint_location() {
        None => Arc::new(database.checkpoints()),
        Some(CheckpointLocation::Sqlite(url)) => Arc::new(
            Database::connect(&url)
                .await
                .context("Opening checkpoint database")?
                .checkpoints(),
        ),
        Some(CheckpointLocation::JsonDir(dir)) => Arc::new(
            FileCheckpointStore::new(&dir)
                .with_context(|| format!("Opening checkpoint directory {}", dir.display()))?,
        ),
    };

    Ok(Stores {
        documents: Arc::new(database.documents()),
        checkpoints,
    })
}
