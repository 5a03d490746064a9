//! JSON-file checkpoint store
//!
//! One file per run at `{root}/{run_id}.json`, holding that run's checkpoints
//! keyed by collection. Files are replaced atomically (write temp, rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use phimask_core::Checkpoint;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CheckpointError;
use crate::store::CheckpointStore;

type RunFile = BTreeMap<String, Checkpoint>;

pub struct FileCheckpointStore {
    root: PathBuf,
    // Serializes read-modify-write of run files within this process.
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for_run(&self, run_id: &str) -> Result<PathBuf, CheckpointError> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CheckpointError::InvalidRunId(run_id.to_string()));
        }
        Ok(self.root.join(format!("{}.json", run_id)))
    }

    async fn read_run(&self, run_id: &str) -> Result<RunFile, CheckpointError> {
        let path = self.path_for_run(run_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                run_id: run_id.to_string(),
                collection: "*".to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RunFile::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_run(&self, run_id: &str, run: &RunFile) -> Result<(), CheckpointError> {
        let path = self.path_for_run(run_id)?;
        if run.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        let content = serde_json::to_vec_pretty(run)?;
        replace_file(&path, &content).await?;
        debug!(path = %path.display(), "Wrote checkpoint file");
        Ok(())
    }
}

/// Replace `path` with `content` so that a crash leaves either the old or the
/// new file, never a truncated one.
async fn replace_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    sync_parent(path).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::File::open(parent).await?.sync_all().await,
        None => Ok(()),
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(
        &self,
        run_id: &str,
        collection: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut run = self.read_run(run_id).await?;
        Ok(run.remove(collection))
    }

    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut run = self.read_run(&checkpoint.run_id).await?;
        run.insert(checkpoint.collection.clone(), checkpoint.clone());
        self.write_run(&checkpoint.run_id, &run).await
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_run(run_id).await?.into_values().collect())
    }

    async fn delete(&self, run_id: &str, collection: Option<&str>) -> Result<u64, CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut run = self.read_run(run_id).await?;
        let removed = match collection {
            Some(collection) => u64::from(run.remove(collection).is_some()),
            None => {
                let n = run.len() as u64;
                run.clear();
                n
            }
        };
        if removed > 0 {
            self.write_run(run_id, &run).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phimask_core::{CheckpointStatus, DocumentKey};

    #[tokio::test]
    async fn test_upsert_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::new(dir.path()).unwrap();
            let mut checkpoint = Checkpoint::new("nightly", "patients", "fp");
            checkpoint.record_batch(DocumentKey::from("p-100"), 100, vec![DocumentKey::from("p-7")]);
            store.upsert(&checkpoint).await.unwrap();
            checkpoint.set_status(CheckpointStatus::Completed);
            store.upsert(&checkpoint).await.unwrap();
        }

        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let loaded = store.load("nightly", "patients").await.unwrap().unwrap();
        assert!(loaded.is_completed());
        assert_eq!(loaded.last_key, Some(DocumentKey::from("p-100")));
        assert_eq!(loaded.failed_count(), 1);
        assert!(store.load("nightly", "visits").await.unwrap().is_none());
        assert!(!dir.path().join("nightly.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("crashed.json.tmp"), "{\"half").unwrap();

        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let mut checkpoint = Checkpoint::new("crashed", "patients", "fp");
        checkpoint.record_batch(DocumentKey::Int(40), 40, Vec::new());
        store.upsert(&checkpoint).await.unwrap();

        assert!(!dir.path().join("crashed.json.tmp").exists());
        let on_disk = std::fs::read_to_string(dir.path().join("crashed.json")).unwrap();
        let parsed: RunFile = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(parsed["patients"].processed_count, 40);
    }

    #[tokio::test]
    async fn test_delete_removes_file_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.upsert(&Checkpoint::new("r1", "a", "fp")).await.unwrap();
        store.upsert(&Checkpoint::new("r1", "b", "fp")).await.unwrap();

        assert_eq!(store.delete("r1", Some("a")).await.unwrap(), 1);
        assert_eq!(store.list("r1").await.unwrap().len(), 1);
        assert_eq!(store.delete("r1", None).await.unwrap(), 1);
        assert!(!dir.path().join("r1.json").exists());
        assert_eq!(store.delete("r1", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejects_path_like_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let err = store.load("../escape", "a").await.unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidRunId(_)));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let err = store.load("bad", "a").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
