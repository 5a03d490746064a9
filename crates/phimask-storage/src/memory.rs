//! In-memory stores
//!
//! Used for dry runs and tests. Both stores can be told to fail upcoming
//! operations so retry and failure paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use phimask_core::{Checkpoint, DocumentKey, SourceDocument};
use tokio::sync::RwLock;

use crate::error::{CheckpointError, ConnectorError};
use crate::store::{CheckpointStore, DocumentPatch, DocumentStore, PatchOutcome, patch_document};

type Collection = BTreeMap<DocumentKey, serde_json::Value>;

#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    reads: AtomicU64,
    writes: AtomicU64,
    transient_write_failures: AtomicU32,
    reject_writes: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a collection. Documents without a usable `_id` are ignored.
    pub async fn insert_documents(&self, collection: &str, documents: Vec<serde_json::Value>) {
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        for document in documents {
            if let Some(key) = DocumentKey::of(&document) {
                target.insert(key, document);
            }
        }
    }

    /// Full contents of a collection in key order.
    pub async fn snapshot(&self, collection: &str) -> Vec<SourceDocument> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(k, v)| SourceDocument::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fail the next `count` writes with a retryable error.
    pub fn fail_next_writes(&self, count: u32) {
        self.transient_write_failures.store(count, Ordering::SeqCst);
    }

    /// Fail every write with a non-retryable error until cleared.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), ConnectorError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(ConnectorError::Fatal("writes rejected".to_string()));
        }
        let injected = self
            .transient_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(ConnectorError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError> {
        use std::ops::Bound;

        self.reads.fetch_add(1, Ordering::SeqCst);
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(docs
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| SourceDocument::new(k.clone(), v.clone()))
            .collect())
    }

    async fn get(
        &self,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<Option<serde_json::Value>, ConnectorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|docs| docs.get(key)).cloned())
    }

    async fn upsert_many(
        &self,
        collection: &str,
        documents: &[SourceDocument],
    ) -> Result<u64, ConnectorError> {
        self.check_write()?;
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();
        for document in documents {
            target.insert(document.key.clone(), document.body.clone());
        }
        Ok(documents.len() as u64)
    }

    async fn apply_patches(
        &self,
        collection: &str,
        patches: &[DocumentPatch],
    ) -> Result<PatchOutcome, ConnectorError> {
        self.check_write()?;
        let mut collections = self.collections.write().await;
        let mut outcome = PatchOutcome::default();
        let Some(target) = collections.get_mut(collection) else {
            outcome.fields_skipped = patches.iter().map(|p| p.fields.len() as u64).sum();
            return Ok(outcome);
        };
        for patch in patches {
            match target.get_mut(&patch.key) {
                Some(document) => {
                    let (applied, skipped) = patch_document(document, &patch.fields);
                    outcome.documents += 1;
                    outcome.fields_applied += applied;
                    outcome.fields_skipped += skipped;
                }
                None => outcome.fields_skipped += patch.fields.len() as u64,
            }
        }
        Ok(outcome)
    }

    async fn count(&self, collection: &str) -> Result<u64, ConnectorError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|d| d.len() as u64).unwrap_or(0))
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), ConnectorError> {
        self.check_write()?;
        self.collections.write().await.remove(collection);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<(String, String), Checkpoint>>,
    commits: AtomicU64,
    failing_commits: AtomicU32,
    commit_budget: AtomicBool,
    remaining_commits: AtomicU64,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commits.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Accept `count` more commits, then fail every commit until cleared.
    pub fn fail_commits_after(&self, count: u64) {
        self.remaining_commits.store(count, Ordering::SeqCst);
        self.commit_budget.store(true, Ordering::SeqCst);
    }

    pub fn clear_commit_failures(&self) {
        self.commit_budget.store(false, Ordering::SeqCst);
        self.failing_commits.store(0, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(
        &self,
        run_id: &str,
        collection: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(&(run_id.to_string(), collection.to_string()))
            .cloned())
    }

    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(CheckpointError::Unavailable("injected commit failure".to_string()));
        }
        if self.commit_budget.load(Ordering::SeqCst)
            && self
                .remaining_commits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return Err(CheckpointError::Unavailable("commit budget exhausted".to_string()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.checkpoints.write().await.insert(
            (checkpoint.run_id.clone(), checkpoint.collection.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().await;
        let mut found: Vec<Checkpoint> = checkpoints
            .values()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.collection.cmp(&b.collection));
        Ok(found)
    }

    async fn delete(&self, run_id: &str, collection: Option<&str>) -> Result<u64, CheckpointError> {
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|(run, coll), _| {
            !(run == run_id && collection.is_none_or(|c| c == coll))
        });
        Ok((before - checkpoints.len()) as u64)
    }
}
