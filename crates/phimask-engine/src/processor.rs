//! Per-collection masking state machine
//!
//! `Initializing -> Running -> {Completed, Failed, Paused}`
//!
//! Running loops fetch, mask, write, commit. Documents that cannot be masked
//! are recorded as failed keys and the rest of their batch is still written.
//! Read and write failures are retried; once retries are exhausted the run is
//! Failed with the checkpoint at the last written batch. Checkpoint failures
//! end the run immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use phimask_core::{
    Batch, Checkpoint, CheckpointStatus, ConfigurationError, DocumentKey, SourceDocument, Value,
};
use phimask_masking::MaskingEngine;
use phimask_storage::{CheckpointError, CheckpointStore, FieldPatch};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connector::{Connector, ConnectorMode, MaskedBatch, MaskedDocument};
use crate::cursor::BatchCursor;
use crate::error::{DocumentError, ProcessorError};
use crate::retry::RetryPolicy;
use crate::sizer::BatchSizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Initializing,
    Running,
    Completed,
    Failed,
    Paused,
}

impl ProcessorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessorState::Completed | ProcessorState::Failed | ProcessorState::Paused
        )
    }
}

/// Cooperative stop signal, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchSizeOptions {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub target_write_latency: Duration,
}

impl Default for BatchSizeOptions {
    fn default() -> Self {
        Self {
            initial: 500,
            min: 50,
            max: 5000,
            target_write_latency: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: String,
    /// Commit after at least this many documents (at batch boundaries).
    /// In-situ runs commit after every batch regardless.
    pub checkpoint_interval: u64,
    pub batch_size: BatchSizeOptions,
    pub retry: RetryPolicy,
    /// Stop (Paused) after this many documents.
    pub limit: Option<u64>,
    /// Mask and count without writing documents or checkpoints.
    pub dry_run: bool,
    /// Discard any stored checkpoint before starting.
    pub reset_checkpoint: bool,
    /// Drop the copy destination (and the checkpoint) once the run has
    /// passed validation.
    pub reset_destination: bool,
}

impl RunOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            checkpoint_interval: 1000,
            batch_size: BatchSizeOptions::default(),
            retry: RetryPolicy::default(),
            limit: None,
            dry_run: false,
            reset_checkpoint: false,
            reset_destination: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub collection: String,
    pub state: ProcessorState,
    /// Documents masked and written by this invocation.
    pub processed: u64,
    /// Documents that failed masking in this invocation.
    pub failed_keys: Vec<DocumentKey>,
    /// Documents already covered by an earlier invocation of the run.
    pub skipped: u64,
    pub batches: u64,
    pub resumed_after: Option<DocumentKey>,
}

pub struct Processor {
    connector: Arc<dyn Connector>,
    engine: MaskingEngine,
    checkpoints: Arc<dyn CheckpointStore>,
    options: RunOptions,
    cancel: CancellationFlag,
    state: ProcessorState,
}

impl Processor {
    pub fn new(
        connector: Arc<dyn Connector>,
        engine: MaskingEngine,
        checkpoints: Arc<dyn CheckpointStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            connector,
            engine,
            checkpoints,
            options,
            cancel: CancellationFlag::new(),
            state: ProcessorState::Initializing,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn collection(&self) -> &str {
        self.connector.collection()
    }

    pub fn run_id(&self) -> &str {
        &self.options.run_id
    }

    pub async fn run(&mut self) -> Result<RunSummary, ProcessorError> {
        self.state = ProcessorState::Initializing;
        let result = self.run_inner().await;
        if result.is_err() {
            self.state = ProcessorState::Failed;
        }
        result
    }

    async fn run_inner(&mut self) -> Result<RunSummary, ProcessorError> {
        let sizer = self.validate()?;
        let collection = self.connector.collection().to_string();
        let run_id = self.options.run_id.clone();
        let fingerprint = self.engine.rules().fingerprint().to_string();

        if self.options.reset_destination && !self.options.dry_run {
            let connector = self.connector.as_ref();
            self.options
                .retry
                .run("reset_destination", move || connector.reset_destination())
                .await?;
            info!(run_id = %run_id, collection = %collection, "Reset destination");
        }

        if (self.options.reset_checkpoint || self.options.reset_destination) && !self.options.dry_run {
            let removed = self.checkpoints.delete(&run_id, Some(&collection)).await?;
            info!(run_id = %run_id, collection = %collection, removed, "Reset checkpoint");
        }

        let stored = self.load_checkpoint(&run_id, &collection).await?;
        let mut checkpoint = match stored {
            Some(existing) => {
                if existing.rules_fingerprint != fingerprint {
                    return Err(ConfigurationError::RulesChanged {
                        run_id,
                        collection,
                        expected: existing.rules_fingerprint,
                        found: fingerprint,
                    }
                    .into());
                }
                existing
            }
            None => Checkpoint::new(&run_id, &collection, &fingerprint),
        };

        let mut summary = RunSummary {
            run_id: run_id.clone(),
            collection: collection.clone(),
            state: ProcessorState::Initializing,
            processed: 0,
            failed_keys: Vec::new(),
            skipped: checkpoint.covered_count(),
            batches: 0,
            resumed_after: checkpoint.last_key.clone(),
        };

        if checkpoint.is_completed() {
            info!(
                run_id = %run_id,
                collection = %collection,
                skipped = summary.skipped,
                "Checkpoint already completed, nothing to do"
            );
            self.state = ProcessorState::Completed;
            summary.state = self.state;
            return Ok(summary);
        }

        if checkpoint.status != CheckpointStatus::Pending {
            checkpoint.set_status(CheckpointStatus::Pending);
        }
        self.commit(&checkpoint).await?;

        self.state = ProcessorState::Running;
        info!(
            run_id = %run_id,
            collection = %collection,
            mode = self.connector.mode().as_str(),
            resume_after = ?checkpoint.last_key,
            dry_run = self.options.dry_run,
            "Starting masking run"
        );

        let mut cursor = BatchCursor::open(
            self.connector.clone(),
            checkpoint.last_key.clone(),
            sizer,
            self.options.limit,
        );
        let mut uncommitted = 0u64;
        // In-situ writes cannot be undone, so a resume must never replay more
        // than the batch whose commit was lost.
        let commit_every_batch = self.connector.mode() == ConnectorMode::InSitu;
        if commit_every_batch && self.options.checkpoint_interval > 1 {
            debug!(
                collection = %collection,
                checkpoint_interval = self.options.checkpoint_interval,
                "In-situ run commits after every batch"
            );
        }

        let outcome = loop {
            if self.cancel.is_cancelled() {
                info!(run_id = %run_id, collection = %collection, "Cancellation requested");
                break ProcessorState::Paused;
            }

            let next = cursor.next(&self.options.retry).await;
            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) if cursor.hit_limit() => break ProcessorState::Paused,
                Ok(None) => break ProcessorState::Completed,
                Err(err) => return self.fail(&mut checkpoint, err).await,
            };

            let Some(last_key) = batch.last_key().cloned() else {
                continue;
            };
            let (masked, failed) = self.mask_batch(&batch);

            if !self.options.dry_run {
                let connector = self.connector.as_ref();
                let to_write = &masked;
                let write = self
                    .options
                    .retry
                    .run("write", move || connector.write(to_write))
                    .await;
                match write {
                    Ok(written) => {
                        if written.attempts > 1 {
                            cursor.sizer_mut().record_failure();
                        } else {
                            cursor.sizer_mut().record_success(written.elapsed);
                        }
                        if written.value.skipped_fields > 0 {
                            warn!(
                                collection = %collection,
                                skipped_fields = written.value.skipped_fields,
                                "Some patches targeted fields that no longer exist"
                            );
                        }
                    }
                    Err(err) => return self.fail(&mut checkpoint, err).await,
                }
            }

            summary.batches += 1;
            summary.processed += masked.len() as u64;
            summary.failed_keys.extend(failed.iter().cloned());
            checkpoint.record_batch(last_key, masked.len() as u64, failed);
            uncommitted += batch.len() as u64;

            debug!(
                collection = %collection,
                sequence = batch.sequence,
                batch_size = batch.len(),
                next_batch_size = cursor.sizer().current(),
                "Batch written"
            );

            if commit_every_batch || uncommitted >= self.options.checkpoint_interval {
                self.commit(&checkpoint).await?;
                uncommitted = 0;
            }
        };

        if outcome == ProcessorState::Completed {
            checkpoint.set_status(CheckpointStatus::Completed);
        }
        self.commit(&checkpoint).await?;

        self.state = outcome;
        summary.state = outcome;
        info!(
            run_id = %run_id,
            collection = %collection,
            state = ?outcome,
            processed = summary.processed,
            failed = summary.failed_keys.len(),
            skipped = summary.skipped,
            batches = summary.batches,
            "Masking run finished"
        );
        Ok(summary)
    }

    fn validate(&self) -> Result<BatchSizer, ConfigurationError> {
        if self.options.checkpoint_interval == 0 {
            return Err(ConfigurationError::Invalid(
                "checkpoint_interval must be at least 1".to_string(),
            ));
        }
        if self.options.run_id.trim().is_empty() {
            return Err(ConfigurationError::Invalid("run id must not be empty".to_string()));
        }
        if let Some((rule, _)) = self.engine.rules().match_field(DocumentKey::FIELD) {
            if !rule.strategy.is_identity() {
                return Err(ConfigurationError::Invalid(format!(
                    "rule '{}' would mask the primary key field",
                    rule.matcher
                )));
            }
        }
        if self.options.reset_destination && self.connector.mode() == ConnectorMode::InSitu {
            return Err(ConfigurationError::Invalid(format!(
                "'{}' is masked in place; there is no destination to reset",
                self.connector.collection()
            )));
        }
        let sizes = &self.options.batch_size;
        BatchSizer::new(sizes.initial, sizes.min, sizes.max, sizes.target_write_latency)
    }

    fn mask_batch(&self, batch: &Batch) -> (MaskedBatch, Vec<DocumentKey>) {
        let mut masked = MaskedBatch {
            sequence: batch.sequence,
            documents: Vec::with_capacity(batch.len()),
        };
        let mut failed = Vec::new();
        for document in &batch.documents {
            match self.mask_document(document) {
                Ok(doc) => masked.documents.push(doc),
                Err(err) => {
                    warn!(
                        collection = %self.connector.collection(),
                        key = %document.key,
                        error = %err,
                        "Document failed masking"
                    );
                    failed.push(document.key.clone());
                }
            }
        }
        (masked, failed)
    }

    fn mask_document(&self, document: &SourceDocument) -> Result<MaskedDocument, DocumentError> {
        let mut value = Value::from_native(document.body.clone())?;
        let touched = self.engine.apply_in_place(&mut value, Some(&document.key))?;
        let body = value.to_native()?;

        let mut patches = Vec::with_capacity(touched.len());
        for path in touched {
            if let Some(node) = value.get_path(&path) {
                patches.push(FieldPatch {
                    value: node.to_native()?,
                    path,
                });
            }
        }

        Ok(MaskedDocument {
            key: document.key.clone(),
            body,
            patches,
        })
    }

    async fn load_checkpoint(
        &self,
        run_id: &str,
        collection: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let timeout = self.options.retry.op_timeout;
        tokio::time::timeout(timeout, self.checkpoints.load(run_id, collection))
            .await
            .map_err(|_| CheckpointError::Timeout(timeout))?
    }

    async fn commit(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.options.dry_run {
            return Ok(());
        }
        let timeout = self.options.retry.op_timeout;
        tokio::time::timeout(timeout, self.checkpoints.upsert(checkpoint))
            .await
            .map_err(|_| CheckpointError::Timeout(timeout))??;
        debug!(
            run_id = %checkpoint.run_id,
            collection = %checkpoint.collection,
            last_key = ?checkpoint.last_key,
            processed = checkpoint.processed_count,
            status = checkpoint.status.as_str(),
            "Committed checkpoint"
        );
        Ok(())
    }

    /// Persist the last written position as Failed and surface `err`.
    async fn fail(
        &mut self,
        checkpoint: &mut Checkpoint,
        err: ProcessorError,
    ) -> Result<RunSummary, ProcessorError> {
        warn!(
            run_id = %checkpoint.run_id,
            collection = %checkpoint.collection,
            last_key = ?checkpoint.last_key,
            error = %err,
            "Masking run failed"
        );
        self.state = ProcessorState::Failed;
        checkpoint.set_status(CheckpointStatus::Failed);
        self.commit(checkpoint).await?;
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CopyConnector;
    use phimask_masking::RuleSet;
    use phimask_storage::{DocumentStore, MemoryCheckpointStore, MemoryDocumentStore};
    use serde_json::json;

    fn rules(json: serde_json::Value) -> Arc<RuleSet> {
        Arc::new(RuleSet::from_value(json).unwrap())
    }

    async fn setup(
        documents: Vec<serde_json::Value>,
    ) -> (Arc<MemoryDocumentStore>, Arc<dyn Connector>) {
        let memory = Arc::new(MemoryDocumentStore::new());
        memory.insert_documents("patients", documents).await;
        let store: Arc<dyn DocumentStore> = memory.clone();
        let connector = CopyConnector::new(store.clone(), store, "patients", "patients_masked").unwrap();
        (memory, Arc::new(connector))
    }

    fn options() -> RunOptions {
        let mut options = RunOptions::new("test-run");
        options.checkpoint_interval = 2;
        options.batch_size = BatchSizeOptions {
            initial: 2,
            min: 1,
            max: 4,
            target_write_latency: Duration::from_secs(2),
        };
        options
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_rejects_rule_on_primary_key() {
        let (memory, connector) = setup(vec![json!({"_id": 1})]).await;
        let engine = MaskingEngine::new(rules(json!([
            {"field": "_id", "strategy": "randomDigits", "params": {"n": 4}}
        ])));
        let mut processor = Processor::new(connector, engine, Arc::new(MemoryCheckpointStore::new()), options());
        let err = processor.run().await.unwrap_err();
        assert!(matches!(err, ProcessorError::Configuration(_)));
        assert_eq!(processor.state(), ProcessorState::Failed);
        assert_eq!(memory.read_count(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (memory, connector) = setup((1..=5).map(|i| json!({"_id": i, "Name": "Jane"})).collect()).await;
        let engine = MaskingEngine::new(rules(json!([
            {"field": "Name", "strategy": "fixedString", "params": {"value": "X"}}
        ])));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut opts = options();
        opts.dry_run = true;

        let summary = Processor::new(connector, engine, checkpoints.clone(), opts)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.state, ProcessorState::Completed);
        assert_eq!(summary.processed, 5);
        assert_eq!(memory.write_count(), 0);
        assert_eq!(checkpoints.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_interval_batches_commits() {
        let (_memory, connector) = setup((1..=8).map(|i| json!({"_id": i})).collect()).await;
        let engine = MaskingEngine::new(rules(json!([])));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut opts = options();
        opts.checkpoint_interval = 4;
        opts.batch_size = BatchSizeOptions {
            initial: 2,
            min: 2,
            max: 2,
            target_write_latency: Duration::from_secs(2),
        };

        let summary = Processor::new(connector, engine, checkpoints.clone(), opts)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.batches, 4);
        // start + two interval commits + final
        assert_eq!(checkpoints.commit_count(), 4);
        let stored = checkpoints.load("test-run", "patients").await.unwrap().unwrap();
        assert!(stored.is_completed());
        assert_eq!(stored.processed_count, 8);
    }
}
