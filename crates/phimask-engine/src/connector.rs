//! Read/write bindings between a collection and the processor
//!
//! Copy mode leaves the source untouched and upserts whole masked documents
//! into a destination collection. In-situ mode writes field-level patches back
//! into the source and must be explicitly confirmed.

use std::sync::Arc;

use async_trait::async_trait;
use phimask_core::{ConfigurationError, DocumentKey, SourceDocument};
use phimask_storage::{ConnectorError, DocumentPatch, DocumentStore, FieldPatch};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorMode {
    Copy,
    InSitu,
}

impl ConnectorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorMode::Copy => "copy",
            ConnectorMode::InSitu => "in_situ",
        }
    }
}

/// One successfully masked document, ready for either write mode.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedDocument {
    pub key: DocumentKey,
    /// Whole masked document in native form.
    pub body: serde_json::Value,
    /// Changed fields only.
    pub patches: Vec<FieldPatch>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskedBatch {
    pub sequence: u64,
    pub documents: Vec<MaskedDocument>,
}

impl MaskedBatch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub documents: u64,
    pub fields: u64,
    /// Patches whose target no longer exists.
    pub skipped_fields: u64,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Collection documents are read from.
    fn collection(&self) -> &str;

    fn mode(&self) -> ConnectorMode;

    /// Up to `limit` documents strictly after `after`, in key order.
    async fn read(
        &self,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError>;

    async fn write(&self, batch: &MaskedBatch) -> Result<WriteResult, ConnectorError>;

    /// Drop everything written so far so the next run starts from scratch.
    async fn reset_destination(&self) -> Result<(), ConnectorError>;
}

pub struct CopyConnector {
    source: Arc<dyn DocumentStore>,
    destination: Arc<dyn DocumentStore>,
    collection: String,
    destination_collection: String,
}

impl CopyConnector {
    pub fn new(
        source: Arc<dyn DocumentStore>,
        destination: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        destination_collection: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        let collection = collection.into();
        let destination_collection = destination_collection.into();
        if Arc::ptr_eq(&source, &destination) && collection == destination_collection {
            return Err(ConfigurationError::Invalid(format!(
                "copy destination for '{}' is the source collection itself",
                collection
            )));
        }
        Ok(Self {
            source,
            destination,
            collection,
            destination_collection,
        })
    }

    pub fn destination_collection(&self) -> &str {
        &self.destination_collection
    }
}

#[async_trait]
impl Connector for CopyConnector {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::Copy
    }

    async fn read(
        &self,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError> {
        self.source.find_after(&self.collection, after, limit).await
    }

    async fn write(&self, batch: &MaskedBatch) -> Result<WriteResult, ConnectorError> {
        if batch.is_empty() {
            return Ok(WriteResult::default());
        }
        let documents: Vec<SourceDocument> = batch
            .documents
            .iter()
            .map(|d| SourceDocument::new(d.key.clone(), d.body.clone()))
            .collect();
        let written = self
            .destination
            .upsert_many(&self.destination_collection, &documents)
            .await?;
        Ok(WriteResult {
            documents: written,
            fields: 0,
            skipped_fields: 0,
        })
    }

    async fn reset_destination(&self) -> Result<(), ConnectorError> {
        info!(destination = %self.destination_collection, "Dropping destination collection");
        self.destination
            .drop_collection(&self.destination_collection)
            .await
    }
}

pub struct InSituConnector {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl InSituConnector {
    /// Fails before any I/O unless `confirmed_destructive` is set.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        confirmed_destructive: bool,
    ) -> Result<Self, ConfigurationError> {
        let collection = collection.into();
        if !confirmed_destructive {
            return Err(ConfigurationError::DestructiveNotConfirmed(collection));
        }
        Ok(Self { store, collection })
    }
}

#[async_trait]
impl Connector for InSituConnector {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn mode(&self) -> ConnectorMode {
        ConnectorMode::InSitu
    }

    async fn read(
        &self,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError> {
        self.store.find_after(&self.collection, after, limit).await
    }

    async fn write(&self, batch: &MaskedBatch) -> Result<WriteResult, ConnectorError> {
        let patches: Vec<DocumentPatch> = batch
            .documents
            .iter()
            .filter(|d| !d.patches.is_empty())
            .map(|d| DocumentPatch {
                key: d.key.clone(),
                fields: d.patches.clone(),
            })
            .collect();
        if patches.is_empty() {
            return Ok(WriteResult::default());
        }
        let outcome = self.store.apply_patches(&self.collection, &patches).await?;
        Ok(WriteResult {
            documents: outcome.documents,
            fields: outcome.fields_applied,
            skipped_fields: outcome.fields_skipped,
        })
    }

    async fn reset_destination(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Fatal(format!(
            "'{}' is masked in place and has no separate destination to reset",
            self.collection
        )))
    }
}
