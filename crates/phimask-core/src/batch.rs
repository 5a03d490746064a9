//! Batches of source documents

use crate::DocumentKey;

/// A document as read from the store, before conversion into the value model.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub key: DocumentKey,
    pub body: serde_json::Value,
}

impl SourceDocument {
    pub fn new(key: DocumentKey, body: serde_json::Value) -> Self {
        Self { key, body }
    }
}

/// Ordered, bounded slice of a collection. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Position of this batch within the run (0-based).
    pub sequence: u64,
    pub documents: Vec<SourceDocument>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn last_key(&self) -> Option<&DocumentKey> {
        self.documents.last().map(|d| &d.key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.iter().map(|d| &d.key)
    }
}
