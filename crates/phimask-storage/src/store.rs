//! Store traits

use async_trait::async_trait;
use phimask_core::{Checkpoint, DocumentKey, FieldPath, PathSegment, SourceDocument};

use crate::error::{CheckpointError, ConnectorError};

/// Replace one field of a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPatch {
    pub path: FieldPath,
    /// New value in native form.
    pub value: serde_json::Value,
}

/// Field-level update of a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub key: DocumentKey,
    pub fields: Vec<FieldPatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub documents: u64,
    pub fields_applied: u64,
    /// Fields whose parent no longer exists (document deleted or reshaped).
    pub fields_skipped: u64,
}

/// A collection-oriented document database.
///
/// Keys are immutable; `find_after` pages in key order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Up to `limit` documents with key strictly greater than `after`, in key order.
    async fn find_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError>;

    async fn get(
        &self,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<Option<serde_json::Value>, ConnectorError>;

    /// Insert or replace whole documents. Returns the number written.
    async fn upsert_many(
        &self,
        collection: &str,
        documents: &[SourceDocument],
    ) -> Result<u64, ConnectorError>;

    /// Apply field-level updates without replacing untouched fields.
    async fn apply_patches(
        &self,
        collection: &str,
        patches: &[DocumentPatch],
    ) -> Result<PatchOutcome, ConnectorError>;

    async fn count(&self, collection: &str) -> Result<u64, ConnectorError>;

    async fn drop_collection(&self, collection: &str) -> Result<(), ConnectorError>;
}

/// Durable checkpoints, upserted by `(run_id, collection)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(
        &self,
        run_id: &str,
        collection: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Remove checkpoints of a run (one collection, or all when `None`).
    async fn delete(&self, run_id: &str, collection: Option<&str>) -> Result<u64, CheckpointError>;
}

/// Set the node at `path` inside a native document.
///
/// A missing final object key is inserted; a missing parent leaves the
/// document untouched and returns false.
pub fn set_native(document: &mut serde_json::Value, path: &FieldPath, value: serde_json::Value) -> bool {
    let Some((last, parents)) = path.segments().split_last() else {
        *document = value;
        return true;
    };
    let mut node = document;
    for segment in parents {
        node = match (segment, node) {
            (PathSegment::Key(k), serde_json::Value::Object(map)) => match map.get_mut(k) {
                Some(child) => child,
                None => return false,
            },
            (PathSegment::Index(i), serde_json::Value::Array(items)) => match items.get_mut(*i) {
                Some(child) => child,
                None => return false,
            },
            _ => return false,
        };
    }
    match (last, node) {
        (PathSegment::Key(k), serde_json::Value::Object(map)) => {
            map.insert(k.clone(), value);
            true
        }
        (PathSegment::Index(i), serde_json::Value::Array(items)) if *i < items.len() => {
            items[*i] = value;
            true
        }
        _ => false,
    }
}

/// Apply one document's patches, returning `(applied, skipped)`.
pub(crate) fn patch_document(document: &mut serde_json::Value, fields: &[FieldPatch]) -> (u64, u64) {
    let mut applied = 0;
    let mut skipped = 0;
    for field in fields {
        if set_native(document, &field.path, field.value.clone()) {
            applied += 1;
        } else {
            skipped += 1;
        }
    }
    (applied, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_native_targets_single_field() {
        let mut doc = json!({"_id": 1, "Contacts": [{"Email": "a@b.org", "Type": "home"}], "Other": "x"});
        let path = FieldPath::root().child_key("Contacts").child_index(0).child_key("Email");
        assert!(set_native(&mut doc, &path, json!("user@masked.com")));
        assert_eq!(
            doc,
            json!({"_id": 1, "Contacts": [{"Email": "user@masked.com", "Type": "home"}], "Other": "x"})
        );

        let gone = FieldPath::root().child_key("Contacts").child_index(3).child_key("Email");
        assert!(!set_native(&mut doc, &gone, json!("x")));
    }

    #[test]
    fn test_patch_document_counts() {
        let mut doc = json!({"A": 1});
        let fields = vec![
            FieldPatch {
                path: FieldPath::root().child_key("A"),
                value: json!(2),
            },
            FieldPatch {
                path: FieldPath::root().child_key("B").child_key("C"),
                value: json!(3),
            },
        ];
        assert_eq!(patch_document(&mut doc, &fields), (1, 1));
        assert_eq!(doc, json!({"A": 2}));
    }
}
