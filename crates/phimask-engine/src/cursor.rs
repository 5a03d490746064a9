//! Key-ordered batch cursor

use std::sync::Arc;

use phimask_core::{Batch, DocumentKey};
use tracing::debug;

use crate::connector::Connector;
use crate::error::ProcessorError;
use crate::retry::RetryPolicy;
use crate::sizer::BatchSizer;

/// Lazily pages through a collection strictly after a start key.
///
/// Batch sizes come from the [`BatchSizer`]; the size of a batch is fixed once
/// it has been read. Given the same data and start key, the cursor yields the
/// same keys in the same order.
pub struct BatchCursor {
    connector: Arc<dyn Connector>,
    after: Option<DocumentKey>,
    sizer: BatchSizer,
    remaining: Option<u64>,
    next_sequence: u64,
    source_exhausted: bool,
}

impl BatchCursor {
    /// `limit` caps the number of documents yielded in total.
    pub fn open(
        connector: Arc<dyn Connector>,
        start_after: Option<DocumentKey>,
        sizer: BatchSizer,
        limit: Option<u64>,
    ) -> Self {
        Self {
            connector,
            after: start_after,
            sizer,
            remaining: limit,
            next_sequence: 0,
            source_exhausted: false,
        }
    }

    /// Next batch, or `None` once the source or the limit is exhausted.
    pub async fn next(&mut self, retry: &RetryPolicy) -> Result<Option<Batch>, ProcessorError> {
        if self.source_exhausted || self.remaining == Some(0) {
            return Ok(None);
        }

        let mut size = self.sizer.current();
        if let Some(remaining) = self.remaining {
            size = size.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }

        let connector = self.connector.as_ref();
        let after = self.after.as_ref();
        let read = retry
            .run("read", move || connector.read(after, size))
            .await?;
        if read.attempts > 1 {
            self.sizer.record_failure();
        }

        let documents = read.value;
        if documents.len() < size {
            self.source_exhausted = true;
        }
        if documents.is_empty() {
            return Ok(None);
        }

        let batch = Batch {
            sequence: self.next_sequence,
            documents,
        };
        self.next_sequence += 1;
        self.after = batch.last_key().cloned();
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(batch.len() as u64);
        }

        debug!(
            collection = %self.connector.collection(),
            sequence = batch.sequence,
            batch_size = batch.len(),
            "Read batch"
        );
        Ok(Some(batch))
    }

    /// Key of the last document yielded (or the start key).
    pub fn position(&self) -> Option<&DocumentKey> {
        self.after.as_ref()
    }

    /// True once a read came back short: the collection has no more documents.
    pub fn is_source_exhausted(&self) -> bool {
        self.source_exhausted
    }

    /// True when the document limit stopped the cursor.
    pub fn hit_limit(&self) -> bool {
        !self.source_exhausted && self.remaining == Some(0)
    }

    pub fn sizer(&self) -> &BatchSizer {
        &self.sizer
    }

    pub fn sizer_mut(&mut self) -> &mut BatchSizer {
        &mut self.sizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CopyConnector;
    use phimask_storage::{DocumentStore, MemoryDocumentStore};
    use serde_json::json;
    use std::time::Duration;

    async fn connector(count: i64) -> Arc<dyn Connector> {
        let memory = Arc::new(MemoryDocumentStore::new());
        memory
            .insert_documents("p", (1..=count).map(|i| json!({"_id": i})).collect())
            .await;
        let store: Arc<dyn DocumentStore> = memory;
        Arc::new(CopyConnector::new(store.clone(), store, "p", "p_masked").unwrap())
    }

    fn fixed(size: usize) -> BatchSizer {
        BatchSizer::new(size, size, size, Duration::from_secs(1)).unwrap()
    }

    async fn drain(cursor: &mut BatchCursor) -> Vec<Vec<DocumentKey>> {
        let retry = RetryPolicy::default();
        let mut batches = Vec::new();
        while let Some(batch) = cursor.next(&retry).await.unwrap() {
            batches.push(batch.keys().cloned().collect());
        }
        batches
    }

    #[tokio::test]
    async fn test_batches_partition_the_collection() {
        let mut cursor = BatchCursor::open(connector(7).await, None, fixed(3), None);
        let batches = drain(&mut cursor).await;
        assert_eq!(batches.len(), 3);
        let keys: Vec<DocumentKey> = batches.into_iter().flatten().collect();
        assert_eq!(keys, (1..=7).map(DocumentKey::Int).collect::<Vec<_>>());
        assert!(cursor.is_source_exhausted());
        assert!(!cursor.hit_limit());
    }

    #[tokio::test]
    async fn test_resumes_strictly_after_start_key() {
        let mut cursor = BatchCursor::open(connector(5).await, Some(DocumentKey::Int(3)), fixed(10), None);
        let keys: Vec<DocumentKey> = drain(&mut cursor).await.into_iter().flatten().collect();
        assert_eq!(keys, vec![DocumentKey::Int(4), DocumentKey::Int(5)]);
    }

    #[tokio::test]
    async fn test_limit_caps_documents() {
        let mut cursor = BatchCursor::open(connector(10).await, None, fixed(4), Some(6));
        let batches = drain(&mut cursor).await;
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 2]);
        assert!(cursor.hit_limit());
        assert_eq!(cursor.position(), Some(&DocumentKey::Int(6)));
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_read() {
        let mut cursor = BatchCursor::open(connector(4).await, None, fixed(2), None);
        assert_eq!(drain(&mut cursor).await.len(), 2);
        assert!(cursor.is_source_exhausted());
    }
}
