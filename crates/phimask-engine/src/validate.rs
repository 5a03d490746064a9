//! Post-run sampling validation (copy mode)

use phimask_core::{DocumentKey, SourceDocument, Value};
use phimask_masking::{RuleSet, ValidationReport, compare};
use phimask_storage::{ConnectorError, DocumentStore};
use serde::Serialize;
use tracing::{debug, info};

const SCAN_PAGE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReport {
    pub key: DocumentKey,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleReport {
    pub sampled: usize,
    /// Sampled keys with no destination document.
    pub missing_documents: Vec<DocumentKey>,
    /// Sampled keys whose source or destination could not be parsed.
    pub unreadable_documents: Vec<DocumentKey>,
    pub documents: Vec<DocumentReport>,
}

impl SampleReport {
    pub fn is_clean(&self) -> bool {
        self.missing_documents.is_empty()
            && self.unreadable_documents.is_empty()
            && self.documents.iter().all(|d| d.report.is_clean())
    }

    pub fn fields_expected_masked(&self) -> usize {
        self.documents.iter().map(|d| d.report.fields_expected_masked.len()).sum()
    }

    pub fn fields_actually_masked(&self) -> usize {
        self.documents.iter().map(|d| d.report.fields_actually_masked.len()).sum()
    }

    /// Documents with at least one finding.
    pub fn dirty(&self) -> impl Iterator<Item = &DocumentReport> {
        self.documents.iter().filter(|d| !d.report.is_clean())
    }
}

/// Positions `0..total` picked evenly for a sample of `n`.
fn sample_positions(total: u64, n: usize) -> Vec<u64> {
    if total == 0 || n == 0 {
        return Vec::new();
    }
    let n = (n as u64).min(total);
    let mut positions: Vec<u64> = (0..n).map(|i| i * total / n).collect();
    positions.dedup();
    positions
}

/// Compare `sample` source documents, spread evenly over the key range, with
/// their masked counterparts. Reads only.
pub async fn sample_and_validate(
    source: &dyn DocumentStore,
    collection: &str,
    destination: &dyn DocumentStore,
    destination_collection: &str,
    rules: &RuleSet,
    sample: usize,
) -> Result<SampleReport, ConnectorError> {
    let total = source.count(collection).await?;
    let positions = sample_positions(total, sample);
    let picked = pick(source, collection, &positions).await?;
    debug!(collection = %collection, total, sampled = picked.len(), "Picked validation sample");

    let mut report = SampleReport {
        sampled: picked.len(),
        ..SampleReport::default()
    };
    for document in picked {
        let Some(masked) = destination.get(destination_collection, &document.key).await? else {
            report.missing_documents.push(document.key);
            continue;
        };
        let (Ok(source_value), Ok(dest_value)) =
            (Value::from_native(document.body), Value::from_native(masked))
        else {
            report.unreadable_documents.push(document.key);
            continue;
        };
        report.documents.push(DocumentReport {
            report: compare(&source_value, &dest_value, rules),
            key: document.key,
        });
    }

    info!(
        collection = %collection,
        destination = %destination_collection,
        sampled = report.sampled,
        clean = report.is_clean(),
        "Validated sample"
    );
    Ok(report)
}

async fn pick(
    store: &dyn DocumentStore,
    collection: &str,
    positions: &[u64],
) -> Result<Vec<SourceDocument>, ConnectorError> {
    let mut picked = Vec::with_capacity(positions.len());
    let mut wanted = positions.iter().copied().peekable();
    let mut position = 0u64;
    let mut after: Option<DocumentKey> = None;

    while wanted.peek().is_some() {
        let page = store.find_after(collection, after.as_ref(), SCAN_PAGE).await?;
        let page_len = page.len();
        after = page.last().map(|d| d.key.clone());
        for document in page {
            if wanted.peek() == Some(&position) {
                wanted.next();
                picked.push(document);
            }
            position += 1;
        }
        if page_len < SCAN_PAGE {
            break;
        }
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use phimask_storage::MemoryDocumentStore;
    use serde_json::json;

    #[test]
    fn test_sample_positions_spread() {
        assert_eq!(sample_positions(10, 5), vec![0, 2, 4, 6, 8]);
        assert_eq!(sample_positions(3, 10), vec![0, 1, 2]);
        assert!(sample_positions(0, 4).is_empty());
        assert!(sample_positions(10, 0).is_empty());
    }

    #[tokio::test]
    async fn test_reports_unmasked_and_missing() {
        let store = MemoryDocumentStore::new();
        store
            .insert_documents(
                "p",
                (1..=4).map(|i| json!({"_id": i, "Name": "Jane", "Ward": "B"})).collect(),
            )
            .await;
        store
            .insert_documents(
                "p_masked",
                vec![
                    json!({"_id": 1, "Name": "XQZT", "Ward": "B"}),
                    json!({"_id": 2, "Name": "Jane", "Ward": "B"}),
                    json!({"_id": 3, "Name": "KKKK", "Ward": "C"}),
                ],
            )
            .await;
        let rules = RuleSet::from_value(json!([
            {"field": "Name", "strategy": "randomUppercaseWords", "params": {"count": 1}}
        ]))
        .unwrap();

        let report = sample_and_validate(&store, "p", &store, "p_masked", &rules, 4)
            .await
            .unwrap();
        assert_eq!(report.sampled, 4);
        assert_eq!(report.missing_documents, vec![DocumentKey::Int(4)]);
        assert_eq!(report.fields_expected_masked(), 3);
        assert_eq!(report.fields_actually_masked(), 2);
        let dirty: Vec<_> = report.dirty().map(|d| d.key.clone()).collect();
        assert_eq!(dirty, vec![DocumentKey::Int(2), DocumentKey::Int(3)]);
        assert!(!report.is_clean());
    }
}
