//! Checkpoint domain model

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::DocumentKey;

/// Durable progress marker for one collection within one run.
///
/// Upserted by `(run_id, collection)`; a restarted job resumes strictly after
/// `last_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub collection: String,
    pub last_key: Option<DocumentKey>,
    pub processed_count: u64,
    #[serde(default)]
    pub failed_keys: BTreeSet<DocumentKey>,
    pub status: CheckpointStatus,
    /// Fingerprint of the rule set the run was started with.
    pub rules_fingerprint: String,
    #[serde(with = "time::serde::timestamp")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CheckpointStatus::Pending),
            "completed" => Some(CheckpointStatus::Completed),
            "failed" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, collection: impl Into<String>, rules_fingerprint: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            collection: collection.into(),
            last_key: None,
            processed_count: 0,
            failed_keys: BTreeSet::new(),
            status: CheckpointStatus::Pending,
            rules_fingerprint: rules_fingerprint.into(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Advance past a written batch.
    pub fn record_batch(
        &mut self,
        last_key: DocumentKey,
        written: u64,
        failed: impl IntoIterator<Item = DocumentKey>,
    ) {
        self.last_key = Some(last_key);
        self.processed_count += written;
        self.failed_keys.extend(failed);
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn set_status(&mut self, status: CheckpointStatus) {
        self.status = status;
        self.updated_at = OffsetDateTime::now_utc();
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_keys.len() as u64
    }

    /// Documents the run has moved past, written or failed.
    pub fn covered_count(&self) -> u64 {
        self.processed_count + self.failed_count()
    }

    pub fn is_completed(&self) -> bool {
        self.status == CheckpointStatus::Completed
    }
}
