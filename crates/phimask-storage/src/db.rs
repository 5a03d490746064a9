//! SQLite-backed stores

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use phimask_core::{Checkpoint, CheckpointStatus, DocumentKey, SourceDocument};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{CheckpointError, ConnectorError};
use crate::store::{CheckpointStore, DocumentPatch, DocumentStore, PatchOutcome, patch_document};

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        key_kind INTEGER NOT NULL,
        key_int INTEGER NOT NULL,
        key_text TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (collection, key_kind, key_int, key_text)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS checkpoints (
        run_id TEXT NOT NULL,
        collection TEXT NOT NULL,
        last_key TEXT,
        processed_count INTEGER NOT NULL,
        failed_keys TEXT NOT NULL,
        status TEXT NOT NULL,
        rules_fingerprint TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (run_id, collection)
    )"#,
];

/// Connection pool shared by the SQLite stores.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) a database file. `None` uses the default data dir.
    pub async fn open(db_path: Option<PathBuf>) -> Result<Self, sqlx::Error> {
        let path = match db_path {
            Some(path) => path,
            None => Self::default_path(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Connect with a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Each in-memory connection is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        debug!(url = %url, "Opened SQLite database");
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("org", "phimask", "phimask") {
            dirs.data_dir().join("phimask.db")
        } else {
            PathBuf::from(".phimask/phimask.db")
        }
    }

    pub fn documents(&self) -> SqliteDocumentStore {
        SqliteDocumentStore {
            pool: self.pool.clone(),
        }
    }

    pub fn checkpoints(&self) -> SqliteCheckpointStore {
        SqliteCheckpointStore {
            pool: self.pool.clone(),
        }
    }
}

fn key_columns(key: &DocumentKey) -> (i64, i64, &str) {
    match key {
        DocumentKey::Int(i) => (0, *i, ""),
        DocumentKey::Str(s) => (1, 0, s.as_str()),
    }
}

fn key_from_columns(kind: i64, int: i64, text: String) -> DocumentKey {
    if kind == 0 {
        DocumentKey::Int(int)
    } else {
        DocumentKey::Str(text)
    }
}

/// Documents stored as JSON text, one row per `(collection, key)`.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn find_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        limit: usize,
    ) -> Result<Vec<SourceDocument>, ConnectorError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<(i64, i64, String, String)> = match after {
            Some(key) => {
                let (kind, int, text) = key_columns(key);
                sqlx::query_as(
                    "SELECT key_kind, key_int, key_text, body FROM documents \
                     WHERE collection = ? AND (key_kind, key_int, key_text) > (?, ?, ?) \
                     ORDER BY key_kind, key_int, key_text LIMIT ?",
                )
                .bind(collection)
                .bind(kind)
                .bind(int)
                .bind(text)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT key_kind, key_int, key_text, body FROM documents \
                     WHERE collection = ? \
                     ORDER BY key_kind, key_int, key_text LIMIT ?",
                )
                .bind(collection)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|(kind, int, text, body)| {
                let key = key_from_columns(kind, int, text);
                let body = serde_json::from_str(&body).map_err(|e| ConnectorError::InvalidDocument {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(SourceDocument::new(key, body))
            })
            .collect()
    }

    async fn get(
        &self,
        collection: &str,
        key: &DocumentKey,
    ) -> Result<Option<serde_json::Value>, ConnectorError> {
        let (kind, int, text) = key_columns(key);
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT body FROM documents \
             WHERE collection = ? AND key_kind = ? AND key_int = ? AND key_text = ?",
        )
        .bind(collection)
        .bind(kind)
        .bind(int)
        .bind(text)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((body,)) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn upsert_many(
        &self,
        collection: &str,
        documents: &[SourceDocument],
    ) -> Result<u64, ConnectorError> {
        let mut tx = self.pool.begin().await?;
        for document in documents {
            let (kind, int, text) = key_columns(&document.key);
            let body = serde_json::to_string(&document.body)?;
            sqlx::query(
                "INSERT INTO documents (collection, key_kind, key_int, key_text, body) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (collection, key_kind, key_int, key_text) \
                 DO UPDATE SET body = excluded.body",
            )
            .bind(collection)
            .bind(kind)
            .bind(int)
            .bind(text)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(documents.len() as u64)
    }

    async fn apply_patches(
        &self,
        collection: &str,
        patches: &[DocumentPatch],
    ) -> Result<PatchOutcome, ConnectorError> {
        let mut outcome = PatchOutcome::default();
        let mut tx = self.pool.begin().await?;
        for patch in patches {
            let (kind, int, text) = key_columns(&patch.key);
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT body FROM documents \
                 WHERE collection = ? AND key_kind = ? AND key_int = ? AND key_text = ?",
            )
            .bind(collection)
            .bind(kind)
            .bind(int)
            .bind(text)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((body,)) = row else {
                outcome.fields_skipped += patch.fields.len() as u64;
                continue;
            };
            let mut document: serde_json::Value = serde_json::from_str(&body)?;
            let (applied, skipped) = patch_document(&mut document, &patch.fields);
            outcome.documents += 1;
            outcome.fields_applied += applied;
            outcome.fields_skipped += skipped;

            sqlx::query(
                "UPDATE documents SET body = ? \
                 WHERE collection = ? AND key_kind = ? AND key_int = ? AND key_text = ?",
            )
            .bind(serde_json::to_string(&document)?)
            .bind(collection)
            .bind(kind)
            .bind(int)
            .bind(text)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn count(&self, collection: &str) -> Result<u64, ConnectorError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM documents WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), ConnectorError> {
        sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

type CheckpointRow = (
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
    String,
    i64,
);

/// Checkpoints as rows keyed by `(run_id, collection)`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    fn decode(row: CheckpointRow) -> Result<Checkpoint, CheckpointError> {
        let (run_id, collection, last_key, processed_count, failed_keys, status, rules_fingerprint, updated_at) =
            row;
        let corrupt = |reason: String| CheckpointError::Corrupt {
            run_id: run_id.clone(),
            collection: collection.clone(),
            reason,
        };

        let last_key: Option<DocumentKey> = match last_key {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?),
            None => None,
        };
        let failed_keys: BTreeSet<DocumentKey> =
            serde_json::from_str(&failed_keys).map_err(|e| corrupt(e.to_string()))?;
        let status = CheckpointStatus::parse(&status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", status)))?;
        let updated_at =
            OffsetDateTime::from_unix_timestamp(updated_at).map_err(|e| corrupt(e.to_string()))?;

        Ok(Checkpoint {
            run_id,
            collection,
            last_key,
            processed_count: processed_count as u64,
            failed_keys,
            status,
            rules_fingerprint,
            updated_at,
        })
    }
}

const CHECKPOINT_COLUMNS: &str = "run_id, collection, last_key, processed_count, failed_keys, \
                                  status, rules_fingerprint, updated_at";

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(
        &self,
        run_id: &str,
        collection: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = ? AND collection = ?",
            CHECKPOINT_COLUMNS
        ))
        .bind(run_id)
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::decode).transpose()
    }

    async fn upsert(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let last_key = checkpoint
            .last_key
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let failed_keys = serde_json::to_string(&checkpoint.failed_keys)?;

        sqlx::query(&format!(
            "INSERT INTO checkpoints ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, collection) DO UPDATE SET \
             last_key = excluded.last_key, \
             processed_count = excluded.processed_count, \
             failed_keys = excluded.failed_keys, \
             status = excluded.status, \
             rules_fingerprint = excluded.rules_fingerprint, \
             updated_at = excluded.updated_at",
            CHECKPOINT_COLUMNS
        ))
        .bind(&checkpoint.run_id)
        .bind(&checkpoint.collection)
        .bind(last_key)
        .bind(checkpoint.processed_count as i64)
        .bind(failed_keys)
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.rules_fingerprint)
        .bind(checkpoint.updated_at.unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {} FROM checkpoints WHERE run_id = ? ORDER BY collection",
            CHECKPOINT_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::decode).collect()
    }

    async fn delete(&self, run_id: &str, collection: Option<&str>) -> Result<u64, CheckpointError> {
        let result = match collection {
            Some(collection) => {
                sqlx::query("DELETE FROM checkpoints WHERE run_id = ? AND collection = ?")
                    .bind(run_id)
                    .bind(collection)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
                    .bind(run_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldPatch;
    use phimask_core::FieldPath;
    use serde_json::json;

    async fn database(dir: &tempfile::TempDir) -> Database {
        Database::open(Some(dir.path().join("test.db"))).await.unwrap()
    }

    #[tokio::test]
    async fn test_document_paging_matches_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = database(&dir).await.documents();

        let docs: Vec<SourceDocument> = [json!({"_id": "b"}), json!({"_id": 10}), json!({"_id": 2}), json!({"_id": "a"})]
            .into_iter()
            .map(|d| SourceDocument::new(DocumentKey::of(&d).unwrap(), d))
            .collect();
        assert_eq!(store.upsert_many("patients", &docs).await.unwrap(), 4);
        assert_eq!(store.count("patients").await.unwrap(), 4);

        let mut seen = Vec::new();
        let mut after: Option<DocumentKey> = None;
        loop {
            let page = store.find_after("patients", after.as_ref(), 3).await.unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|d| d.key.clone());
            seen.extend(page.into_iter().map(|d| d.key));
        }
        assert_eq!(
            seen,
            vec![DocumentKey::Int(2), DocumentKey::Int(10), DocumentKey::from("a"), DocumentKey::from("b")]
        );
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_patch_targets_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = database(&dir).await.documents();
        let key = DocumentKey::Int(1);

        store
            .upsert_many("c", &[SourceDocument::new(key.clone(), json!({"_id": 1, "Name": "Jane", "Age": 40}))])
            .await
            .unwrap();
        store
            .upsert_many("c", &[SourceDocument::new(key.clone(), json!({"_id": 1, "Name": "Joan", "Age": 41}))])
            .await
            .unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);

        let outcome = store
            .apply_patches(
                "c",
                &[
                    DocumentPatch {
                        key: key.clone(),
                        fields: vec![FieldPatch {
                            path: FieldPath::root().child_key("Name"),
                            value: json!("QWERTY"),
                        }],
                    },
                    DocumentPatch {
                        key: DocumentKey::Int(99),
                        fields: vec![FieldPatch {
                            path: FieldPath::root().child_key("Name"),
                            value: json!("X"),
                        }],
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome.documents, 1);
        assert_eq!(outcome.fields_applied, 1);
        assert_eq!(outcome.fields_skipped, 1);

        let stored = store.get("c", &key).await.unwrap().unwrap();
        assert_eq!(stored, json!({"_id": 1, "Name": "QWERTY", "Age": 41}));

        store.drop_collection("c").await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = database(&dir).await.checkpoints();

        assert!(store.load("run-1", "patients").await.unwrap().is_none());

        let mut checkpoint = Checkpoint::new("run-1", "patients", "fp");
        store.upsert(&checkpoint).await.unwrap();
        checkpoint.record_batch(DocumentKey::from("k9"), 8, vec![DocumentKey::from("k4")]);
        checkpoint.set_status(CheckpointStatus::Failed);
        store.upsert(&checkpoint).await.unwrap();

        let loaded = store.load("run-1", "patients").await.unwrap().unwrap();
        assert_eq!(loaded.last_key, Some(DocumentKey::from("k9")));
        assert_eq!(loaded.processed_count, 8);
        assert!(loaded.failed_keys.contains(&DocumentKey::from("k4")));
        assert_eq!(loaded.status, CheckpointStatus::Failed);
        assert_eq!(loaded.updated_at.unix_timestamp(), checkpoint.updated_at.unix_timestamp());

        store.upsert(&Checkpoint::new("run-1", "visits", "fp")).await.unwrap();
        let all = store.list("run-1").await.unwrap();
        assert_eq!(all.iter().map(|c| c.collection.as_str()).collect::<Vec<_>>(), vec!["patients", "visits"]);

        assert_eq!(store.delete("run-1", None).await.unwrap(), 2);
    }
}
