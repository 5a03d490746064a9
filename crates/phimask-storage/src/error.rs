//! Error types for phimask-storage

use std::time::Duration;

use thiserror::Error;

/// Failure talking to a document store.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid document {key} in '{collection}': {reason}")]
    InvalidDocument {
        collection: String,
        key: String,
        reason: String,
    },

    #[error("Fatal store error: {0}")]
    Fatal(String),
}

impl ConnectorError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::Timeout { .. } | ConnectorError::Unavailable(_) => true,
            ConnectorError::Database(err) => match err {
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| is_busy_code(&code)),
                _ => false,
            },
            ConnectorError::Serialization(_)
            | ConnectorError::InvalidDocument { .. }
            | ConnectorError::Fatal(_) => false,
        }
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED, including their extended codes
/// (e.g. 517 SQLITE_BUSY_SNAPSHOT, 262 SQLITE_LOCKED_SHAREDCACHE).
fn is_busy_code(code: &str) -> bool {
    code.parse::<i32>()
        .is_ok_and(|code| matches!(code & 0xff, 5 | 6))
}

/// Failure reading or committing a checkpoint. Always fatal for the run.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt checkpoint for run '{run_id}' on '{collection}': {reason}")]
    Corrupt {
        run_id: String,
        collection: String,
        reason: String,
    },

    #[error("Invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("Checkpoint commit timed out after {0:?}")]
    Timeout(Duration),

    #[error("Checkpoint store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ConnectorError::Unavailable("down".to_string()).is_retryable());
        assert!(
            ConnectorError::Timeout {
                operation: "write",
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
        assert!(ConnectorError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!ConnectorError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!ConnectorError::Fatal("disk full".to_string()).is_retryable());
    }

    #[test]
    fn test_extended_busy_codes_are_retryable() {
        for code in ["5", "6", "261", "517", "262", "773"] {
            assert!(is_busy_code(code), "{} should be retryable", code);
        }
        for code in ["1", "11", "19", "2067", "not-a-code"] {
            assert!(!is_busy_code(code), "{} should be fatal", code);
        }
    }
}
