//! Error types for phimask-engine

use phimask_core::{ConfigurationError, MaskingError, ValueConversionError};
use phimask_storage::{CheckpointError, ConnectorError};
use thiserror::Error;

/// Why a run stopped short of completion.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Connector error during {operation}: {source}")]
    Connector {
        operation: &'static str,
        #[source]
        source: ConnectorError,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: ConnectorError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Why a single document was left out of a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error(transparent)]
    Conversion(#[from] ValueConversionError),

    #[error(transparent)]
    Masking(#[from] MaskingError),
}
