//! Masking job orchestration
//!
//! This crate provides:
//! - Connectors for copy and in-situ masking
//! - An adaptive, resumable batch cursor
//! - The per-collection processor (fetch, mask, write, checkpoint)
//! - A job runner for many collections with bounded parallelism
//! - Post-run sample validation

pub mod connector;
pub mod cursor;
pub mod error;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod sizer;
pub mod validate;

pub use connector::{
    Connector, ConnectorMode, CopyConnector, InSituConnector, MaskedBatch, MaskedDocument,
    WriteResult,
};
pub use cursor::BatchCursor;
pub use error::{DocumentError, ProcessorError};
pub use processor::{
    BatchSizeOptions, CancellationFlag, Processor, ProcessorState, RunOptions, RunSummary,
};
pub use retry::RetryPolicy;
pub use runner::{CollectionOutcome, JobReport, JobRunner, JobTotals};
pub use sizer::BatchSizer;
pub use validate::{DocumentReport, SampleReport, sample_and_validate};
