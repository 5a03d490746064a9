//! Core domain models for phimask
//!
//! This crate contains:
//! - The schema-less document model (Value, paths, traversal)
//! - Document keys and batches
//! - Checkpoint records
//! - Error types shared by every layer

pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod key;
pub mod value;

pub use batch::{Batch, SourceDocument};
pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use error::{ConfigurationError, MaskingError, ValueConversionError};
pub use key::DocumentKey;
pub use value::{FieldPath, Map, PathSegment, Value, Walk};
