//! Storage layer for phimask
//!
//! This crate provides:
//! - Document store and checkpoint store traits
//! - SQLite-backed stores (with migrations)
//! - A JSON-file checkpoint store
//! - In-memory stores with fault injection

pub mod db;
pub mod error;
pub mod file;
pub mod memory;
pub mod store;

pub use db::{Database, SqliteCheckpointStore, SqliteDocumentStore};
pub use error::{CheckpointError, ConnectorError};
pub use file::FileCheckpointStore;
pub use memory::{MemoryCheckpointStore, MemoryDocumentStore};
pub use store::{CheckpointStore, DocumentPatch, DocumentStore, FieldPatch, PatchOutcome};
