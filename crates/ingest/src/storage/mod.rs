//! Storage traits and implementations
//!
//! `IngestStore` is the document repository (connections, documents, usage
//! counters and sync leases). `BlobStore` holds invoice assets and rendered
//! pages. Each has an in-memory implementation and a persistent one.

mod blob;
mod blob_file;
mod memory;
mod sqlite;
mod traits;

pub use blob::{BlobStore, MemoryBlobStore, asset_path, sanitize_filename};
pub use blob_file::FileBlobStore;
pub use memory::InMemoryIngestStore;
pub use sqlite::SqliteIngestStore;
pub use traits::{IngestStore, SyncLease};
