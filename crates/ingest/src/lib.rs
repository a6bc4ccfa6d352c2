//! Ingest crate - Email invoice ingestion and sync engine
//!
//! This crate provides:
//! - Domain models (MailboxConnection, Document, UsageCounter)
//! - Gmail API client and OAuth token management
//! - Storage trait abstractions for documents and blobs
//! - Leased, idempotent sync runs driven by polling or push notifications
//! - Extraction service integration and field normalization
//! - Background preview rendering for PDF documents
//!
//! Everything here is synchronous; the `ingestd` daemon hosts it on tokio.

pub mod config;
pub mod error;
pub mod extract;
pub mod gmail;
pub mod models;
pub mod render;
pub mod storage;
pub mod sync;

pub use config::{EngineConfig, GmailCredentials};
pub use error::{IngestError, IngestResult};
pub use extract::{ExtractionRequest, ExtractionService, HttpExtractionClient, RawExtraction};
pub use gmail::{
    ConnectionOnboarding, ConsentStates, GmailClient, GoogleTokenEndpoint, HistoryExpiredError,
    MailProvider, TokenEndpoint, TokenManager,
};
pub use models::{
    ConnectionId, Document, DocumentId, DocumentStatus, ExtractedFields, MailboxConnection,
    MessageId, Origin, OwnerId, UsageMonth,
};
pub use render::{PageRenderer, PdftoppmRenderer, RenderedPage};
pub use storage::{
    BlobStore, FileBlobStore, InMemoryIngestStore, IngestStore, MemoryBlobStore, SqliteIngestStore,
};
pub use sync::{
    NormalizerSession, PreviewNormalizer, PushHandler, PushOutcome, SyncContext, SyncMode,
    SyncOrchestrator, SyncReport, due_connections, register_watch, run_batch,
};
