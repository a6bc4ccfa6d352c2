//! Domain models for the ingestion engine

mod candidate;
mod connection;
mod document;
mod ids;
mod usage;

pub use candidate::{AttachmentDescriptor, CandidateMessage, ContentRef, MediaType};
pub use connection::MailboxConnection;
pub use document::{
    BusinessType, Category, ConversionState, Document, DocumentStatus, DocumentType,
    ExtractedFields, Origin,
};
pub use ids::{ConnectionId, DocumentId, MessageId, OwnerId};
pub use usage::{UsageCounter, UsageMonth};
