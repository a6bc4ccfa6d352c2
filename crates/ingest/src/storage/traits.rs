//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    ConnectionId, Document, DocumentId, MailboxConnection, MessageId, OwnerId, UsageMonth,
};

/// Per-connection critical section held for the duration of one sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncLease {
    pub connection_id: ConnectionId,
    /// Opaque identity of the run holding the lease
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl SyncLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Repository for connections, documents, usage counters and leases
///
/// Abstracts over different backends (in-memory, SQLite). Every write that
/// two runs could race on is a conditional update inside the store.
pub trait IngestStore: Send + Sync {
    // === Connections ===

    /// Insert a new connection, returning its assigned id
    fn insert_connection(&self, conn: &MailboxConnection) -> Result<ConnectionId>;

    fn get_connection(&self, id: ConnectionId) -> Result<Option<MailboxConnection>>;

    /// Find the connection binding `mailbox_address` to `owner_id`
    fn find_connection(
        &self,
        owner_id: &OwnerId,
        mailbox_address: &str,
    ) -> Result<Option<MailboxConnection>>;

    /// Active connections for a mailbox address (case-insensitive), any owner
    fn find_active_by_address(&self, mailbox_address: &str) -> Result<Vec<MailboxConnection>>;

    /// All active connections, ordered by id
    fn list_active_connections(&self) -> Result<Vec<MailboxConnection>>;

    fn update_connection_tokens(
        &self,
        id: ConnectionId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    fn set_connection_active(&self, id: ConnectionId, active: bool) -> Result<()>;

    /// Commit the outcome of a run
    ///
    /// Both the cursor and `last_sync_at` only move forward: the stored value
    /// becomes the max of the stored and given values.
    fn commit_sync(
        &self,
        id: ConnectionId,
        history_cursor: Option<u64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Remove a connection and its lease (explicit user disconnect)
    fn delete_connection(&self, id: ConnectionId) -> Result<()>;

    // === Leases ===

    /// Take the connection's lease unless another holder has a live one
    ///
    /// Returns false when the lease is held and not yet expired.
    fn try_acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool>;

    /// Release the lease if `holder` still owns it
    fn release_lease(&self, id: ConnectionId, holder: &str) -> Result<()>;

    fn get_lease(&self, id: ConnectionId) -> Result<Option<SyncLease>>;

    // === Documents ===

    /// Insert a new document, returning its assigned id
    fn insert_document(&self, doc: &Document) -> Result<DocumentId>;

    /// Overwrite an existing document
    fn update_document(&self, doc: &Document) -> Result<()>;

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    /// Document previously ingested from a provider message
    fn find_by_source_message(
        &self,
        owner_id: &OwnerId,
        message_id: &MessageId,
    ) -> Result<Option<Document>>;

    /// All documents for an owner, oldest first
    fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>>;

    /// Email-origin PDF documents without a preview that nobody is converting
    ///
    /// A `Converting` claim stamped before `stale_before` is abandoned and
    /// the document is listed again. Oldest first, at most `limit`.
    fn list_preview_candidates(
        &self,
        owner_id: &OwnerId,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Document>>;

    /// Move `conversion_state` to `Converting`, stamping `updated_at` with `now`
    ///
    /// Succeeds from `None` or from a claim stamped before `stale_before`.
    /// Returns false if another writer holds a live claim or converted it.
    fn claim_conversion(
        &self,
        id: DocumentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set preview and page URLs and mark the document `Converted`
    fn complete_conversion(
        &self,
        id: DocumentId,
        preview_url: &str,
        page_urls: &[String],
    ) -> Result<()>;

    /// Return a `Converting` document to `None` after a failed attempt
    fn release_conversion(&self, id: DocumentId) -> Result<()>;

    // === Usage ===

    /// Increment the owner's counter for `month`, returning the new count
    fn increment_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64>;

    fn get_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64>;
}
