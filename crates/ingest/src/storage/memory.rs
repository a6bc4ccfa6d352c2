//! In-memory storage implementation
//!
//! Used by tests and by embedders that do not need persistence.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{IngestStore, SyncLease};
use crate::models::{
    ConnectionId, ConversionState, Document, DocumentId, MailboxConnection, MessageId, OwnerId,
    UsageMonth,
};

/// In-memory implementation of IngestStore
///
/// Uses HashMaps protected by RwLocks for thread-safe access. Conditional
/// updates take the write lock for the whole check-and-set.
pub struct InMemoryIngestStore {
    connections: RwLock<HashMap<ConnectionId, MailboxConnection>>,
    documents: RwLock<HashMap<DocumentId, Document>>,
    usage: RwLock<HashMap<(OwnerId, UsageMonth), u64>>,
    leases: RwLock<HashMap<ConnectionId, SyncLease>>,
    next_id: RwLock<i64>,
}

impl InMemoryIngestStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            next_id: RwLock::new(0),
        }
    }

    fn allocate_id(&self) -> i64 {
        let mut next = self.next_id.write().unwrap();
        *next += 1;
        *next
    }

    fn with_connection(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut MailboxConnection),
    ) -> Result<()> {
        let mut connections = self.connections.write().unwrap();
        match connections.get_mut(&id) {
            Some(conn) => {
                f(conn);
                Ok(())
            }
            None => bail!("Connection {} not found", id),
        }
    }
}

impl Default for InMemoryIngestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStore for InMemoryIngestStore {
    fn insert_connection(&self, conn: &MailboxConnection) -> Result<ConnectionId> {
        let mut connections = self.connections.write().unwrap();
        if connections.values().any(|c| {
            c.owner_id == conn.owner_id
                && c.mailbox_address.eq_ignore_ascii_case(&conn.mailbox_address)
        }) {
            bail!(
                "Connection for {} already exists for owner {}",
                conn.mailbox_address,
                conn.owner_id
            );
        }

        let id = ConnectionId(self.allocate_id());
        let mut stored = conn.clone();
        stored.id = id;
        connections.insert(id, stored);
        Ok(id)
    }

    fn get_connection(&self, id: ConnectionId) -> Result<Option<MailboxConnection>> {
        Ok(self.connections.read().unwrap().get(&id).cloned())
    }

    fn find_connection(
        &self,
        owner_id: &OwnerId,
        mailbox_address: &str,
    ) -> Result<Option<MailboxConnection>> {
        let connections = self.connections.read().unwrap();
        Ok(connections
            .values()
            .find(|c| {
                &c.owner_id == owner_id && c.mailbox_address.eq_ignore_ascii_case(mailbox_address)
            })
            .cloned())
    }

    fn find_active_by_address(&self, mailbox_address: &str) -> Result<Vec<MailboxConnection>> {
        let connections = self.connections.read().unwrap();
        let mut found: Vec<_> = connections
            .values()
            .filter(|c| c.active && c.mailbox_address.eq_ignore_ascii_case(mailbox_address))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    fn list_active_connections(&self) -> Result<Vec<MailboxConnection>> {
        let connections = self.connections.read().unwrap();
        let mut active: Vec<_> = connections.values().filter(|c| c.active).cloned().collect();
        active.sort_by_key(|c| c.id);
        Ok(active)
    }

    fn update_connection_tokens(
        &self,
        id: ConnectionId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_connection(id, |conn| {
            conn.access_token = access_token.to_string();
            if let Some(refresh) = refresh_token {
                conn.refresh_token = Some(refresh.to_string());
            }
            conn.token_expires_at = expires_at;
        })
    }

    fn set_connection_active(&self, id: ConnectionId, active: bool) -> Result<()> {
        self.with_connection(id, |conn| conn.active = active)
    }

    fn commit_sync(
        &self,
        id: ConnectionId,
        history_cursor: Option<u64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_connection(id, |conn| {
            if let Some(cursor) = history_cursor {
                conn.advance_cursor(cursor);
            }
            if let Some(at) = synced_at {
                conn.mark_synced(at);
            }
        })
    }

    fn delete_connection(&self, id: ConnectionId) -> Result<()> {
        self.connections.write().unwrap().remove(&id);
        self.leases.write().unwrap().remove(&id);
        Ok(())
    }

    fn try_acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool> {
        let mut leases = self.leases.write().unwrap();
        if let Some(existing) = leases.get(&id)
            && existing.holder != holder
            && !existing.is_expired_at(now)
        {
            return Ok(false);
        }

        leases.insert(
            id,
            SyncLease {
                connection_id: id,
                holder: holder.to_string(),
                expires_at: now + chrono::Duration::seconds(ttl_secs),
            },
        );
        Ok(true)
    }

    fn release_lease(&self, id: ConnectionId, holder: &str) -> Result<()> {
        let mut leases = self.leases.write().unwrap();
        if leases.get(&id).is_some_and(|l| l.holder == holder) {
            leases.remove(&id);
        }
        Ok(())
    }

    fn get_lease(&self, id: ConnectionId) -> Result<Option<SyncLease>> {
        Ok(self.leases.read().unwrap().get(&id).cloned())
    }

    fn insert_document(&self, doc: &Document) -> Result<DocumentId> {
        let mut documents = self.documents.write().unwrap();
        if let Some(source) = &doc.source_message_id
            && documents.values().any(|d| {
                d.owner_id == doc.owner_id && d.source_message_id.as_ref() == Some(source)
            })
        {
            bail!("Document for message {} already exists", source);
        }

        let id = DocumentId(self.allocate_id());
        let mut stored = doc.clone();
        stored.id = id;
        documents.insert(id, stored);
        Ok(id)
    }

    fn update_document(&self, doc: &Document) -> Result<()> {
        let mut documents = self.documents.write().unwrap();
        match documents.get_mut(&doc.id) {
            Some(existing) => {
                *existing = doc.clone();
                Ok(())
            }
            None => bail!("Document {} not found", doc.id),
        }
    }

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self.documents.read().unwrap().get(&id).cloned())
    }

    fn find_by_source_message(
        &self,
        owner_id: &OwnerId,
        message_id: &MessageId,
    ) -> Result<Option<Document>> {
        let documents = self.documents.read().unwrap();
        Ok(documents
            .values()
            .find(|d| &d.owner_id == owner_id && d.source_message_id.as_ref() == Some(message_id))
            .cloned())
    }

    fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>> {
        let documents = self.documents.read().unwrap();
        let mut docs: Vec<_> = documents
            .values()
            .filter(|d| &d.owner_id == owner_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| (d.created_at, d.id));
        Ok(docs)
    }

    fn list_preview_candidates(
        &self,
        owner_id: &OwnerId,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        let mut docs = self.list_documents(owner_id)?;
        docs.retain(|d| d.preview_claimable(stale_before));
        docs.truncate(limit);
        Ok(docs)
    }

    fn claim_conversion(
        &self,
        id: DocumentId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut documents = self.documents.write().unwrap();
        match documents.get_mut(&id) {
            Some(doc) if doc.conversion_claimable(stale_before) => {
                doc.conversion_state = ConversionState::Converting;
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete_conversion(
        &self,
        id: DocumentId,
        preview_url: &str,
        page_urls: &[String],
    ) -> Result<()> {
        let mut documents = self.documents.write().unwrap();
        match documents.get_mut(&id) {
            Some(doc) if doc.conversion_state == ConversionState::Converting => {
                doc.preview_url = Some(preview_url.to_string());
                doc.page_urls = page_urls.to_vec();
                doc.conversion_state = ConversionState::Converted;
                doc.updated_at = Utc::now();
                Ok(())
            }
            Some(_) => bail!("Document {} is not being converted", id),
            None => bail!("Document {} not found", id),
        }
    }

    fn release_conversion(&self, id: DocumentId) -> Result<()> {
        let mut documents = self.documents.write().unwrap();
        if let Some(doc) = documents.get_mut(&id)
            && doc.conversion_state == ConversionState::Converting
        {
            doc.conversion_state = ConversionState::None;
            doc.updated_at = Utc::now();
        }
        Ok(())
    }

    fn increment_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64> {
        let mut usage = self.usage.write().unwrap();
        let count = usage.entry((owner_id.clone(), month)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    fn get_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64> {
        Ok(self
            .usage
            .read()
            .unwrap()
            .get(&(owner_id.clone(), month))
            .copied()
            .unwrap_or(0))
    }
}
