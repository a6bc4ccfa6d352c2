//! SQLite-based ingestion repository

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use super::{IngestStore, SyncLease};
use crate::models::{
    ConnectionId, ConversionState, Document, DocumentId, DocumentStatus, ExtractedFields,
    MailboxConnection, MessageId, Origin, OwnerId, UsageMonth,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One OAuth grant per (owner, mailbox)
            CREATE TABLE mailbox_connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                mailbox_address TEXT NOT NULL COLLATE NOCASE,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                token_expires_at TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                history_cursor INTEGER,
                last_sync_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (owner_id, mailbox_address)
            );

            CREATE INDEX idx_connections_address
                ON mailbox_connections(mailbox_address);

            -- Ingested documents; fields and page URLs are JSON
            CREATE TABLE documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                primary_asset_url TEXT NOT NULL,
                primary_media_type TEXT,
                preview_url TEXT,
                page_urls TEXT NOT NULL DEFAULT '[]',
                fields TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                conversion_state TEXT NOT NULL DEFAULT 'none',
                source_message_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX idx_documents_source_message
                ON documents(owner_id, source_message_id)
                WHERE source_message_id IS NOT NULL;

            CREATE INDEX idx_documents_preview
                ON documents(owner_id, conversion_state, created_at);

            -- Documents created per owner per calendar month
            CREATE TABLE usage_counters (
                owner_id TEXT NOT NULL,
                month TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner_id, month)
            );

            -- Per-connection sync lease
            CREATE TABLE sync_leases (
                connection_id INTEGER PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (connection_id) REFERENCES mailbox_connections(id) ON DELETE CASCADE
            );
            "#,
        ),
    ])
}

/// SQLite-based ingestion repository
///
/// A single connection behind a mutex. Conditional updates are single
/// statements, so the mutex is the only serialization needed.
pub struct SqliteIngestStore {
    conn: Mutex<Connection>,
}

impl SqliteIngestStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets the webhook and the scheduler read while a run writes.
        // foreign_keys is required for the lease cascade.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

const CONNECTION_COLUMNS: &str = "id, owner_id, mailbox_address, access_token, refresh_token, \
     token_expires_at, active, history_cursor, last_sync_at, created_at";

const DOCUMENT_COLUMNS: &str = "id, owner_id, origin, primary_asset_url, primary_media_type, \
     preview_url, page_urls, fields, status, conversion_state, source_message_id, \
     created_at, updated_at";

/// Fixed-width UTC timestamps so SQL can compare them as strings
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp {:?}", value))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Columns of one connection row, converted after the statement completes
struct ConnectionRow {
    id: i64,
    owner_id: String,
    mailbox_address: String,
    access_token: String,
    refresh_token: Option<String>,
    token_expires_at: Option<String>,
    active: bool,
    history_cursor: Option<i64>,
    last_sync_at: Option<String>,
    created_at: String,
}

impl ConnectionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            mailbox_address: row.get(2)?,
            access_token: row.get(3)?,
            refresh_token: row.get(4)?,
            token_expires_at: row.get(5)?,
            active: row.get(6)?,
            history_cursor: row.get(7)?,
            last_sync_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_connection(self) -> Result<MailboxConnection> {
        Ok(MailboxConnection {
            id: ConnectionId(self.id),
            owner_id: OwnerId(self.owner_id),
            mailbox_address: self.mailbox_address,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_expires_at: parse_optional_timestamp(self.token_expires_at)?,
            active: self.active,
            history_cursor: self.history_cursor.map(|c| c as u64),
            last_sync_at: parse_optional_timestamp(self.last_sync_at)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

struct DocumentRow {
    id: i64,
    owner_id: String,
    origin: String,
    primary_asset_url: String,
    primary_media_type: Option<String>,
    preview_url: Option<String>,
    page_urls: String,
    fields: String,
    status: String,
    conversion_state: String,
    source_message_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DocumentRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            origin: row.get(2)?,
            primary_asset_url: row.get(3)?,
            primary_media_type: row.get(4)?,
            preview_url: row.get(5)?,
            page_urls: row.get(6)?,
            fields: row.get(7)?,
            status: row.get(8)?,
            conversion_state: row.get(9)?,
            source_message_id: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_document(self) -> Result<Document> {
        let origin = Origin::parse(&self.origin)
            .with_context(|| format!("Unknown origin {:?}", self.origin))?;
        let status = DocumentStatus::parse(&self.status)
            .with_context(|| format!("Unknown status {:?}", self.status))?;
        let conversion_state = ConversionState::parse(&self.conversion_state)
            .with_context(|| format!("Unknown conversion state {:?}", self.conversion_state))?;
        let page_urls: Vec<String> =
            serde_json::from_str(&self.page_urls).context("Invalid page_urls JSON")?;
        let fields: ExtractedFields =
            serde_json::from_str(&self.fields).context("Invalid fields JSON")?;

        Ok(Document {
            id: DocumentId(self.id),
            owner_id: OwnerId(self.owner_id),
            origin,
            primary_asset_url: self.primary_asset_url,
            primary_media_type: self.primary_media_type,
            preview_url: self.preview_url,
            page_urls,
            fields,
            status,
            conversion_state,
            source_message_id: self.source_message_id.map(MessageId),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

impl SqliteIngestStore {
    fn query_connections(
        &self,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MailboxConnection>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM mailbox_connections {} ORDER BY id",
            CONNECTION_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, ConnectionRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ConnectionRow::into_connection).collect()
    }

    fn query_documents(
        &self,
        tail: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM documents {}", DOCUMENT_COLUMNS, tail);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, DocumentRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    fn expect_one_row(changed: usize, what: &str, id: impl std::fmt::Display) -> Result<()> {
        if changed == 0 {
            bail!("{} {} not found", what, id);
        }
        Ok(())
    }
}

impl IngestStore for SqliteIngestStore {
    fn insert_connection(&self, c: &MailboxConnection) -> Result<ConnectionId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO mailbox_connections
             (owner_id, mailbox_address, access_token, refresh_token, token_expires_at,
              active, history_cursor, last_sync_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                c.owner_id.as_str(),
                c.mailbox_address,
                c.access_token,
                c.refresh_token,
                c.token_expires_at.map(format_timestamp),
                c.active,
                c.history_cursor.map(|h| h as i64),
                c.last_sync_at.map(format_timestamp),
                format_timestamp(c.created_at),
            ],
        )
        .with_context(|| format!("Failed to insert connection for {}", c.mailbox_address))?;
        Ok(ConnectionId(conn.last_insert_rowid()))
    }

    fn get_connection(&self, id: ConnectionId) -> Result<Option<MailboxConnection>> {
        Ok(self
            .query_connections("WHERE id = ?", [id.0])?
            .into_iter()
            .next())
    }

    fn find_connection(
        &self,
        owner_id: &OwnerId,
        mailbox_address: &str,
    ) -> Result<Option<MailboxConnection>> {
        Ok(self
            .query_connections(
                "WHERE owner_id = ? AND mailbox_address = ?",
                params![owner_id.as_str(), mailbox_address],
            )?
            .into_iter()
            .next())
    }

    fn find_active_by_address(&self, mailbox_address: &str) -> Result<Vec<MailboxConnection>> {
        self.query_connections(
            "WHERE active = 1 AND mailbox_address = ?",
            [mailbox_address],
        )
    }

    fn list_active_connections(&self) -> Result<Vec<MailboxConnection>> {
        self.query_connections("WHERE active = 1", ())
    }

    fn update_connection_tokens(
        &self,
        id: ConnectionId,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE mailbox_connections
             SET access_token = ?, refresh_token = COALESCE(?, refresh_token), token_expires_at = ?
             WHERE id = ?",
            params![
                access_token,
                refresh_token,
                expires_at.map(format_timestamp),
                id.0
            ],
        )?;
        Self::expect_one_row(changed, "Connection", id)
    }

    fn set_connection_active(&self, id: ConnectionId, active: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE mailbox_connections SET active = ? WHERE id = ?",
            params![active, id.0],
        )?;
        Self::expect_one_row(changed, "Connection", id)
    }

    fn commit_sync(
        &self,
        id: ConnectionId,
        history_cursor: Option<u64>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // MAX(NULL, x) is NULL in SQLite, hence the COALESCE on both sides

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE mailbox_connections
             SET history_cursor = MAX(COALESCE(history_cursor, ?1), COALESCE(?1, history_cursor)),
                 last_sync_at = MAX(COALESCE(last_sync_at, ?2), COALESCE(?2, last_sync_at))
             WHERE id = ?3",
            params![
                history_cursor.map(|h| h as i64),
                synced_at.map(format_timestamp),
                id.0
            ],
        )?;
        Self::expect_one_row(changed, "Connection", id)
    }

    fn delete_connection(&self, id: ConnectionId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM mailbox_connections WHERE id = ?", [id.0])?;
        Ok(())
    }

    fn try_acquire_lease(
        &self,
        id: ConnectionId,
        holder: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        let changed = conn.execute(
            "INSERT INTO sync_leases (connection_id, holder, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(connection_id) DO UPDATE
             SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE sync_leases.holder = excluded.holder OR sync_leases.expires_at <= ?4",
            params![
                id.0,
                holder,
                format_timestamp(expires_at),
                format_timestamp(now),
            ],
        )?;
        Ok(changed == 1)
    }

    fn release_lease(&self, id: ConnectionId, holder: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM sync_leases WHERE connection_id = ? AND holder = ?",
            params![id.0, holder],
        )?;
        Ok(())
    }

    fn get_lease(&self, id: ConnectionId) -> Result<Option<SyncLease>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT holder, expires_at FROM sync_leases WHERE connection_id = ?",
                [id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(holder, expires_at)| {
            Ok(SyncLease {
                connection_id: id,
                holder,
                expires_at: parse_timestamp(&expires_at)?,
            })
        })
        .transpose()
    }

    fn insert_document(&self, doc: &Document) -> Result<DocumentId> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO documents
             (owner_id, origin, primary_asset_url, primary_media_type, preview_url, page_urls,
              fields, status, conversion_state, source_message_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                doc.owner_id.as_str(),
                doc.origin.as_str(),
                doc.primary_asset_url,
                doc.primary_media_type,
                doc.preview_url,
                serde_json::to_string(&doc.page_urls)?,
                serde_json::to_string(&doc.fields)?,
                doc.status.as_str(),
                doc.conversion_state.as_str(),
                doc.source_message_id.as_ref().map(|m| m.as_str()),
                format_timestamp(doc.created_at),
                format_timestamp(doc.updated_at),
            ],
        )
        .context("Failed to insert document")?;
        Ok(DocumentId(conn.last_insert_rowid()))
    }

    fn update_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE documents
             SET origin = ?, primary_asset_url = ?, primary_media_type = ?, preview_url = ?,
                 page_urls = ?, fields = ?, status = ?, conversion_state = ?,
                 source_message_id = ?, updated_at = ?
             WHERE id = ?",
            params![
                doc.origin.as_str(),
                doc.primary_asset_url,
                doc.primary_media_type,
                doc.preview_url,
                serde_json::to_string(&doc.page_urls)?,
                serde_json::to_string(&doc.fields)?,
                doc.status.as_str(),
                doc.conversion_state.as_str(),
                doc.source_message_id.as_ref().map(|m| m.as_str()),
                format_timestamp(doc.updated_at),
                doc.id.0,
            ],
        )?;
        Self::expect_one_row(changed, "Document", doc.id)
    }

    fn get_document(&self, id: DocumentId) -> Result<Option<Document>> {
        Ok(self
            .query_documents("WHERE id = ?", [id.0])?
            .into_iter()
            .next())
    }

    fn find_by_source_message(
        &self,
        owner_id: &OwnerId,
        message_id: &MessageId,
    ) -> Result<Option<Document>> {
        Ok(self
            .query_documents(
                "WHERE owner_id = ? AND source_message_id = ?",
                params![owner_id.as_str(), message_id.as_str()],
            )?
            .into_iter()
            .next())
    }

    fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>> {
        self.query_documents(
            "WHERE owner_id = ? ORDER BY created_at ASC, id ASC",
            [owner_id.as_str()],
        )
    }

    fn list_preview_candidates(
        &self,
        owner_id: &OwnerId,
        limit: usize,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        // The PDF check needs the URL fallback in Document::has_pdf_asset, so
        // SQL narrows by state and the final filter runs here.
        let mut docs = self.query_documents(
            "WHERE owner_id = ?1 AND preview_url IS NULL
               AND origin IN ('email_attachment', 'email_link')
               AND (conversion_state = 'none'
                    OR (conversion_state = 'converting' AND updated_at < ?2))
             ORDER BY created_at ASC, id ASC",
            params![owner_id.as_str(), format_timestamp(stale_before)],
        )?;
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
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE documents SET conversion_state = 'converting', updated_at = ?1
             WHERE id = ?2
               AND (conversion_state = 'none'
                    OR (conversion_state = 'converting' AND updated_at < ?3))",
            params![format_timestamp(now), id.0, format_timestamp(stale_before)],
        )?;
        Ok(changed == 1)
    }

    fn complete_conversion(
        &self,
        id: DocumentId,
        preview_url: &str,
        page_urls: &[String],
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE documents
             SET preview_url = ?, page_urls = ?, conversion_state = 'converted', updated_at = ?
             WHERE id = ? AND conversion_state = 'converting'",
            params![
                preview_url,
                serde_json::to_string(page_urls)?,
                format_timestamp(Utc::now()),
                id.0
            ],
        )?;
        if changed == 0 {
            bail!("Document {} is not being converted", id);
        }
        Ok(())
    }

    fn release_conversion(&self, id: DocumentId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE documents SET conversion_state = 'none', updated_at = ?
             WHERE id = ? AND conversion_state = 'converting'",
            params![format_timestamp(Utc::now()), id.0],
        )?;
        Ok(())
    }

    fn increment_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "INSERT INTO usage_counters (owner_id, month, count) VALUES (?, ?, 1)
             ON CONFLICT(owner_id, month) DO UPDATE SET count = count + 1
             RETURNING count",
            params![owner_id.as_str(), month.key()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn get_usage(&self, owner_id: &OwnerId, month: UsageMonth) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<i64> = conn
            .query_row(
                "SELECT count FROM usage_counters WHERE owner_id = ? AND month = ?",
                params![owner_id.as_str(), month.key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }
}
