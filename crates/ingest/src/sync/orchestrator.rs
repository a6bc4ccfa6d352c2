//! Sync orchestrator: one leased run per connection
//!
//! A run walks `Idle → TokenValidated → MessagesLocated → Processing(i) →
//! Committed` and returns to `Idle`. A rejected refresh ends in `AuthExpired`
//! with the connection deactivated. Unit-level failures are counted and
//! logged; they never stop the run or the commit.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

use super::fetch::{AttachmentFetcher, Downloader};
use super::locate::{MessageLocator, SyncMode};
use super::materialize::Materializer;
use super::parse::parse_message;
use super::timing::cooldown_elapsed_at;
use crate::config::EngineConfig;
use crate::error::{IngestError, IngestResult};
use crate::extract::ExtractionService;
use crate::gmail::{MailProvider, TokenEndpoint, TokenManager};
use crate::models::{ConnectionId, DocumentId, MailboxConnection, MessageId};
use crate::storage::{BlobStore, IngestStore};

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Lease holder id, unique per run within the process
fn lease_holder() -> String {
    format!(
        "{}:{}",
        std::process::id(),
        NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Everything a sync run talks to
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
    pub config: &'a EngineConfig,
    pub provider: &'a dyn MailProvider,
    pub tokens: &'a dyn TokenEndpoint,
    pub store: &'a dyn IngestStore,
    pub blobs: &'a dyn BlobStore,
    pub extraction: &'a dyn ExtractionService,
    pub downloader: &'a dyn Downloader,
}

impl<'a> SyncContext<'a> {
    fn token_manager(&self) -> TokenManager<'a> {
        TokenManager::new(self.tokens, self.store, self.config.token_refresh_skew_secs)
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    TokenValidated,
    MessagesLocated,
    /// Index of the candidate being processed
    Processing(usize),
    Committed,
    AuthExpired,
}

/// Statistics from one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub connection_id: Option<ConnectionId>,
    /// Candidate ids returned by the locator
    pub located: usize,
    /// Candidates attempted (bounded by the process cap)
    pub processed: usize,
    /// Already produced a document in an earlier run
    pub skipped_existing: usize,
    /// No attachment and no qualifying link
    pub skipped_no_sources: usize,
    pub documents_created: usize,
    /// Candidates that failed or whose every source failed
    pub failures: usize,
    /// The history cursor had expired and the fallback window was searched
    pub used_fallback: bool,
    /// Stored cursor after the commit
    pub cursor: Option<u64>,
    pub duration_ms: u64,
}

/// What happened to one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Created(DocumentId),
    AlreadyIngested,
    NoSources,
    NothingProduced,
}

pub struct SyncOrchestrator<'a> {
    ctx: SyncContext<'a>,
    phase: SyncPhase,
}

impl<'a> SyncOrchestrator<'a> {
    pub fn new(ctx: SyncContext<'a>) -> Self {
        Self {
            ctx,
            phase: SyncPhase::Idle,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn run(&mut self, connection_id: ConnectionId, mode: SyncMode) -> IngestResult<SyncReport> {
        self.run_at(connection_id, mode, Utc::now())
    }

    /// Run one sync against an explicit clock
    ///
    /// # Errors
    /// - `Busy` if another run holds the lease (nothing is touched)
    /// - `Auth` if the token could not be refreshed (connection deactivated)
    /// - `Transport` if candidates could not be located (nothing committed)
    pub fn run_at(
        &mut self,
        connection_id: ConnectionId,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> IngestResult<SyncReport> {
        let store = self.ctx.store;
        let holder = lease_holder();

        if !store.try_acquire_lease(connection_id, &holder, now, self.ctx.config.lease_ttl_secs)? {
            debug!("Connection {} is busy, skipping run", connection_id);
            return Err(IngestError::Busy(connection_id));
        }

        let result = self.run_leased(connection_id, mode, now);

        if let Err(e) = store.release_lease(connection_id, &holder) {
            warn!("Failed to release lease on connection {}: {:#}", connection_id, e);
        }

        match &result {
            Err(IngestError::Auth { .. }) => self.phase = SyncPhase::AuthExpired,
            _ => self.phase = SyncPhase::Idle,
        }
        result
    }

    fn run_leased(
        &mut self,
        connection_id: ConnectionId,
        mode: SyncMode,
        now: DateTime<Utc>,
    ) -> IngestResult<SyncReport> {
        let start = std::time::Instant::now();
        let ctx = self.ctx;
        let mut report = SyncReport {
            connection_id: Some(connection_id),
            ..Default::default()
        };

        let mut conn = load_connection(ctx.store, connection_id)?;

        // 1. Token
        ctx.token_manager().ensure_fresh_at(&mut conn, now)?;
        self.phase = SyncPhase::TokenValidated;

        // 2. Locate
        let located = MessageLocator::new(ctx.provider, ctx.config).locate(
            &conn.access_token,
            mode,
            conn.history_cursor,
            now,
        )?;
        self.phase = SyncPhase::MessagesLocated;
        report.located = located.message_ids.len();
        report.used_fallback = located.used_fallback;
        info!(
            "Connection {}: located {} candidate(s) ({:?}{})",
            connection_id,
            report.located,
            mode,
            if located.used_fallback { ", fallback" } else { "" }
        );

        // 3. Process sequentially
        let materializer = Materializer::new(ctx.store, ctx.blobs, ctx.extraction);
        let fetcher = AttachmentFetcher::new(ctx.provider, ctx.downloader);

        for (i, message_id) in located
            .message_ids
            .iter()
            .take(ctx.config.process_cap)
            .enumerate()
        {
            self.phase = SyncPhase::Processing(i);
            report.processed += 1;

            match self.process_message(&conn, message_id, &materializer, &fetcher, now) {
                Ok(MessageOutcome::Created(id)) => {
                    debug!("Message {} produced document {}", message_id, id);
                    report.documents_created += 1;
                }
                Ok(MessageOutcome::AlreadyIngested) => report.skipped_existing += 1,
                Ok(MessageOutcome::NoSources) => report.skipped_no_sources += 1,
                Ok(MessageOutcome::NothingProduced) => {
                    warn!("Message {}: every source failed", message_id);
                    report.failures += 1;
                }
                Err(e) => {
                    warn!("Message {} on connection {} failed: {}", message_id, connection_id, e);
                    report.failures += 1;
                }
            }
        }

        // 4. Commit regardless of unit failures
        ctx.store
            .commit_sync(connection_id, located.newest_history_id, Some(now))?;
        self.phase = SyncPhase::Committed;

        report.cursor = ctx
            .store
            .get_connection(connection_id)?
            .and_then(|c| c.history_cursor);
        report.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Connection {}: {} processed, {} created, {} already ingested, {} failed, cursor {:?}",
            connection_id,
            report.processed,
            report.documents_created,
            report.skipped_existing,
            report.failures,
            report.cursor
        );
        Ok(report)
    }

    fn process_message(
        &self,
        conn: &MailboxConnection,
        message_id: &MessageId,
        materializer: &Materializer<'_>,
        fetcher: &AttachmentFetcher<'_>,
        now: DateTime<Utc>,
    ) -> IngestResult<MessageOutcome> {
        let ctx = self.ctx;

        if ctx
            .store
            .find_by_source_message(&conn.owner_id, message_id)?
            .is_some()
        {
            return Ok(MessageOutcome::AlreadyIngested);
        }

        let message = ctx
            .provider
            .get_message(&conn.access_token, message_id)
            .map_err(|e| IngestError::transport("get message", format!("{:#}", e)))?;
        let candidate = parse_message(&message, &ctx.config.link_hints)?;

        if !candidate.has_sources() {
            debug!("Message {} has no attachment or invoice link", message_id);
            return Ok(MessageOutcome::NoSources);
        }

        let outcome = match materializer.materialize_message(
            &conn.owner_id,
            &conn.access_token,
            &candidate,
            fetcher,
            now,
        )? {
            Some(doc) => MessageOutcome::Created(doc.id),
            None => MessageOutcome::NothingProduced,
        };
        Ok(outcome)
    }
}

fn load_connection(store: &dyn IngestStore, id: ConnectionId) -> IngestResult<MailboxConnection> {
    store
        .get_connection(id)?
        .ok_or_else(|| IngestError::Repository(anyhow::anyhow!("Connection {} not found", id)))
}

/// Run every connection in parallel, each with its own orchestrator
///
/// One connection's failure never affects the others.
pub fn run_batch(
    ctx: SyncContext<'_>,
    connection_ids: &[ConnectionId],
    mode: SyncMode,
) -> Vec<(ConnectionId, IngestResult<SyncReport>)> {
    connection_ids
        .par_iter()
        .map(|&id| {
            let result = SyncOrchestrator::new(ctx).run(id, mode);
            match &result {
                Ok(_) | Err(IngestError::Busy(_)) => {}
                Err(e @ IngestError::Auth { .. }) => warn!("Connection {}: {}", id, e),
                Err(e) => error!("Sync failed for connection {}: {}", id, e),
            }
            (id, result)
        })
        .collect()
}

/// Active connections whose last sync is older than the poll interval
pub fn due_connections(
    store: &dyn IngestStore,
    poll_interval_secs: u64,
    now: DateTime<Utc>,
) -> IngestResult<Vec<ConnectionId>> {
    let due = store
        .list_active_connections()?
        .into_iter()
        .filter(|c| cooldown_elapsed_at(c.last_sync_at, poll_interval_secs, now))
        .map(|c| c.id)
        .collect();
    Ok(due)
}

/// Register push notifications for a connection's inbox
///
/// Advances an existing cursor to the history id the provider returns (never
/// backwards) and returns it. A connection that has not synced yet keeps no
/// cursor so its first run still performs the full search.
pub fn register_watch(
    ctx: SyncContext<'_>,
    connection_id: ConnectionId,
    topic: &str,
) -> IngestResult<Option<u64>> {
    let mut conn = load_connection(ctx.store, connection_id)?;
    ctx.token_manager().ensure_fresh(&mut conn)?;

    let response = ctx
        .provider
        .watch(&conn.access_token, topic)
        .map_err(|e| IngestError::transport("watch", format!("{:#}", e)))?;

    if conn.history_cursor.is_some() {
        ctx.store
            .commit_sync(connection_id, response.history_id, None)?;
    }
    info!(
        "Watching {} on {} (history {:?}, expires {:?})",
        conn.mailbox_address, topic, response.history_id, response.expiration
    );
    Ok(response.history_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OwnerId;
    use crate::storage::InMemoryIngestStore;
    use chrono::Duration;

    #[test]
    fn test_lease_holders_are_unique() {
        assert_ne!(lease_holder(), lease_holder());
    }

    #[test]
    fn test_due_connections() {
        let store = InMemoryIngestStore::new();
        let now = Utc::now();

        let never = store
            .insert_connection(&MailboxConnection::new(OwnerId::new("o1"), "a@example.com", "t"))
            .unwrap();
        let recent = store
            .insert_connection(&MailboxConnection::new(OwnerId::new("o1"), "b@example.com", "t"))
            .unwrap();
        let stale = store
            .insert_connection(&MailboxConnection::new(OwnerId::new("o2"), "c@example.com", "t"))
            .unwrap();
        let inactive = store
            .insert_connection(&MailboxConnection::new(OwnerId::new("o2"), "d@example.com", "t"))
            .unwrap();

        store
            .commit_sync(recent, None, Some(now - Duration::seconds(30)))
            .unwrap();
        store
            .commit_sync(stale, None, Some(now - Duration::minutes(10)))
            .unwrap();
        store.set_connection_active(inactive, false).unwrap();

        let mut due = due_connections(&store, 300, now).unwrap();
        due.sort();
        assert_eq!(due, vec![never, stale]);
    }

    #[test]
    fn test_default_phase_is_idle() {
        assert_eq!(SyncPhase::default(), SyncPhase::Idle);
    }
}
