//! Mailbox connection model: one stored OAuth grant per external mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectionId, OwnerId};

/// A stored OAuth grant binding one external mailbox to one owner account
///
/// Created on OAuth consent. Access token, expiry and cursor are mutated by
/// every sync run. Deactivated (never deleted) on unrecoverable auth failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxConnection {
    /// Database primary key (0 until inserted)
    pub id: ConnectionId,
    pub owner_id: OwnerId,
    /// Mailbox address as reported by the provider profile
    pub mailbox_address: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Inactive connections are never advanced or retried automatically
    pub active: bool,
    /// Last provider history id observed (None before the first run)
    pub history_cursor: Option<u64>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl MailboxConnection {
    /// Create a new active connection (id will be assigned by the store)
    pub fn new(
        owner_id: OwnerId,
        mailbox_address: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            id: ConnectionId(0),
            owner_id,
            mailbox_address: mailbox_address.into(),
            access_token: access_token.into(),
            refresh_token: None,
            token_expires_at: None,
            active: true,
            history_cursor: None,
            last_sync_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.token_expires_at = Some(expires_at);
        self
    }

    pub fn with_cursor(mut self, history_id: u64) -> Self {
        self.history_cursor = Some(history_id);
        self
    }

    /// Whether the access token must be refreshed before use
    ///
    /// A missing expiry is treated as expired. `skew_secs` refreshes slightly
    /// early so a token does not lapse mid-run.
    pub fn token_expired_at(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        match self.token_expires_at {
            Some(expires_at) => expires_at <= now + chrono::Duration::seconds(skew_secs),
            None => true,
        }
    }

    /// Advance the cursor, never moving it backwards
    pub fn advance_cursor(&mut self, history_id: u64) {
        self.history_cursor = Some(self.history_cursor.map_or(history_id, |c| c.max(history_id)));
    }

    /// Record a completed run, never moving the timestamp backwards
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.last_sync_at = Some(self.last_sync_at.map_or(now, |last| last.max(now)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> MailboxConnection {
        MailboxConnection::new(OwnerId::new("owner-1"), "billing@example.com", "tok")
    }

    #[test]
    fn test_new_connection_is_active() {
        let conn = make_connection();
        assert!(conn.active);
        assert_eq!(conn.id, ConnectionId(0));
        assert!(conn.history_cursor.is_none());
    }

    #[test]
    fn test_missing_expiry_counts_as_expired() {
        let conn = make_connection();
        assert!(conn.token_expired_at(Utc::now(), 0));
    }

    #[test]
    fn test_token_expiry_with_skew() {
        let now = Utc::now();
        let conn = make_connection().with_expiry(now + chrono::Duration::seconds(120));
        assert!(!conn.token_expired_at(now, 0));
        assert!(conn.token_expired_at(now, 300));
    }

    #[test]
    fn test_advance_cursor_is_monotonic() {
        let mut conn = make_connection().with_cursor(500);
        conn.advance_cursor(400);
        assert_eq!(conn.history_cursor, Some(500));
        conn.advance_cursor(900);
        assert_eq!(conn.history_cursor, Some(900));
    }

    #[test]
    fn test_mark_synced_is_monotonic() {
        let mut conn = make_connection();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);
        conn.mark_synced(later);
        conn.mark_synced(earlier);
        assert_eq!(conn.last_sync_at, Some(later));
    }
}
