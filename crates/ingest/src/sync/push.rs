//! Push notification handler
//!
//! Pub/Sub delivers `{"message": {"data": base64(JSON)}}` where the inner
//! JSON names the mailbox and the newest history id. Handling never fails:
//! every problem is logged and reported in the returned outcome.

use base64::prelude::*;
use log::{debug, info, warn};
use serde::Deserialize;

use super::locate::SyncMode;
use super::orchestrator::{SyncContext, SyncOrchestrator, SyncReport};
use crate::error::{IngestError, IngestResult};
use crate::gmail::api::de_history_id;
use crate::models::{ConnectionId, MailboxConnection};

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    data: String,
    message_id: Option<String>,
}

/// Decoded notification payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    #[serde(alias = "mailboxAddress")]
    pub email_address: String,
    #[serde(default, deserialize_with = "de_history_id")]
    pub history_id: Option<u64>,
}

/// Decode a raw webhook body
pub fn decode_notification(body: &[u8]) -> IngestResult<PushNotification> {
    let envelope: PushEnvelope = serde_json::from_slice(body)
        .map_err(|e| IngestError::Parse(format!("push envelope: {}", e)))?;

    let data = envelope.message.data.trim();
    let decoded = BASE64_STANDARD
        .decode(data)
        .or_else(|_| BASE64_URL_SAFE.decode(data))
        .map_err(|e| IngestError::Parse(format!("push data: {}", e)))?;

    let notification: PushNotification = serde_json::from_slice(&decoded)
        .map_err(|e| IngestError::Parse(format!("push payload: {}", e)))?;

    debug!(
        "Push {:?} for {} at history {:?}",
        envelope.message.message_id, notification.email_address, notification.history_id
    );
    Ok(notification)
}

/// Result for one connection bound to the notified mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPush {
    /// History id at or behind the stored cursor; nothing was touched
    Duplicate,
    Synced(SyncReport),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Malformed(String),
    /// No active connection for the address
    UnknownMailbox,
    Handled(Vec<(ConnectionId, ConnectionPush)>),
}

pub struct PushHandler<'a> {
    ctx: SyncContext<'a>,
}

impl<'a> PushHandler<'a> {
    pub fn new(ctx: SyncContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn handle(&self, body: &[u8]) -> PushOutcome {
        let notification = match decode_notification(body) {
            Ok(n) => n,
            Err(e) => {
                warn!("Ignoring push: {}", e);
                return PushOutcome::Malformed(e.to_string());
            }
        };

        let Some(history_id) = notification.history_id else {
            warn!("Ignoring push for {}: no history id", notification.email_address);
            return PushOutcome::Malformed("missing historyId".to_string());
        };

        let connections = match self
            .ctx
            .store
            .find_active_by_address(&notification.email_address)
        {
            Ok(connections) => connections,
            Err(e) => {
                warn!(
                    "Failed to look up connections for {}: {:#}",
                    notification.email_address, e
                );
                return PushOutcome::Handled(Vec::new());
            }
        };

        if connections.is_empty() {
            debug!("No active connection for {}", notification.email_address);
            return PushOutcome::UnknownMailbox;
        }

        let results = connections
            .iter()
            .map(|conn| (conn.id, self.handle_connection(conn, history_id)))
            .collect();
        PushOutcome::Handled(results)
    }

    fn handle_connection(&self, conn: &MailboxConnection, history_id: u64) -> ConnectionPush {
        if let Err(e) = check_newer(conn, history_id) {
            debug!("Connection {}: {}", conn.id, e);
            return ConnectionPush::Duplicate;
        }

        let report = match SyncOrchestrator::new(self.ctx).run(conn.id, SyncMode::Incremental) {
            Ok(report) => report,
            Err(e) => {
                warn!("Push sync failed for connection {}: {}", conn.id, e);
                return ConnectionPush::Failed(e.to_string());
            }
        };

        if let Err(e) = self.ctx.store.commit_sync(conn.id, Some(history_id), None) {
            warn!("Failed to advance cursor of connection {}: {:#}", conn.id, e);
            return ConnectionPush::Failed(format!("{:#}", e));
        }

        info!(
            "Push for connection {} handled: {} document(s) created",
            conn.id, report.documents_created
        );
        ConnectionPush::Synced(SyncReport {
            cursor: Some(report.cursor.map_or(history_id, |c| c.max(history_id))),
            ..report
        })
    }
}

/// `DuplicatePush` unless `history_id` is strictly ahead of the stored cursor
pub fn check_newer(conn: &MailboxConnection, history_id: u64) -> IngestResult<()> {
    match conn.history_cursor {
        Some(stored) if history_id <= stored => Err(IngestError::DuplicatePush {
            received: history_id,
            stored,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OwnerId;

    fn envelope(inner: &str) -> Vec<u8> {
        serde_json::json!({
            "message": { "data": BASE64_STANDARD.encode(inner), "messageId": "1" },
            "subscription": "projects/p/subscriptions/s"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_decode_numeric_and_string_history_ids() {
        let n = decode_notification(&envelope(
            r#"{"emailAddress":"a@example.com","historyId":1234}"#,
        ))
        .unwrap();
        assert_eq!(n.email_address, "a@example.com");
        assert_eq!(n.history_id, Some(1234));

        let n = decode_notification(&envelope(
            r#"{"mailboxAddress":"b@example.com","historyId":"99"}"#,
        ))
        .unwrap();
        assert_eq!(n.email_address, "b@example.com");
        assert_eq!(n.history_id, Some(99));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_notification(b"not json"),
            Err(IngestError::Parse(_))
        ));
        assert!(matches!(
            decode_notification(br#"{"message":{"data":"%%%"}}"#),
            Err(IngestError::Parse(_))
        ));
    }

    #[test]
    fn test_check_newer() {
        let conn = MailboxConnection::new(OwnerId::new("o1"), "a@example.com", "t").with_cursor(100);
        assert!(matches!(
            check_newer(&conn, 100),
            Err(IngestError::DuplicatePush { received: 100, stored: 100 })
        ));
        assert!(check_newer(&conn, 50).is_err());
        assert!(check_newer(&conn, 101).is_ok());

        let fresh = MailboxConnection::new(OwnerId::new("o1"), "a@example.com", "t");
        assert!(check_newer(&fresh, 1).is_ok());
    }
}
