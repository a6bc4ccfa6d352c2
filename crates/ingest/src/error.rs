//! Error taxonomy for the ingestion engine
//!
//! Unit-level errors (transport, parse, storage) are logged and skipped by the
//! orchestrator. `Auth` aborts one connection. `Extraction` never leaves the
//! materializer: it becomes a manual-review document instead.

use crate::models::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Token refresh rejected; the connection has been deactivated
    #[error("authorization failed for connection {connection}: {reason}")]
    Auth {
        connection: ConnectionId,
        reason: String,
    },

    /// The consent redirect could not be turned into a grant
    #[error("consent failed: {0}")]
    Consent(String),

    /// Any network or HTTP failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed message or attachment
    #[error("parse error: {0}")]
    Parse(String),

    /// Extraction service error or unusable output
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Blob upload or download failed
    #[error("storage error: {0}")]
    Storage(String),

    /// Push notification at or behind the stored cursor
    #[error("duplicate push: history {received} <= cursor {stored}")]
    DuplicatePush { received: u64, stored: u64 },

    /// History cursor too old for the provider to resolve
    #[error("history id expired or invalid")]
    HistoryExpired,

    /// Another run holds the connection lease
    #[error("connection {0} is already syncing")]
    Busy(ConnectionId),

    /// Document repository failure
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

impl IngestError {
    /// Classify a ureq failure as a transport error
    pub fn transport(context: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Transport(format!("{context}: {err}"))
    }

    /// Whether this error should stop the whole run for the connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, IngestError::Auth { .. } | IngestError::Busy(_))
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        let auth = IngestError::Auth {
            connection: ConnectionId(7),
            reason: "invalid_grant".to_string(),
        };
        assert!(auth.is_connection_fatal());
        assert!(IngestError::Busy(ConnectionId(7)).is_connection_fatal());
        assert!(!IngestError::Parse("no payload".to_string()).is_connection_fatal());
        assert!(!IngestError::HistoryExpired.is_connection_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = IngestError::DuplicatePush {
            received: 10,
            stored: 12,
        };
        assert_eq!(err.to_string(), "duplicate push: history 10 <= cursor 12");
        assert_eq!(
            IngestError::transport("list history", "timeout").to_string(),
            "transport error: list history: timeout"
        );
    }
}
