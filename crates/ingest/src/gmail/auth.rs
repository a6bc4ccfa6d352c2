//! Gmail OAuth2 token management
//!
//! Refreshes per-connection access tokens and completes the consent flow that
//! creates connections. Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::MailProvider;
use crate::config::GmailCredentials;
use crate::error::{IngestError, IngestResult};
use crate::models::{ConnectionId, MailboxConnection, OwnerId};
use crate::storage::IngestStore;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Tokens returned by the OAuth token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self
            .expires_in
            .map(|s| s as i64)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        now + Duration::seconds(secs)
    }
}

/// The provider refused the grant (revoked, expired or invalid)
#[derive(Debug, thiserror::Error)]
#[error("token endpoint rejected the grant (HTTP {status})")]
pub struct RefreshRejected {
    pub status: u16,
}

/// OAuth token endpoint operations
pub trait TokenEndpoint: Send + Sync {
    /// Exchange a refresh token for a new access token
    ///
    /// # Errors
    /// Returns `RefreshRejected` when the provider refuses the grant
    fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Exchange an authorization code from the consent redirect
    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;
}

/// Google's OAuth2 token endpoint
pub struct GoogleTokenEndpoint {
    agent: ureq::Agent,
    client_id: String,
    client_secret: String,
}

impl GoogleTokenEndpoint {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(agent: ureq::Agent, credentials: &GmailCredentials) -> Self {
        Self {
            agent,
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
        }
    }

    fn post_form(&self, form: [(&str, &str); 5]) -> Result<TokenGrant> {
        match self.agent.post(Self::TOKEN_URL).send_form(form) {
            Ok(mut response) => response
                .body_mut()
                .read_json()
                .context("Failed to parse token response"),
            Err(ureq::Error::StatusCode(status @ (400 | 401))) => {
                Err(RefreshRejected { status }.into())
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to reach token endpoint")),
        }
    }
}

impl TokenEndpoint for GoogleTokenEndpoint {
    fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let mut grant = self.post_form([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
            ("access_type", "offline"),
        ])?;

        // Preserve the refresh token if not returned
        if grant.refresh_token.is_none() {
            grant.refresh_token = Some(refresh_token.to_string());
        }

        Ok(grant)
    }

    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.post_form([
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ])
    }
}

/// Keeps connection access tokens fresh
pub struct TokenManager<'a> {
    endpoint: &'a dyn TokenEndpoint,
    store: &'a dyn IngestStore,
    skew_secs: i64,
}

impl<'a> TokenManager<'a> {
    pub fn new(endpoint: &'a dyn TokenEndpoint, store: &'a dyn IngestStore, skew_secs: i64) -> Self {
        Self {
            endpoint,
            store,
            skew_secs,
        }
    }

    /// Refresh the connection's access token if it has expired
    pub fn ensure_fresh(&self, conn: &mut MailboxConnection) -> IngestResult<()> {
        self.ensure_fresh_at(conn, Utc::now())
    }

    /// Refresh relative to an explicit clock
    ///
    /// A rejected grant deactivates the connection and returns `Auth`.
    /// Transport failures return `Transport` and leave the connection active.
    pub fn ensure_fresh_at(&self, conn: &mut MailboxConnection, now: DateTime<Utc>) -> IngestResult<()> {
        if !conn.active {
            return Err(IngestError::Auth {
                connection: conn.id,
                reason: "connection is inactive".to_string(),
            });
        }

        if !conn.token_expired_at(now, self.skew_secs) {
            return Ok(());
        }

        let Some(refresh_token) = conn.refresh_token.clone() else {
            self.deactivate(conn, "no refresh token stored")?;
            return Err(IngestError::Auth {
                connection: conn.id,
                reason: "no refresh token stored".to_string(),
            });
        };

        match self.endpoint.refresh(&refresh_token) {
            Ok(grant) => {
                conn.access_token = grant.access_token.clone();
                conn.token_expires_at = Some(grant.expires_at(now));
                if let Some(rotated) = grant.refresh_token {
                    conn.refresh_token = Some(rotated);
                }
                self.store.update_connection_tokens(
                    conn.id,
                    &conn.access_token,
                    conn.refresh_token.as_deref(),
                    conn.token_expires_at,
                )?;
                info!("Refreshed access token for connection {}", conn.id);
                Ok(())
            }
            Err(e) if e.downcast_ref::<RefreshRejected>().is_some() => {
                let reason = e.to_string();
                self.deactivate(conn, &reason)?;
                Err(IngestError::Auth {
                    connection: conn.id,
                    reason,
                })
            }
            Err(e) => Err(IngestError::transport("token refresh", format!("{:#}", e))),
        }
    }

    fn deactivate(&self, conn: &mut MailboxConnection, reason: &str) -> IngestResult<()> {
        warn!(
            "Deactivating connection {} ({}): {}",
            conn.id, conn.mailbox_address, reason
        );
        conn.active = false;
        self.store.set_connection_active(conn.id, false)?;
        Ok(())
    }
}

/// Outstanding consent redirects, keyed by an unguessable `state` value
///
/// Each state is bound to the owner that started the flow and redeems once.
pub struct ConsentStates {
    ttl_secs: i64,
    pending: Mutex<HashMap<String, (OwnerId, DateTime<Utc>)>>,
}

impl ConsentStates {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl_secs,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, owner_id: &OwnerId) -> String {
        self.issue_at(owner_id, Utc::now())
    }

    pub fn issue_at(&self, owner_id: &OwnerId, now: DateTime<Utc>) -> String {
        let state = Uuid::new_v4().simple().to_string();
        let ttl = Duration::seconds(self.ttl_secs);
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, (_, issued_at)| now - *issued_at < ttl);
        pending.insert(state.clone(), (owner_id.clone(), now));
        state
    }

    pub fn redeem(&self, state: &str) -> Option<OwnerId> {
        self.redeem_at(state, Utc::now())
    }

    /// The owner bound to `state`, unless unknown, used or expired
    pub fn redeem_at(&self, state: &str, now: DateTime<Utc>) -> Option<OwnerId> {
        let (owner_id, issued_at) = self.pending.lock().unwrap().remove(state)?;
        (now - issued_at < Duration::seconds(self.ttl_secs)).then_some(owner_id)
    }
}

impl Default for ConsentStates {
    fn default() -> Self {
        Self::new(600)
    }
}

/// OAuth consent flow that creates (or re-activates) mailbox connections
pub struct ConnectionOnboarding<'a> {
    client_id: String,
    endpoint: &'a dyn TokenEndpoint,
    provider: &'a dyn MailProvider,
    store: &'a dyn IngestStore,
}

impl<'a> ConnectionOnboarding<'a> {
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";

    /// Read-only access is enough to locate and download invoices
    const GMAIL_READONLY_SCOPE: &'static str = "https://www.googleapis.com/auth/gmail.readonly";

    pub fn new(
        credentials: &GmailCredentials,
        endpoint: &'a dyn TokenEndpoint,
        provider: &'a dyn MailProvider,
        store: &'a dyn IngestStore,
    ) -> Self {
        Self {
            client_id: credentials.client_id.clone(),
            endpoint,
            provider,
            store,
        }
    }

    /// Build the consent URL the user is redirected to
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            Self::AUTH_URL,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(Self::GMAIL_READONLY_SCOPE),
            urlencoding::encode(state),
        )
    }

    /// Exchange the consent code and store the resulting connection
    ///
    /// A new connection starts without a cursor, so its first run is a full
    /// keyword search over the initial window.
    pub fn complete(
        &self,
        owner_id: &OwnerId,
        code: &str,
        redirect_uri: &str,
    ) -> IngestResult<MailboxConnection> {
        let now = Utc::now();
        let grant = self
            .endpoint
            .exchange_code(code, redirect_uri)
            .map_err(|e| {
                if e.downcast_ref::<RefreshRejected>().is_some() {
                    IngestError::Consent(format!("{:#}", e))
                } else {
                    IngestError::transport("code exchange", format!("{:#}", e))
                }
            })?;

        let profile = self
            .provider
            .get_profile(&grant.access_token)
            .map_err(|e| IngestError::transport("profile", format!("{:#}", e)))?;

        let existing = self
            .store
            .find_connection(owner_id, &profile.email_address)?;

        let mut conn = match existing {
            Some(mut conn) => {
                conn.access_token = grant.access_token.clone();
                if grant.refresh_token.is_some() {
                    conn.refresh_token = grant.refresh_token.clone();
                }
                conn.token_expires_at = Some(grant.expires_at(now));
                conn.active = true;
                conn
            }
            None => {
                let mut conn = MailboxConnection::new(
                    owner_id.clone(),
                    profile.email_address.clone(),
                    grant.access_token.clone(),
                )
                .with_expiry(grant.expires_at(now));
                conn.refresh_token = grant.refresh_token.clone();
                conn
            }
        };

        if conn.id.0 == 0 {
            conn.id = self.store.insert_connection(&conn)?;
            info!("Connected mailbox {} for owner {}", conn.mailbox_address, owner_id);
        } else {
            self.store.update_connection_tokens(
                conn.id,
                &conn.access_token,
                conn.refresh_token.as_deref(),
                conn.token_expires_at,
            )?;
            self.store.set_connection_active(conn.id, true)?;
            info!("Re-authorized mailbox {} for owner {}", conn.mailbox_address, owner_id);
        }

        Ok(conn)
    }

    /// Remove a connection on explicit user disconnect
    pub fn disconnect(&self, connection_id: ConnectionId) -> IngestResult<()> {
        self.store.delete_connection(connection_id)?;
        info!("Disconnected connection {}", connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryIngestStore;

    struct ScriptedEndpoint {
        result: Mutex<Option<Result<TokenGrant>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedEndpoint {
        fn new(result: Result<TokenGrant>) -> Self {
            Self {
                result: Mutex::new(Some(result)),
                calls: Mutex::new(0),
            }
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
            *self.calls.lock().unwrap() += 1;
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow::anyhow!("no scripted result")))
        }

        fn exchange_code(&self, _code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
            unreachable!("not used in these tests")
        }
    }

    fn grant(token: &str) -> TokenGrant {
        TokenGrant {
            access_token: token.to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        }
    }

    fn stored_connection(store: &InMemoryIngestStore, expires_at: DateTime<Utc>) -> MailboxConnection {
        let mut conn = MailboxConnection::new(OwnerId::new("o1"), "a@example.com", "old-token")
            .with_refresh_token("refresh-1")
            .with_expiry(expires_at);
        conn.id = store.insert_connection(&conn).unwrap();
        conn
    }

    #[test]
    fn test_fresh_token_not_refreshed() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Ok(grant("new-token")));
        let now = Utc::now();
        let mut conn = stored_connection(&store, now + Duration::hours(1));

        let manager = TokenManager::new(&endpoint, &store, 0);
        manager.ensure_fresh_at(&mut conn, now).unwrap();

        assert_eq!(conn.access_token, "old-token");
        assert_eq!(*endpoint.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_expired_token_refreshed_and_persisted() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Ok(grant("new-token")));
        let now = Utc::now();
        let mut conn = stored_connection(&store, now - Duration::minutes(1));

        let manager = TokenManager::new(&endpoint, &store, 0);
        manager.ensure_fresh_at(&mut conn, now).unwrap();

        assert_eq!(conn.access_token, "new-token");
        let stored = store.get_connection(conn.id).unwrap().unwrap();
        assert_eq!(stored.access_token, "new-token");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
        assert!(stored.token_expires_at.unwrap() > now);
    }

    #[test]
    fn test_rejected_refresh_deactivates() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Err(RefreshRejected { status: 400 }.into()));
        let now = Utc::now();
        let mut conn = stored_connection(&store, now - Duration::minutes(1));

        let manager = TokenManager::new(&endpoint, &store, 0);
        let err = manager.ensure_fresh_at(&mut conn, now).unwrap_err();

        assert!(matches!(err, IngestError::Auth { .. }));
        assert!(!conn.active);
        assert!(!store.get_connection(conn.id).unwrap().unwrap().active);
    }

    #[test]
    fn test_transport_failure_keeps_connection_active() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Err(anyhow::anyhow!("connection reset")));
        let now = Utc::now();
        let mut conn = stored_connection(&store, now - Duration::minutes(1));

        let manager = TokenManager::new(&endpoint, &store, 0);
        let err = manager.ensure_fresh_at(&mut conn, now).unwrap_err();

        assert!(matches!(err, IngestError::Transport(_)));
        assert!(store.get_connection(conn.id).unwrap().unwrap().active);
    }

    #[test]
    fn test_inactive_connection_never_refreshed() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Ok(grant("new-token")));
        let now = Utc::now();
        let mut conn = stored_connection(&store, now - Duration::minutes(1));
        conn.active = false;

        let manager = TokenManager::new(&endpoint, &store, 0);
        assert!(manager.ensure_fresh_at(&mut conn, now).is_err());
        assert_eq!(*endpoint.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_consent_state_redeems_once() {
        let states = ConsentStates::new(600);
        let now = Utc::now();
        let state = states.issue_at(&OwnerId::new("o1"), now);
        let other = states.issue_at(&OwnerId::new("o2"), now);
        assert_ne!(state, other);
        assert_ne!(state, "o1");

        assert_eq!(states.redeem_at(&state, now), Some(OwnerId::new("o1")));
        assert_eq!(states.redeem_at(&state, now), None);
        assert_eq!(states.redeem_at("o2", now), None);
    }

    #[test]
    fn test_consent_state_expires() {
        let states = ConsentStates::new(600);
        let issued = Utc::now();
        let state = states.issue_at(&OwnerId::new("o1"), issued);
        assert_eq!(states.redeem_at(&state, issued + Duration::seconds(601)), None);
    }

    #[test]
    fn test_missing_refresh_token_deactivates() {
        let store = InMemoryIngestStore::new();
        let endpoint = ScriptedEndpoint::new(Ok(grant("new-token")));
        let mut conn = MailboxConnection::new(OwnerId::new("o1"), "a@example.com", "tok");
        conn.id = store.insert_connection(&conn).unwrap();

        let manager = TokenManager::new(&endpoint, &store, 0);
        let err = manager.ensure_fresh(&mut conn).unwrap_err();

        assert!(matches!(err, IngestError::Auth { .. }));
        assert!(!store.get_connection(conn.id).unwrap().unwrap().active);
    }
}
