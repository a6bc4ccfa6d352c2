//! Gmail API integration
//!
//! This module provides:
//! - OAuth2 token refresh and consent exchange
//! - Gmail API client for search, history, messages and attachments
//! - A generic MIME part tree abstraction over message payloads

mod auth;
mod client;
mod mime;

use anyhow::Result;

pub use auth::{
    ConnectionOnboarding, ConsentStates, GoogleTokenEndpoint, RefreshRejected, TokenEndpoint,
    TokenGrant, TokenManager,
};
pub use client::{GmailClient, HistoryExpiredError};
pub use mime::{MimeNode, walk_parts};

use crate::models::MessageId;
use api::{
    AttachmentResponse, GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse,
    WatchResponse,
};

/// Mail provider operations the engine depends on
///
/// `GmailClient` is the production implementation. Tests drive the engine
/// through in-process fakes.
pub trait MailProvider: Send + Sync {
    /// Search message ids matching a provider query
    fn search_messages(
        &self,
        access_token: &str,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListMessagesResponse>;

    /// List history since a cursor
    ///
    /// # Errors
    /// Returns `HistoryExpiredError` if the cursor is too old to resolve
    fn list_history(
        &self,
        access_token: &str,
        start_history_id: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse>;

    /// Get a full message (nested MIME payload)
    fn get_message(&self, access_token: &str, id: &MessageId) -> Result<GmailMessage>;

    /// Get one attachment body (base64url)
    fn get_attachment(
        &self,
        access_token: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentResponse>;

    /// Get the mailbox profile (address and current history id)
    fn get_profile(&self, access_token: &str) -> Result<ProfileResponse>;

    /// Register push notifications for the inbox
    fn watch(&self, access_token: &str, topic: &str) -> Result<WatchResponse>;
}

/// Gmail API response types
pub mod api {
    use serde::{Deserialize, Deserializer, Serialize};

    /// Gmail encodes history ids as decimal strings; push payloads use numbers
    pub(crate) fn de_history_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Num(n)) => Ok(Some(n)),
            Some(Raw::Str(s)) => s
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }

    /// Response from listing or searching messages
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
    }

    /// Full message from Gmail API
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        #[serde(default)]
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        pub internal_date: Option<String>,
        #[serde(default, deserialize_with = "de_history_id")]
        pub history_id: Option<u64>,
        pub payload: Option<MessagePart>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Part body: inline data for small parts, an attachment id otherwise
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PartBody {
        pub size: Option<u64>,
        pub data: Option<String>,
        pub attachment_id: Option<String>,
    }

    /// Message part; the top-level payload is a part too
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<PartBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    impl MessagePart {
        /// Find a header value by name (case-insensitive)
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .as_ref()?
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str())
        }
    }

    /// Response from the history list endpoint
    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
        #[serde(default, deserialize_with = "de_history_id")]
        pub history_id: Option<u64>,
    }

    /// A single history record
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        #[serde(default, deserialize_with = "de_history_id")]
        pub id: Option<u64>,
        pub messages_added: Option<Vec<HistoryMessage>>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct HistoryMessage {
        pub message: MessageRef,
    }

    /// Attachment body returned by the attachments endpoint
    #[derive(Debug, Deserialize)]
    pub struct AttachmentResponse {
        pub size: Option<u64>,
        pub data: Option<String>,
    }

    /// Mailbox profile
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ProfileResponse {
        pub email_address: String,
        pub messages_total: Option<u64>,
        pub threads_total: Option<u64>,
        #[serde(default, deserialize_with = "de_history_id")]
        pub history_id: Option<u64>,
    }

    /// Body of a watch registration
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchRequest<'a> {
        pub topic_name: &'a str,
        pub label_ids: Vec<&'a str>,
        pub label_filter_behavior: &'a str,
    }

    /// Response from a watch registration
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WatchResponse {
        #[serde(default, deserialize_with = "de_history_id")]
        pub history_id: Option<u64>,
        /// Expiration in milliseconds since epoch (string encoded)
        pub expiration: Option<String>,
    }
}
