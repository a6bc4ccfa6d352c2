//! In-process fakes for driving the engine end to end

#![allow(dead_code)]

use anyhow::{Result, anyhow, bail};
use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use ingest::extract::{ExtractionRequest, ExtractionService, RawExtraction};
use ingest::gmail::api::{
    AttachmentResponse, GmailMessage, HistoryMessage, HistoryRecord, HistoryResponse,
    ListMessagesResponse, MessageRef, ProfileResponse, WatchResponse,
};
use ingest::gmail::{HistoryExpiredError, MailProvider, RefreshRejected, TokenEndpoint, TokenGrant};
use ingest::models::{ConnectionId, MailboxConnection, MessageId, OwnerId};
use ingest::render::{PageRenderer, RenderedPage};
use ingest::storage::{InMemoryIngestStore, IngestStore, MemoryBlobStore};
use ingest::sync::{DownloadedFile, Downloader, SyncContext};
use ingest::EngineConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

pub const PDF_BYTES: &[u8] = b"%PDF-1.4 test invoice";

pub fn b64url(data: &[u8]) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(data)
}

/// Message with one PDF attachment per `(filename, attachment_id)`
pub fn attachment_message(id: &str, attachments: &[(&str, &str)]) -> GmailMessage {
    let mut parts = vec![serde_json::json!({
        "mimeType": "text/plain",
        "body": { "data": b64url(b"Your invoice is attached.") }
    })];
    for (filename, attachment_id) in attachments {
        parts.push(serde_json::json!({
            "mimeType": "application/pdf",
            "filename": filename,
            "body": { "attachmentId": attachment_id, "size": 1024 }
        }));
    }
    message(id, serde_json::json!({ "mimeType": "multipart/mixed", "parts": parts }))
}

/// Single-part text message
pub fn text_message(id: &str, body: &str) -> GmailMessage {
    message(
        id,
        serde_json::json!({ "mimeType": "text/plain", "body": { "data": b64url(body.as_bytes()) } }),
    )
}

fn message(id: &str, mut payload: serde_json::Value) -> GmailMessage {
    payload["headers"] = serde_json::json!([
        { "name": "Subject", "value": format!("Invoice {}", id) },
        { "name": "From", "value": "billing@vendor.example.com" }
    ]);
    serde_json::from_value(serde_json::json!({
        "id": id,
        "threadId": format!("t-{}", id),
        "internalDate": "1709640000000",
        "payload": payload
    }))
    .unwrap()
}

/// Scriptable mail provider that records every call
#[derive(Default)]
pub struct FakeMailbox {
    pub address: String,
    pub profile_history: Mutex<u64>,
    pub search_ids: Mutex<Vec<String>>,
    pub history: Mutex<Vec<(u64, Vec<String>)>>,
    pub history_expired: AtomicBool,
    pub messages: Mutex<HashMap<String, GmailMessage>>,
    pub attachments: Mutex<HashMap<String, Vec<u8>>>,
    pub watch_history: Mutex<u64>,
    pub queries: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMailbox {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    pub fn add_message(&self, message: GmailMessage) {
        self.messages
            .lock()
            .unwrap()
            .insert(message.id.clone(), message);
    }

    pub fn add_attachment(&self, attachment_id: &str, bytes: &[u8]) {
        self.attachments
            .lock()
            .unwrap()
            .insert(attachment_id.to_string(), bytes.to_vec());
    }

    pub fn set_search(&self, ids: &[&str]) {
        *self.search_ids.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn add_history(&self, history_id: u64, ids: &[&str]) {
        self.history
            .lock()
            .unwrap()
            .push((history_id, ids.iter().map(|s| s.to_string()).collect()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

impl MailProvider for FakeMailbox {
    fn search_messages(
        &self,
        _access_token: &str,
        query: &str,
        _page_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListMessagesResponse> {
        self.record("search");
        self.queries.lock().unwrap().push(query.to_string());
        let messages = self
            .search_ids
            .lock()
            .unwrap()
            .iter()
            .take(max_results)
            .map(|id| MessageRef {
                id: id.clone(),
                thread_id: format!("t-{}", id),
            })
            .collect();
        Ok(ListMessagesResponse {
            messages: Some(messages),
            ..Default::default()
        })
    }

    fn list_history(
        &self,
        _access_token: &str,
        start_history_id: u64,
        _page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        self.record("history");
        if self.history_expired.load(Ordering::SeqCst) {
            return Err(HistoryExpiredError.into());
        }

        let records: Vec<HistoryRecord> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id > start_history_id)
            .map(|(id, ids)| HistoryRecord {
                id: Some(*id),
                messages_added: Some(
                    ids.iter()
                        .map(|m| HistoryMessage {
                            message: MessageRef {
                                id: m.clone(),
                                thread_id: format!("t-{}", m),
                            },
                        })
                        .collect(),
                ),
            })
            .collect();
        let newest = records.iter().filter_map(|r| r.id).max();

        Ok(HistoryResponse {
            history: Some(records),
            next_page_token: None,
            history_id: newest.or(Some(start_history_id)),
        })
    }

    fn get_message(&self, _access_token: &str, id: &MessageId) -> Result<GmailMessage> {
        self.record(format!("get:{}", id));
        self.messages
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("404 message {}", id))
    }

    fn get_attachment(
        &self,
        _access_token: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentResponse> {
        self.record(format!("attachment:{}:{}", message_id, attachment_id));
        let bytes = self
            .attachments
            .lock()
            .unwrap()
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| anyhow!("404 attachment {}", attachment_id))?;
        Ok(AttachmentResponse {
            size: Some(bytes.len() as u64),
            data: Some(b64url(&bytes)),
        })
    }

    fn get_profile(&self, _access_token: &str) -> Result<ProfileResponse> {
        self.record("profile");
        Ok(ProfileResponse {
            email_address: self.address.clone(),
            messages_total: None,
            threads_total: None,
            history_id: Some(*self.profile_history.lock().unwrap()),
        })
    }

    fn watch(&self, _access_token: &str, _topic: &str) -> Result<WatchResponse> {
        self.record("watch");
        Ok(WatchResponse {
            history_id: Some(*self.watch_history.lock().unwrap()),
            expiration: Some("1710000000000".to_string()),
        })
    }
}

/// Token endpoint that grants or rejects every refresh
#[derive(Default)]
pub struct FakeTokens {
    pub reject: AtomicBool,
    pub reject_code: AtomicBool,
    pub refreshes: AtomicUsize,
}

impl TokenEndpoint for FakeTokens {
    fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(RefreshRejected { status: 400 }.into());
        }
        Ok(TokenGrant {
            access_token: "fresh-token".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }

    fn exchange_code(&self, _code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
        if self.reject_code.load(Ordering::SeqCst) {
            return Err(RefreshRejected { status: 400 }.into());
        }
        Ok(TokenGrant {
            access_token: "consent-token".to_string(),
            refresh_token: Some("consent-refresh".to_string()),
            expires_in: Some(3600),
        })
    }
}

/// Extraction service returning a fixed result (or failing)
pub struct FakeExtractor {
    pub result: Mutex<RawExtraction>,
    pub fail: AtomicBool,
    pub requests: Mutex<Vec<ExtractionRequest>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self {
            result: Mutex::new(RawExtraction {
                supplier_name: Some("Vendor Ltd".to_string()),
                document_number: Some("INV-1001".to_string()),
                document_date: Some("2024-03-01".to_string()),
                currency: Some("ILS".to_string()),
                total_amount: Some(serde_json::json!("1,170.00")),
                vat_amount: Some(serde_json::json!(170)),
                amount_before_vat: Some(serde_json::json!(1000)),
                document_type: Some("tax invoice".to_string()),
                business_type: Some("company".to_string()),
                category: Some("software".to_string()),
                ..Default::default()
            }),
            fail: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ExtractionService for FakeExtractor {
    fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("extraction service returned 503");
        }
        Ok(self.result.lock().unwrap().clone())
    }
}

/// One PNG per page, page count fixed
pub struct FakeRenderer {
    pub pages: usize,
    pub calls: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            calls: AtomicUsize::new(0),
        }
    }
}

impl PageRenderer for FakeRenderer {
    fn render_pages(&self, pdf: &[u8]) -> Result<Vec<RenderedPage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !pdf.starts_with(b"%PDF") {
            bail!("not a PDF");
        }
        Ok((1..=self.pages)
            .map(|number| RenderedPage {
                number,
                png: format!("png-{}", number).into_bytes(),
            })
            .collect())
    }
}

/// Serves canned responses by URL
#[derive(Default)]
pub struct FakeDownloader {
    pub files: Mutex<HashMap<String, DownloadedFile>>,
}

impl FakeDownloader {
    pub fn serve(&self, url: &str, bytes: &[u8], content_type: Option<&str>) {
        self.files.lock().unwrap().insert(
            url.to_string(),
            DownloadedFile {
                bytes: bytes.to_vec(),
                content_type: content_type.map(str::to_string),
            },
        );
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &Url) -> Result<DownloadedFile> {
        self.files
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("404 {}", url))
    }
}

/// Every engine dependency, faked, around one store
pub struct Harness {
    pub config: EngineConfig,
    pub mailbox: FakeMailbox,
    pub tokens: FakeTokens,
    pub store: Arc<dyn IngestStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub extractor: FakeExtractor,
    pub downloader: Arc<FakeDownloader>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryIngestStore::new()))
    }

    pub fn with_store(store: Arc<dyn IngestStore>) -> Self {
        Self {
            config: EngineConfig::default(),
            mailbox: FakeMailbox::new("billing@example.com"),
            tokens: FakeTokens::default(),
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            extractor: FakeExtractor::new(),
            downloader: Arc::new(FakeDownloader::default()),
        }
    }

    pub fn ctx(&self) -> SyncContext<'_> {
        SyncContext {
            config: &self.config,
            provider: &self.mailbox,
            tokens: &self.tokens,
            store: &*self.store,
            blobs: &*self.blobs,
            extraction: &self.extractor,
            downloader: &*self.downloader,
        }
    }

    /// Insert an active connection with a valid token
    pub fn connect(&self, owner: &str, cursor: Option<u64>) -> ConnectionId {
        let mut conn = MailboxConnection::new(OwnerId::new(owner), &self.mailbox.address, "token")
            .with_refresh_token("refresh")
            .with_expiry(Utc::now() + Duration::hours(1));
        conn.history_cursor = cursor;
        self.store.insert_connection(&conn).unwrap()
    }

    pub fn connection(&self, id: ConnectionId) -> MailboxConnection {
        self.store.get_connection(id).unwrap().unwrap()
    }
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}
