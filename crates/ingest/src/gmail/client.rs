//! Gmail API HTTP client
//!
//! Provides search, history, message and attachment calls against the Gmail
//! API. Uses synchronous HTTP (ureq) to be executor-agnostic. The access token
//! is supplied per call since one client serves every connection.

use anyhow::{Context, Result};
use log::debug;
use std::time::Duration;

use super::MailProvider;
use super::api::{
    AttachmentResponse, GmailMessage, HistoryResponse, ListMessagesResponse, ProfileResponse,
    WatchRequest, WatchResponse,
};
use crate::models::MessageId;

/// Error indicating the history ID has expired
#[derive(Debug, thiserror::Error)]
#[error("History ID expired or invalid")]
pub struct HistoryExpiredError;

/// Attachments are returned base64-encoded inside JSON; allow ~50MB bodies
const MAX_ATTACHMENT_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Gmail API client
pub struct GmailClient {
    agent: ureq::Agent,
    base_url: String,
    max_retries: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Create a new Gmail client using the given HTTP agent
    pub fn new(agent: ureq::Agent) -> Self {
        Self {
            agent,
            base_url: Self::BASE_URL.to_string(),
            max_retries: 3,
        }
    }

    /// Point the client at another API root (e.g. a local stub server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn bearer(access_token: &str) -> String {
        format!("Bearer {}", access_token)
    }

    /// Run a request with exponential backoff on rate limiting and server errors
    fn with_retry<T>(&self, what: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut delay = Duration::from_millis(250);
        let mut attempt = 0;

        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    debug!("{} failed (attempt {}), retrying: {}", what, attempt, e);
                    let jitter = Duration::from_millis(rand_jitter());
                    std::thread::sleep(delay + jitter);
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl MailProvider for GmailClient {
    fn search_messages(
        &self,
        access_token: &str,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?q={}&maxResults={}",
            self.base_url,
            urlencoding::encode(query),
            max_results.clamp(1, 500)
        );

        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        self.with_retry("search messages", || {
            let mut response = self
                .agent
                .get(&url)
                .header("Authorization", &Self::bearer(access_token))
                .call()
                .context("Failed to send search messages request")?;

            response
                .body_mut()
                .read_json::<ListMessagesResponse>()
                .context("Failed to parse search messages response")
        })
    }

    fn list_history(
        &self,
        access_token: &str,
        start_history_id: u64,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&historyTypes=messageAdded",
            self.base_url, start_history_id
        );

        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        self.with_retry("list history", || {
            let response = self
                .agent
                .get(&url)
                .header("Authorization", &Self::bearer(access_token))
                .call();

            match response {
                Ok(mut resp) => {
                    let history: HistoryResponse = resp
                        .body_mut()
                        .read_json()
                        .context("Failed to parse history response")?;
                    Ok(history)
                }
                Err(ureq::Error::StatusCode(404)) => {
                    // History ID expired or invalid
                    Err(HistoryExpiredError.into())
                }
                Err(e) => Err(anyhow::Error::new(e).context("Failed to fetch history")),
            }
        })
    }

    fn get_message(&self, access_token: &str, id: &MessageId) -> Result<GmailMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            self.base_url,
            urlencoding::encode(id.as_str())
        );

        self.with_retry("get message", || {
            let mut response = self
                .agent
                .get(&url)
                .header("Authorization", &Self::bearer(access_token))
                .call()
                .context("Failed to send get message request")?;

            response
                .body_mut()
                .read_json::<GmailMessage>()
                .context("Failed to parse message response")
        })
    }

    fn get_attachment(
        &self,
        access_token: &str,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<AttachmentResponse> {
        let url = format!(
            "{}/users/me/messages/{}/attachments/{}",
            self.base_url,
            urlencoding::encode(message_id.as_str()),
            urlencoding::encode(attachment_id)
        );

        self.with_retry("get attachment", || {
            let mut response = self
                .agent
                .get(&url)
                .header("Authorization", &Self::bearer(access_token))
                .call()
                .context("Failed to send get attachment request")?;

            response
                .body_mut()
                .with_config()
                .limit(MAX_ATTACHMENT_RESPONSE_BYTES)
                .read_json::<AttachmentResponse>()
                .context("Failed to parse attachment response")
        })
    }

    fn get_profile(&self, access_token: &str) -> Result<ProfileResponse> {
        let url = format!("{}/users/me/profile", self.base_url);

        let mut response = self
            .agent
            .get(&url)
            .header("Authorization", &Self::bearer(access_token))
            .call()
            .context("Failed to send profile request")?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse profile response")
    }

    fn watch(&self, access_token: &str, topic: &str) -> Result<WatchResponse> {
        let url = format!("{}/users/me/watch", self.base_url);
        let request = WatchRequest {
            topic_name: topic,
            label_ids: vec!["INBOX"],
            label_filter_behavior: "include",
        };

        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &Self::bearer(access_token))
            .send_json(&request)
            .context("Failed to send watch request")?;

        response
            .body_mut()
            .read_json()
            .context("Failed to parse watch response")
    }
}

/// Whether an error is worth retrying (rate limit or server-side failure)
fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ureq::Error>(),
            Some(ureq::Error::StatusCode(429 | 500..=599)) | Some(ureq::Error::Timeout(_))
        )
    })
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const RATE_LIMITED: &str =
        "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const NOT_FOUND: &str =
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    fn json_ok(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    /// Answer one connection per scripted response, counting requests
    fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(response.as_bytes());
            }
        });

        (base_url, hits)
    }

    #[test]
    fn test_list_history_retries_rate_limit() {
        let (base_url, hits) = serve(vec![
            RATE_LIMITED.to_string(),
            json_ok(r#"{"history":[],"historyId":"42"}"#),
        ]);
        let client = GmailClient::new(ureq::Agent::new_with_defaults()).with_base_url(base_url);

        let history = client.list_history("token", 10, None).unwrap();
        assert_eq!(history.history_id, Some(42));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_list_history_expired_is_not_retried() {
        let (base_url, hits) = serve(vec![NOT_FOUND.to_string(), NOT_FOUND.to_string()]);
        let client = GmailClient::new(ureq::Agent::new_with_defaults()).with_base_url(base_url);

        let err = client.list_history("token", 10, None).unwrap_err();
        assert!(err.downcast_ref::<HistoryExpiredError>().is_some());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = anyhow::Error::new(ureq::Error::StatusCode(429)).context("search");
        assert!(is_retryable(&err));
        let err = anyhow::Error::new(ureq::Error::StatusCode(503));
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_client_errors_not_retryable() {
        let err = anyhow::Error::new(ureq::Error::StatusCode(404));
        assert!(!is_retryable(&err));
        let err = anyhow::anyhow!("Failed to parse message response");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = GmailClient::new(ureq::Agent::new_with_defaults())
            .with_base_url("http://localhost:9000/gmail/v1/");
        assert_eq!(client.base_url, "http://localhost:9000/gmail/v1");
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..20 {
            assert!(rand_jitter() < 100);
        }
    }
}
