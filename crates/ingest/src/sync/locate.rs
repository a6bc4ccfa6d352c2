//! Message locator: turns a sync mode into candidate message ids
//!
//! Full search runs a keyword query over a date window. Incremental mode
//! pages the history since the stored cursor and falls back to a short full
//! search when the provider no longer knows that cursor.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::error::{IngestError, IngestResult};
use crate::gmail::{HistoryExpiredError, MailProvider};
use crate::models::MessageId;

/// Largest page the search endpoint accepts
const MAX_PAGE_SIZE: usize = 500;

/// How a run should discover candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Keyword search over the initial window
    Full,
    /// History since the stored cursor (degrades to `Full` without one)
    Incremental,
}

/// Candidate ids plus the newest history id observed while locating them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocateResult {
    /// De-duplicated, in provider order
    pub message_ids: Vec<MessageId>,
    pub newest_history_id: Option<u64>,
    /// The cursor had expired and a fallback window search ran instead
    pub used_fallback: bool,
}

/// Build the provider search query
///
/// `("k1" OR "k2") after:YYYY/MM/DD (has:attachment OR from:(h1 OR h2))`
pub fn build_search_query(keywords: &[String], after: NaiveDate, sender_hints: &[String]) -> String {
    let mut parts = Vec::new();

    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| k.replace('"', "").trim().to_string())
        .filter(|k| !k.is_empty())
        .map(|k| format!("\"{}\"", k))
        .collect();
    if !keywords.is_empty() {
        parts.push(format!("({})", keywords.join(" OR ")));
    }

    parts.push(format!("after:{}", after.format("%Y/%m/%d")));

    let hints: Vec<&str> = sender_hints
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .collect();
    if hints.is_empty() {
        parts.push("has:attachment".to_string());
    } else {
        parts.push(format!("(has:attachment OR from:({}))", hints.join(" OR ")));
    }

    parts.join(" ")
}

/// Order-preserving id accumulator bounded by the locate cap
struct IdCollector {
    ids: Vec<MessageId>,
    seen: HashSet<String>,
    cap: usize,
}

impl IdCollector {
    fn new(cap: usize) -> Self {
        Self {
            ids: Vec::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    fn push(&mut self, id: &str) {
        if !self.is_full() && self.seen.insert(id.to_string()) {
            self.ids.push(MessageId::new(id));
        }
    }

    fn is_full(&self) -> bool {
        self.ids.len() >= self.cap
    }

    fn remaining(&self) -> usize {
        self.cap.saturating_sub(self.ids.len())
    }
}

pub struct MessageLocator<'a> {
    provider: &'a dyn MailProvider,
    config: &'a EngineConfig,
}

impl<'a> MessageLocator<'a> {
    pub fn new(provider: &'a dyn MailProvider, config: &'a EngineConfig) -> Self {
        Self { provider, config }
    }

    /// Locate candidates for `mode`
    ///
    /// An expired cursor is never fatal: the locator falls back to a search
    /// over the last `fallback_search_days`.
    pub fn locate(
        &self,
        access_token: &str,
        mode: SyncMode,
        cursor: Option<u64>,
        now: DateTime<Utc>,
    ) -> IngestResult<LocateResult> {
        match (mode, cursor) {
            (SyncMode::Incremental, Some(cursor)) => {
                match self.incremental(access_token, cursor) {
                    Err(IngestError::HistoryExpired) => {
                        warn!(
                            "History cursor {} expired, searching the last {} day(s)",
                            cursor, self.config.fallback_search_days
                        );
                        let after = (now - Duration::days(self.config.fallback_search_days)).date_naive();
                        let mut result = self.full_search(access_token, after)?;
                        result.used_fallback = true;
                        Ok(result)
                    }
                    other => other,
                }
            }
            (SyncMode::Incremental, None) => {
                info!("No history cursor stored, running a full search");
                self.full_search(access_token, self.initial_window_start(now))
            }
            (SyncMode::Full, _) => self.full_search(access_token, self.initial_window_start(now)),
        }
    }

    fn initial_window_start(&self, now: DateTime<Utc>) -> NaiveDate {
        (now - Duration::days(self.config.initial_search_days)).date_naive()
    }

    /// Keyword search after `after`, paged until exhausted or capped
    ///
    /// The history id comes from the profile, read before searching, so
    /// nothing that arrives during the search is skipped by the next run.
    pub fn full_search(&self, access_token: &str, after: NaiveDate) -> IngestResult<LocateResult> {
        let profile = self
            .provider
            .get_profile(access_token)
            .map_err(|e| IngestError::transport("get profile", format!("{:#}", e)))?;

        let query = build_search_query(
            &self.config.search_keywords,
            after,
            &self.config.sender_hints,
        );
        debug!("Full search: {}", query);

        let mut ids = IdCollector::new(self.config.locate_cap);
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .provider
                .search_messages(
                    access_token,
                    &query,
                    page_token.as_deref(),
                    ids.remaining().min(MAX_PAGE_SIZE),
                )
                .map_err(|e| IngestError::transport("search messages", format!("{:#}", e)))?;

            for msg_ref in page.messages.unwrap_or_default() {
                ids.push(&msg_ref.id);
            }

            match page.next_page_token {
                Some(token) if !ids.is_full() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(LocateResult {
            message_ids: ids.ids,
            newest_history_id: profile.history_id,
            used_fallback: false,
        })
    }

    /// Messages added since `cursor`
    ///
    /// # Errors
    /// `HistoryExpired` when the provider rejects the cursor
    pub fn incremental(&self, access_token: &str, cursor: u64) -> IngestResult<LocateResult> {
        let mut ids = IdCollector::new(self.config.locate_cap);
        let mut newest: Option<u64> = None;
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .provider
                .list_history(access_token, cursor, page_token.as_deref())
                .map_err(|e| {
                    if e.downcast_ref::<HistoryExpiredError>().is_some() {
                        IngestError::HistoryExpired
                    } else {
                        IngestError::transport("list history", format!("{:#}", e))
                    }
                })?;

            newest = newest.max(page.history_id);

            for record in page.history.unwrap_or_default() {
                newest = newest.max(record.id);
                for added in record.messages_added.unwrap_or_default() {
                    ids.push(&added.message.id);
                }
            }

            match page.next_page_token {
                Some(token) if !ids.is_full() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            "History since {}: {} new message(s), newest {:?}",
            cursor,
            ids.ids.len(),
            newest
        );

        Ok(LocateResult {
            message_ids: ids.ids,
            newest_history_id: newest,
            used_fallback: false,
        })
    }
}
