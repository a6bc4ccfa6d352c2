//! Background normalizer: renders PDF previews for email-ingested documents
//!
//! Throttled per owner. Each document is claimed (`None → Converting`)
//! before any work, so a concurrent writer never sees half-written preview
//! fields. Failures (renderer panics included) release the claim and the
//! document is retried on a later tick. A claim left behind by a crashed
//! process expires after `claim_ttl_secs`.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use url::Url;

use super::fetch::Downloader;
use super::timing::cooldown_elapsed_at;
use crate::models::{Document, OwnerId};
use crate::render::PageRenderer;
use crate::storage::{BlobStore, IngestStore, asset_path};

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// The interval since the previous tick has not elapsed
    pub throttled: bool,
    pub claimed: usize,
    pub converted: usize,
    pub failed: usize,
}

pub struct PreviewNormalizer {
    store: Arc<dyn IngestStore>,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn PageRenderer>,
    downloader: Arc<dyn Downloader>,
    interval_secs: u64,
    batch: usize,
    claim_ttl_secs: i64,
    last_tick: Mutex<HashMap<OwnerId, DateTime<Utc>>>,
}

impl PreviewNormalizer {
    pub fn new(
        store: Arc<dyn IngestStore>,
        blobs: Arc<dyn BlobStore>,
        renderer: Arc<dyn PageRenderer>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            store,
            blobs,
            renderer,
            downloader,
            interval_secs: 60,
            batch: 5,
            claim_ttl_secs: 900,
            last_tick: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    /// How long a `Converting` claim lives before another tick may take it over
    pub fn with_claim_ttl(mut self, claim_ttl_secs: i64) -> Self {
        self.claim_ttl_secs = claim_ttl_secs;
        self
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn tick(&self, owner_id: &OwnerId) -> Result<TickReport> {
        self.tick_at(owner_id, Utc::now())
    }

    /// Convert up to one batch of eligible documents
    pub fn tick_at(&self, owner_id: &OwnerId, now: DateTime<Utc>) -> Result<TickReport> {
        {
            let mut last_tick = self.last_tick.lock().unwrap();
            let last = last_tick.get(owner_id).copied();
            if !cooldown_elapsed_at(last, self.interval_secs, now) {
                return Ok(TickReport {
                    throttled: true,
                    ..Default::default()
                });
            }
            last_tick.insert(owner_id.clone(), now);
        }

        let mut report = TickReport::default();
        let stale_before = now - ChronoDuration::seconds(self.claim_ttl_secs);
        let candidates = self
            .store
            .list_preview_candidates(owner_id, self.batch, stale_before)?;

        for doc in candidates {
            // Lost the race to another writer
            if !self.store.claim_conversion(doc.id, now, stale_before)? {
                continue;
            }
            report.claimed += 1;

            let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.convert(&doc, now)))
                .unwrap_or_else(|_| Err(anyhow!("renderer panicked")));
            match attempt {
                Ok(pages) => {
                    debug!("Rendered {} page(s) for document {}", pages, doc.id);
                    report.converted += 1;
                }
                Err(e) => {
                    warn!("Preview conversion failed for document {}: {:#}", doc.id, e);
                    report.failed += 1;
                    if let Err(e) = self.store.release_conversion(doc.id) {
                        warn!("Failed to release claim on document {}: {:#}", doc.id, e);
                    }
                }
            }
        }

        if report.claimed > 0 {
            info!(
                "Previews for owner {}: {} converted, {} failed",
                owner_id, report.converted, report.failed
            );
        }
        Ok(report)
    }

    fn convert(&self, doc: &Document, now: DateTime<Utc>) -> Result<usize> {
        let pdf = self.load_asset(&doc.primary_asset_url)?;
        let pages = self.renderer.render_pages(&pdf)?;
        if pages.is_empty() {
            bail!("Renderer produced no pages");
        }

        let mut urls = Vec::with_capacity(pages.len());
        for page in &pages {
            let filename = format!("{}-page-{}.png", doc.id, page.number);
            let path = asset_path(&doc.owner_id, now, &filename);
            let url = self
                .blobs
                .put(&path, &page.png, "image/png")
                .with_context(|| format!("Failed to upload page {}", page.number))?;
            urls.push(url);
        }

        self.store.complete_conversion(doc.id, &urls[0], &urls)?;
        Ok(urls.len())
    }

    /// Blob store first; external links go through the downloader
    fn load_asset(&self, url: &str) -> Result<Vec<u8>> {
        match self.blobs.get(url) {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => bail!("Blob {} not found", url),
            Err(blob_err) => {
                let parsed = Url::parse(url).with_context(|| format!("Invalid asset URL {}", url))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(blob_err);
                }
                Ok(self.downloader.download(&parsed)?.bytes)
            }
        }
    }
}

/// Ticks the normalizer for one owner on a background thread
///
/// The thread stops when the session is stopped or dropped.
pub struct NormalizerSession {
    owner_id: OwnerId,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NormalizerSession {
    pub fn start(normalizer: Arc<PreviewNormalizer>, owner_id: OwnerId) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let interval = Duration::from_secs(normalizer.interval_secs().max(1));

        let handle = {
            let running = Arc::clone(&running);
            let owner_id = owner_id.clone();
            thread::spawn(move || {
                debug!("Normalizer session started for owner {}", owner_id);
                while running.load(Ordering::SeqCst) {
                    if let Err(e) = normalizer.tick(&owner_id) {
                        warn!("Normalizer tick failed for owner {}: {:#}", owner_id, e);
                    }
                    thread::park_timeout(interval);
                }
                debug!("Normalizer session stopped for owner {}", owner_id);
            })
        };

        Self {
            owner_id,
            running,
            handle: Some(handle),
        }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop ticking and wait for the thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("Normalizer thread for owner {} panicked", self.owner_id);
            }
        }
    }
}

impl Drop for NormalizerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversionState, DocumentStatus, Origin};
    use crate::render::RenderedPage;
    use crate::storage::{InMemoryIngestStore, MemoryBlobStore};
    use crate::sync::fetch::DownloadedFile;
    use chrono::TimeZone;

    struct TwoPageRenderer;

    impl PageRenderer for TwoPageRenderer {
        fn render_pages(&self, pdf: &[u8]) -> Result<Vec<RenderedPage>> {
            if !pdf.starts_with(b"%PDF") {
                bail!("not a pdf");
            }
            Ok((1..=2)
                .map(|number| RenderedPage {
                    number,
                    png: vec![number as u8],
                })
                .collect())
        }
    }

    struct NoDownloads;

    impl Downloader for NoDownloads {
        fn download(&self, url: &Url) -> Result<DownloadedFile> {
            bail!("offline: {}", url)
        }
    }

    struct PanickingRenderer;

    impl PageRenderer for PanickingRenderer {
        fn render_pages(&self, _pdf: &[u8]) -> Result<Vec<RenderedPage>> {
            panic!("poppler crashed");
        }
    }

    fn setup() -> (Arc<InMemoryIngestStore>, Arc<MemoryBlobStore>, PreviewNormalizer) {
        setup_with(Arc::new(TwoPageRenderer))
    }

    fn setup_with(
        renderer: Arc<dyn PageRenderer>,
    ) -> (Arc<InMemoryIngestStore>, Arc<MemoryBlobStore>, PreviewNormalizer) {
        let store = Arc::new(InMemoryIngestStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let normalizer =
            PreviewNormalizer::new(store.clone(), blobs.clone(), renderer, Arc::new(NoDownloads));
        (store, blobs, normalizer)
    }

    fn insert_pdf(store: &InMemoryIngestStore, blobs: &MemoryBlobStore, name: &str, data: &[u8]) -> Document {
        let url = blobs.put(&format!("o1/{}", name), data, "application/pdf").unwrap();
        let mut doc = Document::new(OwnerId::new("o1"), Origin::EmailAttachment, url, DocumentStatus::New)
            .with_media_type("application/pdf");
        doc.id = store.insert_document(&doc).unwrap();
        doc
    }

    #[test]
    fn test_tick_renders_and_stores_pages() {
        let (store, blobs, normalizer) = setup();
        let doc = insert_pdf(&store, &blobs, "a.pdf", b"%PDF-1.7");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        let report = normalizer.tick_at(&OwnerId::new("o1"), now).unwrap();
        assert_eq!(report.converted, 1);

        let stored = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.conversion_state, ConversionState::Converted);
        assert_eq!(stored.page_urls.len(), 2);
        assert_eq!(stored.preview_url.as_ref(), Some(&stored.page_urls[0]));
        assert_eq!(blobs.media_type(&stored.page_urls[1]).as_deref(), Some("image/png"));
    }

    #[test]
    fn test_failure_releases_claim() {
        let (store, blobs, normalizer) = setup();
        let doc = insert_pdf(&store, &blobs, "broken.pdf", b"not a pdf");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        let report = normalizer.tick_at(&OwnerId::new("o1"), now).unwrap();
        assert_eq!(report.failed, 1);

        let stored = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.conversion_state, ConversionState::None);
        assert!(stored.preview_url.is_none());
        assert!(stored.needs_preview());
    }

    #[test]
    fn test_renderer_panic_releases_claim() {
        let (store, blobs, normalizer) = setup_with(Arc::new(PanickingRenderer));
        let doc = insert_pdf(&store, &blobs, "a.pdf", b"%PDF-1.7");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let owner = OwnerId::new("o1");

        let report = normalizer.tick_at(&owner, now).unwrap();
        assert_eq!(report.failed, 1);

        let stored = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.conversion_state, ConversionState::None);
        let next_tick = now + chrono::Duration::seconds(60);
        assert_eq!(normalizer.tick_at(&owner, next_tick).unwrap().claimed, 1);
    }

    #[test]
    fn test_abandoned_claim_is_converted_after_ttl() {
        let (store, blobs, normalizer) = setup();
        let normalizer = normalizer.with_claim_ttl(600);
        let doc = insert_pdf(&store, &blobs, "a.pdf", b"%PDF-1.7");
        let owner = OwnerId::new("o1");
        let crashed_at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        // A process claimed it and died before completing or releasing
        assert!(store.claim_conversion(doc.id, crashed_at, crashed_at).unwrap());

        let early = crashed_at + chrono::Duration::seconds(300);
        assert_eq!(normalizer.tick_at(&owner, early).unwrap().claimed, 0);

        let late = crashed_at + chrono::Duration::seconds(601);
        let report = normalizer.tick_at(&owner, late).unwrap();
        assert_eq!(report.converted, 1);
        let stored = store.get_document(doc.id).unwrap().unwrap();
        assert_eq!(stored.conversion_state, ConversionState::Converted);
    }

    #[test]
    fn test_tick_is_throttled_per_owner() {
        let (_store, _blobs, normalizer) = setup();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let owner = OwnerId::new("o1");

        assert!(!normalizer.tick_at(&owner, now).unwrap().throttled);
        assert!(
            normalizer
                .tick_at(&owner, now + chrono::Duration::seconds(59))
                .unwrap()
                .throttled
        );
        assert!(!normalizer.tick_at(&OwnerId::new("o2"), now).unwrap().throttled);
        assert!(
            !normalizer
                .tick_at(&owner, now + chrono::Duration::seconds(60))
                .unwrap()
                .throttled
        );
    }

    #[test]
    fn test_session_stops_on_drop() {
        let (store, blobs, normalizer) = setup();
        let doc = insert_pdf(&store, &blobs, "a.pdf", b"%PDF-1.7");

        let mut session = NormalizerSession::start(Arc::new(normalizer), OwnerId::new("o1"));
        assert!(session.is_running());

        // The first tick runs immediately
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while store.get_document(doc.id).unwrap().unwrap().preview_url.is_none()
            && std::time::Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        session.stop();
        assert!(!session.is_running());
        assert!(store.get_document(doc.id).unwrap().unwrap().preview_url.is_some());
    }
}
