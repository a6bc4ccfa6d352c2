//! Document materializer: bytes or a link in, one persisted Document out
//!
//! Upload, extraction, normalization, persistence and the usage counter, in
//! that order. An extraction failure still produces a document (for manual
//! review); an upload failure produces nothing.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use url::Url;

use super::fetch::AttachmentFetcher;
use crate::error::{IngestError, IngestResult};
use crate::extract::{ExtractionRequest, ExtractionService, normalize_extraction};
use crate::models::{
    CandidateMessage, ConversionState, Document, DocumentId, DocumentStatus, ExtractedFields,
    MediaType, MessageId, Origin, OwnerId, UsageMonth,
};
use crate::storage::{BlobStore, IngestStore, asset_path};

/// What to turn into a document
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Bytes to upload; extraction reads them inline or by blob URL
    Binary {
        bytes: Vec<u8>,
        filename: String,
        media_type: MediaType,
    },
    /// A link handed to extraction as-is; the link is the primary asset
    Link(Url),
}

/// Caller-supplied context for one materialization
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializeHints {
    pub origin: Origin,
    /// Update this document instead of creating one
    pub document_id: Option<DocumentId>,
    pub source_message_id: Option<MessageId>,
}

impl MaterializeHints {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            document_id: None,
            source_message_id: None,
        }
    }

    pub fn from_message(origin: Origin, message_id: MessageId) -> Self {
        Self {
            origin,
            document_id: None,
            source_message_id: Some(message_id),
        }
    }

    pub fn updating(mut self, document_id: DocumentId) -> Self {
        self.document_id = Some(document_id);
        self
    }
}

pub struct Materializer<'a> {
    store: &'a dyn IngestStore,
    blobs: &'a dyn BlobStore,
    extraction: &'a dyn ExtractionService,
}

impl<'a> Materializer<'a> {
    pub fn new(
        store: &'a dyn IngestStore,
        blobs: &'a dyn BlobStore,
        extraction: &'a dyn ExtractionService,
    ) -> Self {
        Self {
            store,
            blobs,
            extraction,
        }
    }

    pub fn materialize(
        &self,
        owner_id: &OwnerId,
        payload: Payload,
        hints: &MaterializeHints,
    ) -> IngestResult<Document> {
        self.materialize_at(owner_id, payload, hints, Utc::now())
    }

    /// Materialize against an explicit clock (asset path and usage month)
    ///
    /// # Errors
    /// `Storage` if the upload fails (nothing is persisted), `Repository` if
    /// the document cannot be written.
    pub fn materialize_at(
        &self,
        owner_id: &OwnerId,
        payload: Payload,
        hints: &MaterializeHints,
        now: DateTime<Utc>,
    ) -> IngestResult<Document> {
        // 1. Upload
        let (primary_url, media_type, request) = match payload {
            Payload::Binary {
                bytes,
                filename,
                media_type,
            } => {
                let path = asset_path(owner_id, now, &filename);
                let url = self
                    .blobs
                    .put(&path, &bytes, media_type.mime())
                    .map_err(|e| IngestError::Storage(format!("upload {}: {:#}", path, e)))?;
                debug!("Uploaded {} ({} bytes)", url, bytes.len());

                // 2. PDFs and private URLs go inline
                let request = if media_type.is_pdf() || !self.blobs.urls_are_public() {
                    ExtractionRequest::inline(&bytes, media_type.mime())
                } else {
                    ExtractionRequest::url(url.clone())
                };
                (url, Some(media_type), request)
            }
            Payload::Link(link) => {
                let media_type = MediaType::from_extension(link.path());
                (link.to_string(), media_type, ExtractionRequest::url(link.as_str()))
            }
        };

        // 3. Extract and normalize
        let (fields, status) = match self.extract(&request) {
            Ok(fields) => (fields, DocumentStatus::New),
            Err(e) => {
                warn!("Extraction failed for {}: {}", primary_url, e);
                (ExtractedFields::default(), DocumentStatus::PendingManualReview)
            }
        };

        // 4. Persist
        match hints.document_id {
            Some(id) => {
                let mut doc = self.store.get_document(id)?.ok_or_else(|| {
                    IngestError::Repository(anyhow::anyhow!("Document {} not found", id))
                })?;
                doc.origin = hints.origin;
                doc.primary_asset_url = primary_url;
                doc.primary_media_type = media_type.map(|m| m.mime().to_string());
                doc.fields = fields;
                doc.status = status;
                // New asset, so previews must be rendered again
                doc.preview_url = None;
                doc.page_urls.clear();
                doc.conversion_state = ConversionState::None;
                if hints.source_message_id.is_some() {
                    doc.source_message_id = hints.source_message_id.clone();
                }
                doc.updated_at = now;
                self.store.update_document(&doc)?;
                info!("Updated document {} for owner {}", doc.id, owner_id);
                Ok(doc)
            }
            None => {
                let mut doc = Document::new(owner_id.clone(), hints.origin, primary_url, status)
                    .with_fields(fields);
                doc.primary_media_type = media_type.map(|m| m.mime().to_string());
                doc.source_message_id = hints.source_message_id.clone();
                doc.created_at = now;
                doc.updated_at = now;
                doc.id = self.store.insert_document(&doc)?;

                // 5. One count per created document
                let count = self.store.increment_usage(owner_id, UsageMonth::of(now))?;
                info!(
                    "Created document {} for owner {} ({:?}, usage {} this month)",
                    doc.id, owner_id, doc.status, count
                );
                Ok(doc)
            }
        }
    }

    fn extract(&self, request: &ExtractionRequest) -> IngestResult<ExtractedFields> {
        let raw = self
            .extraction
            .extract(request)
            .map_err(|e| IngestError::Extraction(format!("{:#}", e)))?;
        Ok(normalize_extraction(&raw))
    }

    /// Turn one candidate message into at most one document
    ///
    /// Attachments are tried first, then links; the first source that yields
    /// a document wins. Unit failures (fetch, upload) move on to the next
    /// source. Returns None when no source produced a document.
    pub fn materialize_message(
        &self,
        owner_id: &OwnerId,
        access_token: &str,
        candidate: &CandidateMessage,
        fetcher: &AttachmentFetcher<'_>,
        now: DateTime<Utc>,
    ) -> IngestResult<Option<Document>> {
        for attachment in &candidate.attachments {
            let Some(bytes) = fetcher.fetch(access_token, &candidate.id, &attachment.content_ref)
            else {
                continue;
            };

            let payload = Payload::Binary {
                bytes,
                filename: attachment.filename.clone(),
                media_type: attachment.media_type.clone(),
            };
            let hints = MaterializeHints::from_message(Origin::EmailAttachment, candidate.id.clone());
            if let Some(doc) = self.try_source(owner_id, payload, &hints, now)? {
                return Ok(Some(doc));
            }
        }

        for link in &candidate.links {
            let Some(payload) = self.link_payload(link, fetcher) else {
                continue;
            };
            let hints = MaterializeHints::from_message(Origin::EmailLink, candidate.id.clone());
            if let Some(doc) = self.try_source(owner_id, payload, &hints, now)? {
                return Ok(Some(doc));
            }
        }

        Ok(None)
    }

    /// Storage failures skip the source; anything else propagates
    fn try_source(
        &self,
        owner_id: &OwnerId,
        payload: Payload,
        hints: &MaterializeHints,
        now: DateTime<Utc>,
    ) -> IngestResult<Option<Document>> {
        match self.materialize_at(owner_id, payload, hints, now) {
            Ok(doc) => Ok(Some(doc)),
            Err(IngestError::Storage(reason)) => {
                warn!("Skipping source: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Direct file links are downloaded; anything else goes to extraction by URL
    fn link_payload(&self, link: &Url, fetcher: &AttachmentFetcher<'_>) -> Option<Payload> {
        let Some(by_extension) = MediaType::from_extension(link.path()) else {
            return Some(Payload::Link(link.clone()));
        };

        let file = fetcher.fetch_link(link)?;
        let media_type = match file.content_type.as_deref() {
            Some(declared) => match MediaType::from_mime(declared) {
                Some(media) => media,
                // A landing page behind a file-looking URL
                None if declared.starts_with("text/") => return Some(Payload::Link(link.clone())),
                None => by_extension,
            },
            None => by_extension,
        };

        let filename = link
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("link.{}", media_type.extension()));

        Some(Payload::Binary {
            bytes: file.bytes,
            filename,
            media_type,
        })
    }
}
