//! Transient view of a provider message that may carry an invoice

use serde::{Deserialize, Serialize};
use url::Url;

use super::MessageId;

/// Media types the engine will hand to extraction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Pdf,
    /// Any `image/*` subtype, stored as the full mime string
    Image(String),
}

impl MediaType {
    /// Classify a declared mime type, returning None for unsupported types
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/pdf" || mime == "application/x-pdf" {
            Some(MediaType::Pdf)
        } else if mime.starts_with("image/") && mime.len() > "image/".len() {
            Some(MediaType::Image(mime))
        } else {
            None
        }
    }

    /// Infer a media type from a filename or URL path extension
    pub fn from_extension(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(MediaType::Pdf),
            "jpg" | "jpeg" => Some(MediaType::Image("image/jpeg".to_string())),
            "png" => Some(MediaType::Image("image/png".to_string())),
            "gif" => Some(MediaType::Image("image/gif".to_string())),
            "webp" => Some(MediaType::Image("image/webp".to_string())),
            "heic" => Some(MediaType::Image("image/heic".to_string())),
            "tif" | "tiff" => Some(MediaType::Image("image/tiff".to_string())),
            _ => None,
        }
    }

    pub fn mime(&self) -> &str {
        match self {
            MediaType::Pdf => "application/pdf",
            MediaType::Image(mime) => mime,
        }
    }

    pub fn is_pdf(&self) -> bool {
        matches!(self, MediaType::Pdf)
    }

    pub fn extension(&self) -> &str {
        match self {
            MediaType::Pdf => "pdf",
            MediaType::Image(mime) => match mime.as_str() {
                "image/jpeg" => "jpg",
                "image/png" => "png",
                "image/gif" => "gif",
                "image/webp" => "webp",
                "image/heic" => "heic",
                "image/tiff" => "tiff",
                _ => "img",
            },
        }
    }
}

/// Where the attachment bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentRef {
    /// Provider attachment id, fetched through the attachment endpoint
    Remote(String),
    /// Small parts the provider returns inline (base64url)
    Inline(String),
}

/// One PDF or image attachment found in a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_ref: ContentRef,
    pub media_type: MediaType,
}

/// A provider message parsed into ingestion sources
///
/// Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMessage {
    pub id: MessageId,
    pub subject: Option<String>,
    pub from: Option<String>,
    /// Provider internal date (milliseconds since epoch)
    pub internal_date: Option<i64>,
    pub attachments: Vec<AttachmentDescriptor>,
    pub links: Vec<Url>,
}

impl CandidateMessage {
    /// Whether the message offers anything to ingest
    pub fn has_sources(&self) -> bool {
        !self.attachments.is_empty() || !self.links.is_empty()
    }
}
