//! Message parser: provider message to `CandidateMessage`
//!
//! Pure, no network access. Walks the part tree once, collecting attachment
//! descriptors and body text, then pulls invoice links out of the body.

use base64::prelude::*;
use log::debug;
use url::Url;

use crate::error::{IngestError, IngestResult};
use crate::gmail::api::GmailMessage;
use crate::gmail::{MimeNode, walk_parts};
use crate::models::{AttachmentDescriptor, CandidateMessage, ContentRef, MediaType, MessageId};

/// At most this many links are kept per message
pub const MAX_LINKS_PER_MESSAGE: usize = 3;

/// Parse a full provider message into ingestion sources
///
/// # Errors
/// `Parse` if the message has no payload
pub fn parse_message(message: &GmailMessage, link_hints: &[String]) -> IngestResult<CandidateMessage> {
    let payload = message
        .payload
        .as_ref()
        .ok_or_else(|| IngestError::Parse(format!("message {} has no payload", message.id)))?;

    let mut attachments = Vec::new();
    let mut body = String::new();

    let complete = walk_parts(payload, |part, _depth| {
        if let Some(descriptor) = attachment_descriptor(part) {
            attachments.push(descriptor);
            return;
        }

        let mime = part.mime_type().unwrap_or_default().to_ascii_lowercase();
        if (mime.starts_with("text/plain") || mime.starts_with("text/html"))
            && let Some(text) = part.inline_data().and_then(decode_base64_body)
        {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&text);
        }
    });

    if !complete {
        debug!("Message {} has a truncated part tree", message.id);
    }

    let internal_date = message
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok());

    Ok(CandidateMessage {
        id: MessageId::new(&message.id),
        subject: payload.header("Subject").map(str::to_string),
        from: payload.header("From").map(str::to_string),
        internal_date,
        attachments,
        links: extract_links(&body, link_hints),
    })
}

/// A part becomes an attachment when it has a filename, a content
/// reference, and a PDF or image media type
pub fn attachment_descriptor<N: MimeNode>(part: &N) -> Option<AttachmentDescriptor> {
    let filename = part.filename()?;

    let content_ref = match (part.attachment_id(), part.inline_data()) {
        (Some(id), _) => ContentRef::Remote(id.to_string()),
        (None, Some(data)) => ContentRef::Inline(data.to_string()),
        (None, None) => return None,
    };

    let declared = part.mime_type().unwrap_or_default();
    let media_type = match MediaType::from_mime(declared) {
        Some(media) => media,
        // Generic binary types: trust the extension
        None if is_generic_binary(declared) => MediaType::from_extension(filename)?,
        None => return None,
    };

    Some(AttachmentDescriptor {
        filename: filename.to_string(),
        content_ref,
        media_type,
    })
}

fn is_generic_binary(mime: &str) -> bool {
    let mime = mime.trim().to_ascii_lowercase();
    mime.is_empty()
        || mime.starts_with("application/octet-stream")
        || mime.starts_with("binary/octet-stream")
        || mime.starts_with("application/force-download")
}

/// Decode provider base64url data (padding optional)
pub fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    let decoders: [&base64::engine::GeneralPurpose; 3] =
        [&BASE64_URL_SAFE_NO_PAD, &BASE64_URL_SAFE, &BASE64_STANDARD];

    let data = data.trim();
    decoders.iter().find_map(|decoder| decoder.decode(data).ok())
}

/// Decode a base64url body into text (lossy for invalid UTF-8)
pub fn decode_base64_body(data: &str) -> Option<String> {
    decode_base64url(data).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Well-formed HTTP(S) URLs containing an invoice hint (case-insensitive)
///
/// De-duplicated, in body order, capped at [`MAX_LINKS_PER_MESSAGE`].
pub fn extract_links(body: &str, link_hints: &[String]) -> Vec<Url> {
    let hints: Vec<String> = link_hints.iter().map(|h| h.to_lowercase()).collect();
    let mut links: Vec<Url> = Vec::new();

    for candidate in url_candidates(body) {
        let Ok(url) = Url::parse(&candidate) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            continue;
        }

        let lowered = url.as_str().to_lowercase();
        if !hints.iter().any(|h| lowered.contains(h.as_str())) {
            continue;
        }

        if !links.contains(&url) {
            links.push(url);
            if links.len() >= MAX_LINKS_PER_MESSAGE {
                break;
            }
        }
    }

    links
}

/// Raw `http://` / `https://` runs, cut at whitespace, quotes and markup
fn url_candidates(body: &str) -> Vec<String> {
    let lowered = body.to_ascii_lowercase();
    let mut candidates = Vec::new();
    let mut from = 0;

    while let Some(pos) = lowered[from..].find("http") {
        let start = from + pos;
        from = start + 4;

        let rest = &lowered[start..];
        if !(rest.starts_with("https://") || rest.starts_with("http://")) {
            continue;
        }

        let tail = &body[start..];
        let end = tail
            .find(|c: char| {
                c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | '`' | '(' | ')' | '[' | ']')
            })
            .unwrap_or(tail.len());
        let raw = tail[..end].trim_end_matches(['.', ',', ';', ':', '!', '?']);
        // href attributes carry HTML-escaped ampersands
        candidates.push(raw.replace("&amp;", "&"));
    }

    candidates
}
