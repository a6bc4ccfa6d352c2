//! Blob storage trait for invoice assets and rendered pages

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::OwnerId;

/// Longest filename kept in an asset path
const MAX_FILENAME_LEN: usize = 100;

/// Trait for blob storage operations
///
/// Blobs are addressed by a relative path on write and by the returned URL
/// afterwards.
pub trait BlobStore: Send + Sync {
    /// Store bytes at `path`, returning the URL the blob is addressable by
    fn put(&self, path: &str, data: &[u8], media_type: &str) -> Result<String>;

    /// Retrieve a blob by the URL `put` returned
    ///
    /// Returns None if the blob doesn't exist.
    fn get(&self, url: &str) -> Result<Option<Vec<u8>>>;

    /// Whether third parties (e.g. the extraction service) can fetch the URLs
    fn urls_are_public(&self) -> bool;
}

/// Replace everything outside `[A-Za-z0-9._-]` and bound the length
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    let cleaned = if cleaned.len() > MAX_FILENAME_LEN {
        // Keep the extension when truncating
        match cleaned.rsplit_once('.') {
            Some((stem, ext)) if ext.len() < 10 => {
                let keep = MAX_FILENAME_LEN - ext.len() - 1;
                format!("{}.{}", &stem[..keep.min(stem.len())], ext)
            }
            _ => cleaned[..MAX_FILENAME_LEN].to_string(),
        }
    } else {
        cleaned.to_string()
    };

    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Storage path of an uploaded asset: `{owner}/{YYYYMMDDTHHMMSSfff}-{filename}`
pub fn asset_path(owner_id: &OwnerId, at: DateTime<Utc>, filename: &str) -> String {
    format!(
        "{}/{}-{}",
        sanitize_filename(owner_id.as_str()),
        at.format("%Y%m%dT%H%M%S%3f"),
        sanitize_filename(filename)
    )
}

/// In-memory blob store addressed by `memory://{path}` URLs
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
    public: bool,
}

impl MemoryBlobStore {
    const SCHEME: &'static str = "memory://";

    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            public: false,
        }
    }

    /// Report URLs as externally fetchable
    pub fn with_public_urls(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// Stored paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.blobs.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Media type recorded for a URL
    pub fn media_type(&self, url: &str) -> Option<String> {
        let path = url.strip_prefix(Self::SCHEME)?;
        self.blobs
            .read()
            .unwrap()
            .get(path)
            .map(|(_, media)| media.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, path: &str, data: &[u8], media_type: &str) -> Result<String> {
        if path.is_empty() {
            bail!("Blob path must not be empty");
        }
        self.blobs
            .write()
            .unwrap()
            .insert(path.to_string(), (data.to_vec(), media_type.to_string()));
        Ok(format!("{}{}", Self::SCHEME, path))
    }

    fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = url.strip_prefix(Self::SCHEME) else {
            bail!("Not a memory blob URL: {}", url);
        };
        Ok(self
            .blobs
            .read()
            .unwrap()
            .get(path)
            .map(|(data, _)| data.clone()))
    }

    fn urls_are_public(&self) -> bool {
        self.public
    }
}
