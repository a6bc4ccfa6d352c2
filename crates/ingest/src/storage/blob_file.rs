//! File-based blob storage with zstd compression

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};

use super::blob::BlobStore;

/// File-based blob storage with zstd compression
///
/// Directory structure (one shard per owner):
/// ```text
/// blobs/
///   owner-1/
///     20240305T140709042-invoice.pdf.zst
///     20240305T140709042-invoice-page-1.png.zst
///   owner-2/
///     ...
/// ```
///
/// URLs are `{base_url}/{path}` when a base URL is configured (the daemon
/// serves them decompressed), `file://{root}/{path}` otherwise.
pub struct FileBlobStore {
    root: PathBuf,
    base_url: Option<String>,
    compression_level: i32,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            base_url: None,
            compression_level: 3, // Good balance of speed vs compression
        })
    }

    /// Serve URLs from a public base URL instead of `file://`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn file_url_prefix(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    fn url_for(&self, path: &str) -> String {
        match &self.base_url {
            Some(base) => format!("{}/{}", base, path),
            None => format!("{}{}", self.file_url_prefix(), path),
        }
    }

    /// Map a URL this store produced back to its relative path
    fn relative_path<'a>(&self, url: &'a str) -> Option<&'a str> {
        if let Some(base) = &self.base_url
            && let Some(rest) = url.strip_prefix(base.as_str())
        {
            return rest.strip_prefix('/');
        }
        url.strip_prefix(&self.file_url_prefix())
    }

    /// Get the file path for a relative blob path
    fn blob_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("Invalid blob path {:?}", path);
        }
        Ok(self.root.join(format!("{}.zst", path)))
    }

    /// Read a blob by its relative path (used by the HTTP blob route)
    pub fn read_path(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.blob_path(path)?;

        if !file.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&file)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Failed to decompress blob")?;

        Ok(Some(decompressed))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, path: &str, data: &[u8], _media_type: &str) -> Result<String> {
        let file = self.blob_path(path)?;

        // Ensure parent directory exists
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress blob")?;

        // Write atomically (write to temp, then rename)
        let temp_path = file.with_extension("tmp");
        fs::write(&temp_path, &compressed)
            .with_context(|| format!("Failed to write blob {}", path))?;
        fs::rename(&temp_path, &file)?;

        Ok(self.url_for(path))
    }

    fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.relative_path(url) else {
            bail!("URL {} does not belong to this blob store", url);
        };
        self.read_path(path)
    }

    fn urls_are_public(&self) -> bool {
        self.base_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_file_url() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        let url = store
            .put("o1/20240101T000000000-a.pdf", b"%PDF-1.7", "application/pdf")
            .unwrap();

        assert!(url.starts_with("file://"));
        assert!(url.ends_with("o1/20240101T000000000-a.pdf"));
        assert_eq!(store.get(&url).unwrap().unwrap(), b"%PDF-1.7");
        assert!(!store.urls_are_public());
    }

    #[test]
    fn test_base_url_mapping() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs"))
            .unwrap()
            .with_base_url("https://assets.example.com/blobs/");

        let url = store.put("o1/x.png", b"png-bytes", "image/png").unwrap();
        assert_eq!(url, "https://assets.example.com/blobs/o1/x.png");
        assert!(store.urls_are_public());
        assert_eq!(store.get(&url).unwrap().unwrap(), b"png-bytes");
        assert_eq!(store.read_path("o1/x.png").unwrap().unwrap(), b"png-bytes");
    }

    #[test]
    fn test_get_nonexistent() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        assert!(store.read_path("o1/missing.pdf").unwrap().is_none());
        assert!(store.get("https://unrelated.example.com/a.pdf").is_err());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        assert!(store.put("../outside.pdf", b"x", "application/pdf").is_err());
        assert!(store.put("/abs.pdf", b"x", "application/pdf").is_err());
        assert!(store.put("", b"x", "application/pdf").is_err());
    }

    #[test]
    fn test_compression() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path().join("blobs")).unwrap();

        // Create content that compresses well
        let data = "%PDF-1.4 stream ".repeat(1000);

        store.put("o1/big.pdf", data.as_bytes(), "application/pdf").unwrap();

        let path = store.blob_path("o1/big.pdf").unwrap();
        let compressed_size = fs::metadata(&path).unwrap().len();

        assert!(
            compressed_size < data.len() as u64,
            "Compressed size {} should be less than original {}",
            compressed_size,
            data.len()
        );
        assert_eq!(store.read_path("o1/big.pdf").unwrap().unwrap(), data.as_bytes());
    }
}
