//! Attachment fetcher and link downloader
//!
//! Every failure here is unit-level: it is logged and reported as `None` so
//! the caller moves on to the next source.

use anyhow::{Context, Result, bail};
use log::warn;
use std::net::{IpAddr, ToSocketAddrs};
use ureq::ResponseExt;
use url::{Host, Url};

use super::parse::decode_base64url;
use crate::gmail::MailProvider;
use crate::models::{ContentRef, MessageId};

/// Bodies above this size are not downloaded
const MAX_DOWNLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// A file downloaded from a body link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub bytes: Vec<u8>,
    /// Declared `Content-Type`, parameters stripped
    pub content_type: Option<String>,
}

/// Fetches arbitrary URLs (invoice links and stored blobs served over HTTP)
pub trait Downloader: Send + Sync {
    fn download(&self, url: &Url) -> Result<DownloadedFile>;
}

/// Whether `ip` is routable on the public internet
///
/// Loopback, private, link-local, unspecified and other reserved ranges
/// are not. IPv4-mapped IPv6 addresses are judged as IPv4.
pub fn is_public_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            // 100.64.0.0/10 carrier-grade NAT
            let shared = a == 100 && (b & 0xc0) == 64;
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || shared
                || a == 0)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public_address(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// Resolve the URL's host and refuse it unless every address is public
fn ensure_public_host(url: &Url) -> Result<()> {
    let addrs: Vec<IpAddr> = match url.host() {
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(80);
            (domain, port)
                .to_socket_addrs()
                .with_context(|| format!("Cannot resolve {}", domain))?
                .map(|addr| addr.ip())
                .collect()
        }
        None => bail!("URL {} has no host", url),
    };

    if addrs.is_empty() {
        bail!("No addresses for {}", url);
    }
    if let Some(ip) = addrs.into_iter().find(|ip| !is_public_address(*ip)) {
        bail!("Refusing to download {}: {} is not a public address", url, ip);
    }
    Ok(())
}

/// ureq-backed downloader
///
/// Only public hosts are contacted. Body links come from untrusted mail.
pub struct HttpDownloader {
    agent: ureq::Agent,
    max_bytes: u64,
}

impl HttpDownloader {
    pub fn new(agent: ureq::Agent) -> Self {
        Self {
            agent,
            max_bytes: MAX_DOWNLOAD_BYTES,
        }
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &Url) -> Result<DownloadedFile> {
        if !matches!(url.scheme(), "http" | "https") {
            bail!("Refusing to download {} URL", url.scheme());
        }
        ensure_public_host(url)?;

        let mut response = self
            .agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("Failed to download {}", url))?;

        // A redirect may have landed on an internal host; drop its body
        let final_url = Url::parse(&response.get_uri().to_string())
            .with_context(|| format!("Invalid final URL for {}", url))?;
        if final_url != *url {
            ensure_public_host(&final_url)?;
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());

        let bytes = response
            .body_mut()
            .with_config()
            .limit(self.max_bytes)
            .read_to_vec()
            .with_context(|| format!("Failed to read body of {}", url))?;

        Ok(DownloadedFile {
            bytes,
            content_type,
        })
    }
}

/// Resolves attachment content references to bytes
pub struct AttachmentFetcher<'a> {
    provider: &'a dyn MailProvider,
    downloader: &'a dyn Downloader,
}

impl<'a> AttachmentFetcher<'a> {
    pub fn new(provider: &'a dyn MailProvider, downloader: &'a dyn Downloader) -> Self {
        Self {
            provider,
            downloader,
        }
    }

    /// Bytes of one attachment, or None (logged) on any failure
    pub fn fetch(
        &self,
        access_token: &str,
        message_id: &MessageId,
        content_ref: &ContentRef,
    ) -> Option<Vec<u8>> {
        let data = match content_ref {
            ContentRef::Inline(data) => data.clone(),
            ContentRef::Remote(attachment_id) => {
                match self
                    .provider
                    .get_attachment(access_token, message_id, attachment_id)
                {
                    Ok(response) => match response.data {
                        Some(data) => data,
                        None => {
                            warn!("Attachment {} of {} has no data", attachment_id, message_id);
                            return None;
                        }
                    },
                    Err(e) => {
                        warn!(
                            "Failed to fetch attachment {} of {}: {:#}",
                            attachment_id, message_id, e
                        );
                        return None;
                    }
                }
            }
        };

        let bytes = decode_base64url(&data);
        if bytes.is_none() {
            warn!("Attachment of {} is not valid base64", message_id);
        }
        bytes.filter(|b| !b.is_empty())
    }

    /// Download a body link, or None (logged) on any failure
    pub fn fetch_link(&self, url: &Url) -> Option<DownloadedFile> {
        match self.downloader.download(url) {
            Ok(file) if file.bytes.is_empty() => {
                warn!("Link {} returned an empty body", url);
                None
            }
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Failed to download link {}: {:#}", url, e);
                None
            }
        }
    }
}
