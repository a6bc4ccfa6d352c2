//! Configuration loading for the ingestion engine
//!
//! OAuth credentials are loaded from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Engine tuning lives in `ingest.json` in the config directory. Every field
//! has a default, so the file is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Credentials filename in the config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Engine settings filename in the config directory
const ENGINE_FILE: &str = "ingest.json";

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/invoice-ingest/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Tunables for locating, processing and normalizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Literals OR-ed into the full-search query
    pub search_keywords: Vec<String>,
    /// Sender fragments OR-ed with `has:attachment`
    pub sender_hints: Vec<String>,
    /// Substrings a body link must contain to be ingested
    pub link_hints: Vec<String>,
    /// Maximum ids a locator call returns
    pub locate_cap: usize,
    /// Maximum candidates processed per run
    pub process_cap: usize,
    /// Lower bound for the first full search of a connection
    pub initial_search_days: i64,
    /// Window used when the history cursor has expired
    pub fallback_search_days: i64,
    /// How long a sync lease is valid before it may be taken over
    pub lease_ttl_secs: i64,
    /// Refresh tokens this many seconds before they lapse
    pub token_refresh_skew_secs: i64,
    /// Global timeout for every outbound HTTP call
    pub http_timeout_secs: u64,
    pub normalizer_interval_secs: u64,
    pub normalizer_batch: usize,
    pub poll_interval_secs: u64,
    pub extraction_url: Option<String>,
    pub extraction_api_key: Option<String>,
    pub database_path: Option<PathBuf>,
    pub blob_root: Option<PathBuf>,
    /// Public base URL blobs are served from; None keeps `file://` URLs
    pub blob_base_url: Option<String>,
    pub bind_address: String,
    /// Pub/Sub topic used for watch registration
    pub push_topic: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_keywords: [
                "invoice",
                "receipt",
                "tax invoice",
                "bill",
                "payment confirmation",
                "חשבונית",
                "קבלה",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            sender_hints: ["billing", "invoice", "receipts", "noreply", "accounts"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            link_hints: [
                "invoice",
                "receipt",
                "bill",
                "download",
                "document",
                "pdf",
                "greeninvoice",
                "icount",
                "ezcount",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            locate_cap: 200,
            process_cap: 50,
            initial_search_days: 30,
            fallback_search_days: 1,
            lease_ttl_secs: 15 * 60,
            token_refresh_skew_secs: 300,
            http_timeout_secs: 30,
            normalizer_interval_secs: 60,
            normalizer_batch: 5,
            poll_interval_secs: 300,
            extraction_url: None,
            extraction_api_key: None,
            database_path: None,
            blob_root: None,
            blob_base_url: None,
            bind_address: "127.0.0.1:8088".to_string(),
            push_topic: None,
        }
    }
}

impl EngineConfig {
    /// Load `ingest.json` from the config directory, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut cfg: EngineConfig = config::load_json_or_default(ENGINE_FILE)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Parse settings from a JSON string (missing fields take defaults)
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine config JSON")
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("INGEST_DATABASE") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(bind) = std::env::var("INGEST_BIND") {
            self.bind_address = bind;
        }
        if let Ok(url) = std::env::var("EXTRACTION_URL") {
            self.extraction_url = Some(url);
        }
        if let Ok(key) = std::env::var("EXTRACTION_API_KEY") {
            self.extraction_api_key = Some(key);
        }
    }

    /// Database path, defaulting into the config directory
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| config::config_path("ingest.sqlite"))
    }

    /// Blob root, defaulting into the config directory
    pub fn blob_root(&self) -> Option<PathBuf> {
        self.blob_root.clone().or_else(|| config::config_path("blobs"))
    }

    /// Shared HTTP agent with the configured global timeout
    pub fn http_agent(&self) -> ureq::Agent {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(std::time::Duration::from_secs(self.http_timeout_secs)))
            .build();
        config.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_credentials_json() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_engine_config_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.locate_cap, 200);
        assert_eq!(cfg.normalizer_batch, 5);
        assert_eq!(cfg.normalizer_interval_secs, 60);
        assert_eq!(cfg.fallback_search_days, 1);
        assert!(cfg.search_keywords.iter().any(|k| k == "invoice"));
    }

    #[test]
    fn test_engine_config_partial_json() {
        let cfg = EngineConfig::from_json(r#"{ "process_cap": 10, "search_keywords": ["bill"] }"#)
            .unwrap();
        assert_eq!(cfg.process_cap, 10);
        assert_eq!(cfg.search_keywords, vec!["bill".to_string()]);
        assert_eq!(cfg.locate_cap, 200);
    }
}
