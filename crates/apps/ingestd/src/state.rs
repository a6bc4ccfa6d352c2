//! Shared daemon state: every engine component, built once at startup

use anyhow::{Context, Result};
use ingest::sync::{Downloader, HttpDownloader};
use ingest::{
    BlobStore, ConsentStates, EngineConfig, FileBlobStore, GmailClient, GmailCredentials, GoogleTokenEndpoint,
    HttpExtractionClient, IngestStore, NormalizerSession, OwnerId, PdftoppmRenderer,
    PreviewNormalizer, SqliteIngestStore, SyncContext,
};
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type AppState = Arc<Services>;

pub struct Services {
    pub config: EngineConfig,
    pub credentials: GmailCredentials,
    pub store: Arc<dyn IngestStore>,
    pub blob_files: Arc<FileBlobStore>,
    pub provider: GmailClient,
    pub tokens: GoogleTokenEndpoint,
    pub extraction: HttpExtractionClient,
    pub downloader: Arc<HttpDownloader>,
    pub normalizer: Arc<PreviewNormalizer>,
    pub sessions: Mutex<HashMap<OwnerId, NormalizerSession>>,
    /// OAuth `state` values handed out by `/oauth/start`
    pub consents: ConsentStates,
}

impl Services {
    pub fn build(config: EngineConfig, credentials: GmailCredentials) -> Result<Self> {
        let agent = config.http_agent();

        let db_path = config
            .database_path()
            .context("Could not determine database path")?;
        let store: Arc<dyn IngestStore> = Arc::new(SqliteIngestStore::new(&db_path)?);
        info!("Database: {}", db_path.display());

        let blob_root = config.blob_root().context("Could not determine blob root")?;
        let mut blob_files = FileBlobStore::new(&blob_root)?;
        if let Some(base_url) = &config.blob_base_url {
            blob_files = blob_files.with_base_url(base_url);
        }
        let blob_files = Arc::new(blob_files);
        info!("Blobs: {}", blob_root.display());

        let endpoint = config
            .extraction_url
            .clone()
            .context("extraction_url is not configured (set EXTRACTION_URL)")?;
        let mut extraction = HttpExtractionClient::new(agent.clone(), endpoint);
        if let Some(key) = &config.extraction_api_key {
            extraction = extraction.with_api_key(key);
        }

        let downloader = Arc::new(HttpDownloader::new(agent.clone()));
        let blobs: Arc<dyn BlobStore> = blob_files.clone();
        let normalizer = PreviewNormalizer::new(
            store.clone(),
            blobs,
            Arc::new(PdftoppmRenderer::new()),
            downloader.clone() as Arc<dyn Downloader>,
        )
        .with_interval(config.normalizer_interval_secs)
        .with_batch(config.normalizer_batch);

        Ok(Self {
            provider: GmailClient::new(agent.clone()),
            tokens: GoogleTokenEndpoint::new(agent, &credentials),
            config,
            credentials,
            store,
            blob_files,
            extraction,
            downloader,
            normalizer: Arc::new(normalizer),
            sessions: Mutex::new(HashMap::new()),
            consents: ConsentStates::default(),
        })
    }

    pub fn sync_context(&self) -> SyncContext<'_> {
        SyncContext {
            config: &self.config,
            provider: &self.provider,
            tokens: &self.tokens,
            store: &*self.store,
            blobs: &*self.blob_files,
            extraction: &self.extraction,
            downloader: &*self.downloader,
        }
    }

    /// Start the owner's normalizer session unless one is running
    pub fn start_session(&self, owner_id: OwnerId) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&owner_id) {
            return false;
        }
        let session = NormalizerSession::start(self.normalizer.clone(), owner_id.clone());
        sessions.insert(owner_id, session);
        true
    }

    /// Stop the owner's session; dropping it joins the thread
    pub fn end_session(&self, owner_id: &OwnerId) -> bool {
        let session = self.sessions.lock().unwrap().remove(owner_id);
        session.is_some()
    }

    pub fn oauth_redirect_uri(&self) -> String {
        format!("http://{}/oauth/callback", self.config.bind_address)
    }
}
