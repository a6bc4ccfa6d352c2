//! HTTP client for a JSON extraction endpoint

use anyhow::{Context, Result, bail};
use log::debug;

use super::{ExtractionRequest, ExtractionService, RawExtraction};

/// Posts `ExtractionRequest` JSON and reads `RawExtraction` JSON back
pub struct HttpExtractionClient {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExtractionClient {
    pub fn new(agent: ureq::Agent, endpoint: impl Into<String>) -> Self {
        Self {
            agent,
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

impl ExtractionService for HttpExtractionClient {
    fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction> {
        debug!(
            "Requesting extraction ({})",
            if request.is_inline() { "inline" } else { "url" }
        );

        let mut call = self.agent.post(&self.endpoint);
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", &format!("Bearer {}", key));
        }

        let mut response = call
            .send_json(request)
            .context("Failed to send extraction request")?;

        let raw: RawExtraction = response
            .body_mut()
            .read_json()
            .context("Failed to parse extraction response")?;

        if let Some(error) = &raw.error {
            bail!("Extraction service reported: {}", error);
        }

        Ok(raw)
    }
}
