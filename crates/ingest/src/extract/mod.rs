//! Extraction service integration
//!
//! This module provides:
//! - The `ExtractionService` trait and its request/response types
//! - An HTTP client for a JSON extraction endpoint
//! - Normalization of raw output against the field allow-lists

mod client;
mod normalize;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use client::HttpExtractionClient;
pub use normalize::{
    apply_corrections, normalize_amount, normalize_business_type, normalize_category,
    normalize_currency, normalize_date, normalize_document_type, normalize_extraction,
};

/// What the extraction service should read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionSource {
    /// A URL the service can fetch itself
    Url { url: String },
    /// Standard base64 payload plus its media type
    Inline { data: String, media_type: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub source: ExtractionSource,
}

impl ExtractionRequest {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            source: ExtractionSource::Url { url: url.into() },
        }
    }

    pub fn inline(bytes: &[u8], media_type: impl Into<String>) -> Self {
        use base64::Engine;
        Self {
            source: ExtractionSource::Inline {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                media_type: media_type.into(),
            },
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.source, ExtractionSource::Inline { .. })
    }
}

/// Fields as the extraction service returned them, before normalization
///
/// Amounts may arrive as numbers or formatted strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawExtraction {
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<String>,
    pub document_number: Option<String>,
    pub document_date: Option<String>,
    pub due_date: Option<String>,
    pub currency: Option<String>,
    pub total_amount: Option<serde_json::Value>,
    pub vat_amount: Option<serde_json::Value>,
    pub amount_before_vat: Option<serde_json::Value>,
    pub category: Option<String>,
    pub business_type: Option<String>,
    pub document_type: Option<String>,
    /// Set by the service when it could not read the document
    pub error: Option<String>,
}

/// Turns a document image or PDF into structured invoice fields
pub trait ExtractionService: Send + Sync {
    /// # Errors
    /// Any error (transport, service-reported, unparsable output) is an
    /// extraction failure for the document.
    fn extract(&self, request: &ExtractionRequest) -> Result<RawExtraction>;
}
