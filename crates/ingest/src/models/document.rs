//! Document model: the persisted ingested invoice

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{DocumentId, MessageId, OwnerId};

/// Channel a document arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Manual,
    PublicLink,
    EmailAttachment,
    EmailLink,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Manual => "manual",
            Origin::PublicLink => "public_link",
            Origin::EmailAttachment => "email_attachment",
            Origin::EmailLink => "email_link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Origin::Manual),
            "public_link" => Some(Origin::PublicLink),
            "email_attachment" => Some(Origin::EmailAttachment),
            "email_link" => Some(Origin::EmailLink),
            _ => None,
        }
    }

    pub fn is_email(&self) -> bool {
        matches!(self, Origin::EmailAttachment | Origin::EmailLink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    New,
    PendingManualReview,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::New => "new",
            DocumentStatus::PendingManualReview => "pending_manual_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(DocumentStatus::New),
            "pending_manual_review" => Some(DocumentStatus::PendingManualReview),
            _ => None,
        }
    }
}

/// Preview rendering progress, guarded by conditional updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    #[default]
    None,
    Converting,
    Converted,
}

impl ConversionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionState::None => "none",
            ConversionState::Converting => "converting",
            ConversionState::Converted => "converted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ConversionState::None),
            "converting" => Some(ConversionState::Converting),
            "converted" => Some(ConversionState::Converted),
            _ => None,
        }
    }
}

/// Formal document kinds an issuer can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    TaxInvoice,
    TaxInvoiceReceipt,
    Receipt,
    ProformaInvoice,
    CreditNote,
    Other,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::TaxInvoice,
        DocumentType::TaxInvoiceReceipt,
        DocumentType::Receipt,
        DocumentType::ProformaInvoice,
        DocumentType::CreditNote,
        DocumentType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::TaxInvoice => "tax_invoice",
            DocumentType::TaxInvoiceReceipt => "tax_invoice_receipt",
            DocumentType::Receipt => "receipt",
            DocumentType::ProformaInvoice => "proforma_invoice",
            DocumentType::CreditNote => "credit_note",
            DocumentType::Other => "other",
        }
    }

    /// Document types only a VAT-registered business may issue
    pub fn requires_vat_registration(&self) -> bool {
        matches!(self, DocumentType::TaxInvoice | DocumentType::TaxInvoiceReceipt)
    }
}

/// Business classification of the issuer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessType {
    VatExempt,
    VatLiableIndividual,
    Company,
    Nonprofit,
    Government,
    Foreign,
}

impl BusinessType {
    pub const ALL: [BusinessType; 6] = [
        BusinessType::VatExempt,
        BusinessType::VatLiableIndividual,
        BusinessType::Company,
        BusinessType::Nonprofit,
        BusinessType::Government,
        BusinessType::Foreign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessType::VatExempt => "vat_exempt",
            BusinessType::VatLiableIndividual => "vat_liable_individual",
            BusinessType::Company => "company",
            BusinessType::Nonprofit => "nonprofit",
            BusinessType::Government => "government",
            BusinessType::Foreign => "foreign",
        }
    }
}

/// Expense category allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Software,
    Telecom,
    Utilities,
    Rent,
    Travel,
    Meals,
    OfficeSupplies,
    Equipment,
    ProfessionalServices,
    Marketing,
    Insurance,
    Vehicle,
    Other,
}

impl Category {
    pub const ALL: [Category; 13] = [
        Category::Software,
        Category::Telecom,
        Category::Utilities,
        Category::Rent,
        Category::Travel,
        Category::Meals,
        Category::OfficeSupplies,
        Category::Equipment,
        Category::ProfessionalServices,
        Category::Marketing,
        Category::Insurance,
        Category::Vehicle,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Software => "software",
            Category::Telecom => "telecom",
            Category::Utilities => "utilities",
            Category::Rent => "rent",
            Category::Travel => "travel",
            Category::Meals => "meals",
            Category::OfficeSupplies => "office_supplies",
            Category::Equipment => "equipment",
            Category::ProfessionalServices => "professional_services",
            Category::Marketing => "marketing",
            Category::Insurance => "insurance",
            Category::Vehicle => "vehicle",
            Category::Other => "other",
        }
    }
}

/// Normalized fields produced by extraction
///
/// All fields are optional: a failed extraction leaves everything null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub supplier_name: Option<String>,
    pub supplier_tax_id: Option<String>,
    pub document_number: Option<String>,
    pub document_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub total_amount: Option<f64>,
    pub vat_amount: Option<f64>,
    pub amount_before_vat: Option<f64>,
    pub category: Option<Category>,
    pub business_type: Option<BusinessType>,
    pub document_type: Option<DocumentType>,
}

impl ExtractedFields {
    /// Whether every monetary field is null
    pub fn financials_empty(&self) -> bool {
        self.total_amount.is_none() && self.vat_amount.is_none() && self.amount_before_vat.is_none()
    }
}

/// A persisted ingested invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Database primary key (0 until inserted)
    pub id: DocumentId,
    pub owner_id: OwnerId,
    pub origin: Origin,
    pub primary_asset_url: String,
    /// Declared media type of the primary asset, when known
    pub primary_media_type: Option<String>,
    pub preview_url: Option<String>,
    pub page_urls: Vec<String>,
    pub fields: ExtractedFields,
    pub status: DocumentStatus,
    pub conversion_state: ConversionState,
    /// Provider message this document was ingested from (idempotency key)
    pub source_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a document with its asset and status set together
    pub fn new(
        owner_id: OwnerId,
        origin: Origin,
        primary_asset_url: impl Into<String>,
        status: DocumentStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId(0),
            owner_id,
            origin,
            primary_asset_url: primary_asset_url.into(),
            primary_media_type: None,
            preview_url: None,
            page_urls: Vec::new(),
            fields: ExtractedFields::default(),
            status,
            conversion_state: ConversionState::None,
            source_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_fields(mut self, fields: ExtractedFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_media_type(mut self, mime: impl Into<String>) -> Self {
        self.primary_media_type = Some(mime.into());
        self
    }

    pub fn with_source_message(mut self, message_id: MessageId) -> Self {
        self.source_message_id = Some(message_id);
        self
    }

    /// Whether the primary asset is a PDF (declared type, else URL extension)
    pub fn has_pdf_asset(&self) -> bool {
        match &self.primary_media_type {
            Some(mime) => mime.eq_ignore_ascii_case("application/pdf"),
            None => {
                let path = self
                    .primary_asset_url
                    .split(['?', '#'])
                    .next()
                    .unwrap_or_default();
                path.to_ascii_lowercase().ends_with(".pdf")
            }
        }
    }

    /// Whether the background normalizer should render previews for it
    pub fn needs_preview(&self) -> bool {
        self.origin.is_email()
            && self.has_pdf_asset()
            && self.preview_url.is_none()
            && self.conversion_state == ConversionState::None
    }

    /// Unclaimed, or claimed before `stale_before` and never finished
    ///
    /// While `Converting`, `updated_at` is the claim time.
    pub fn conversion_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.conversion_state {
            ConversionState::None => true,
            ConversionState::Converting => self.updated_at < stale_before,
            ConversionState::Converted => false,
        }
    }

    /// `needs_preview`, also accepting an abandoned claim
    pub fn preview_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        self.origin.is_email()
            && self.has_pdf_asset()
            && self.preview_url.is_none()
            && self.conversion_claimable(stale_before)
    }
}
