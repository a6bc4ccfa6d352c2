//! Normalize raw extraction output against fixed allow-lists
//!
//! Anything that does not map onto an allowed value becomes None rather than
//! an error: a half-read invoice is still worth persisting.

use chrono::NaiveDate;
use log::debug;

use super::RawExtraction;
use crate::models::{BusinessType, Category, DocumentType, ExtractedFields};

/// Lowercase, fold separators to single spaces
fn canonical(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_lowercase().next().unwrap_or(c) } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Match canonical forms of the enum names first, then aliases
fn lookup<T: Copy>(
    value: &str,
    all: &[T],
    as_str: fn(&T) -> &'static str,
    aliases: &[(&str, T)],
) -> Option<T> {
    let key = canonical(value);
    if key.is_empty() {
        return None;
    }
    all.iter()
        .find(|v| canonical(as_str(*v)) == key)
        .copied()
        .or_else(|| aliases.iter().find(|(alias, _)| *alias == key).map(|(_, v)| *v))
}

pub fn normalize_document_type(value: &str) -> Option<DocumentType> {
    const ALIASES: &[(&str, DocumentType)] = &[
        ("invoice receipt", DocumentType::TaxInvoiceReceipt),
        ("tax invoice and receipt", DocumentType::TaxInvoiceReceipt),
        ("חשבונית מס קבלה", DocumentType::TaxInvoiceReceipt),
        ("חשבונית מס", DocumentType::TaxInvoice),
        ("vat invoice", DocumentType::TaxInvoice),
        ("קבלה", DocumentType::Receipt),
        ("pro forma invoice", DocumentType::ProformaInvoice),
        ("proforma", DocumentType::ProformaInvoice),
        ("חשבון עסקה", DocumentType::ProformaInvoice),
        ("credit invoice", DocumentType::CreditNote),
        ("חשבונית זיכוי", DocumentType::CreditNote),
    ];
    lookup(value, &DocumentType::ALL, DocumentType::as_str, ALIASES)
}

pub fn normalize_business_type(value: &str) -> Option<BusinessType> {
    const ALIASES: &[(&str, BusinessType)] = &[
        ("exempt dealer", BusinessType::VatExempt),
        ("עוסק פטור", BusinessType::VatExempt),
        ("licensed dealer", BusinessType::VatLiableIndividual),
        ("authorized dealer", BusinessType::VatLiableIndividual),
        ("עוסק מורשה", BusinessType::VatLiableIndividual),
        ("ltd", BusinessType::Company),
        ("corporation", BusinessType::Company),
        ("חברה", BusinessType::Company),
        ("non profit", BusinessType::Nonprofit),
        ("ngo", BusinessType::Nonprofit),
        ("עמותה", BusinessType::Nonprofit),
        ("public sector", BusinessType::Government),
        ("foreign company", BusinessType::Foreign),
    ];
    lookup(value, &BusinessType::ALL, BusinessType::as_str, ALIASES)
}

pub fn normalize_category(value: &str) -> Option<Category> {
    const ALIASES: &[(&str, Category)] = &[
        ("saas", Category::Software),
        ("subscriptions", Category::Software),
        ("phone", Category::Telecom),
        ("internet", Category::Telecom),
        ("electricity", Category::Utilities),
        ("water", Category::Utilities),
        ("food", Category::Meals),
        ("restaurants", Category::Meals),
        ("office", Category::OfficeSupplies),
        ("hardware", Category::Equipment),
        ("consulting", Category::ProfessionalServices),
        ("legal", Category::ProfessionalServices),
        ("accounting", Category::ProfessionalServices),
        ("advertising", Category::Marketing),
        ("fuel", Category::Vehicle),
        ("car", Category::Vehicle),
    ];
    lookup(value, &Category::ALL, Category::as_str, ALIASES)
}

/// Parse the date layouts invoices commonly use; day-first for slashes
pub fn normalize_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    // Timestamps: keep the calendar date
    let value = match value.split_once('T') {
        Some((date, _)) if date.len() == 10 => date,
        _ => value,
    };

    ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%d/%m/%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Numbers pass through; strings lose currency symbols and spacing
///
/// Either `.` or `,` may be the decimal separator. When both appear the last
/// one is decimal and the other groups thousands. A lone comma followed by
/// exactly three digits groups thousands. Text that reads neither way is
/// `None`.
pub fn normalize_amount(value: &serde_json::Value) -> Option<f64> {
    let amount = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => parse_amount_text(s)?,
        _ => return None,
    };
    amount.is_finite().then_some(amount)
}

fn parse_amount_text(text: &str) -> Option<f64> {
    let kept: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();

    let Some(pos) = kept.rfind(['.', ',']) else {
        return kept.parse().ok();
    };
    let last = if kept[pos..].starts_with('.') { '.' } else { ',' };
    let other = if last == '.' { ',' } else { '.' };
    let digits_after = kept.len() - pos - 1;
    let repeated = kept.matches(last).count() > 1;

    let decimal = if kept.contains(other) {
        if repeated {
            return None;
        }
        Some(last)
    } else if repeated || (last == ',' && digits_after == 3) {
        None
    } else if last == '.' || (1..=2).contains(&digits_after) {
        Some(last)
    } else {
        return None;
    };

    let (integer, fraction) = match decimal {
        Some(_) => (&kept[..pos], Some(&kept[pos + 1..])),
        None => (kept.as_str(), None),
    };
    let group = match decimal {
        Some('.') => ',',
        Some(_) => '.',
        None => last,
    };
    if !integer.split(group).skip(1).all(|g| g.len() == 3) {
        return None;
    }

    let integer: String = integer.chars().filter(|c| *c != group).collect();
    let normalized = match fraction {
        Some(fraction) => format!("{}.{}", integer, fraction),
        None => integer,
    };
    normalized.parse().ok()
}

/// ISO 4217 code, or a well-known symbol mapped to one
pub fn normalize_currency(value: &str) -> Option<String> {
    let value = value.trim();
    let code = match value {
        "₪" | "NIS" | "nis" | "ש\"ח" | "ש״ח" => "ILS",
        "$" | "US$" => "USD",
        "€" => "EUR",
        "£" => "GBP",
        other => other,
    };
    let code = code.to_ascii_uppercase();
    (code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())).then_some(code)
}

/// Deterministic fix-ups applied after normalization
///
/// A VAT-exempt business cannot issue a tax invoice, so the classification
/// is rewritten to the VAT-liable individual type.
pub fn apply_corrections(fields: &mut ExtractedFields) {
    if let Some(doc_type) = fields.document_type
        && doc_type.requires_vat_registration()
        && fields.business_type == Some(BusinessType::VatExempt)
    {
        debug!(
            "Correcting business type: {} cannot be issued by a VAT-exempt business",
            doc_type.as_str()
        );
        fields.business_type = Some(BusinessType::VatLiableIndividual);
    }
}

/// Map raw extraction output onto `ExtractedFields`
pub fn normalize_extraction(raw: &RawExtraction) -> ExtractedFields {
    let mut fields = ExtractedFields {
        supplier_name: non_empty(&raw.supplier_name),
        supplier_tax_id: non_empty(&raw.supplier_tax_id),
        document_number: non_empty(&raw.document_number),
        document_date: raw.document_date.as_deref().and_then(normalize_date),
        due_date: raw.due_date.as_deref().and_then(normalize_date),
        currency: raw.currency.as_deref().and_then(normalize_currency),
        total_amount: raw.total_amount.as_ref().and_then(normalize_amount),
        vat_amount: raw.vat_amount.as_ref().and_then(normalize_amount),
        amount_before_vat: raw.amount_before_vat.as_ref().and_then(normalize_amount),
        category: raw.category.as_deref().and_then(normalize_category),
        business_type: raw.business_type.as_deref().and_then(normalize_business_type),
        document_type: raw.document_type.as_deref().and_then(normalize_document_type),
    };
    apply_corrections(&mut fields);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tax_invoice_from_vat_exempt_is_corrected() {
        let raw = RawExtraction {
            document_type: Some("tax invoice".to_string()),
            business_type: Some("VAT-exempt".to_string()),
            ..Default::default()
        };
        let fields = normalize_extraction(&raw);
        assert_eq!(fields.document_type, Some(DocumentType::TaxInvoice));
        assert_eq!(fields.business_type, Some(BusinessType::VatLiableIndividual));
    }

    #[test]
    fn test_receipt_from_vat_exempt_is_kept() {
        let raw = RawExtraction {
            document_type: Some("receipt".to_string()),
            business_type: Some("vat_exempt".to_string()),
            ..Default::default()
        };
        let fields = normalize_extraction(&raw);
        assert_eq!(fields.business_type, Some(BusinessType::VatExempt));
    }

    #[test]
    fn test_tax_invoice_receipt_correction() {
        let mut fields = ExtractedFields {
            document_type: Some(DocumentType::TaxInvoiceReceipt),
            business_type: Some(BusinessType::VatExempt),
            ..Default::default()
        };
        apply_corrections(&mut fields);
        assert_eq!(fields.business_type, Some(BusinessType::VatLiableIndividual));
    }

    #[test]
    fn test_enum_aliases() {
        assert_eq!(
            normalize_document_type("Tax Invoice / Receipt"),
            Some(DocumentType::TaxInvoiceReceipt)
        );
        assert_eq!(normalize_document_type("חשבונית מס"), Some(DocumentType::TaxInvoice));
        assert_eq!(normalize_business_type("עוסק פטור"), Some(BusinessType::VatExempt));
        assert_eq!(normalize_category("Office Supplies"), Some(Category::OfficeSupplies));
        assert_eq!(normalize_category("SaaS"), Some(Category::Software));
        assert_eq!(normalize_category("lottery"), None);
        assert_eq!(normalize_document_type(""), None);
    }

    #[test]
    fn test_normalize_dates() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5);
        assert_eq!(normalize_date("2024-03-05"), expected);
        assert_eq!(normalize_date("05/03/2024"), expected);
        assert_eq!(normalize_date("05.03.2024"), expected);
        assert_eq!(normalize_date("2024-03-05T10:00:00Z"), expected);
        assert_eq!(normalize_date("March 5th"), None);
    }

    #[test]
    fn test_normalize_amounts() {
        assert_eq!(normalize_amount(&json!(117.5)), Some(117.5));
        assert_eq!(normalize_amount(&json!("₪1,170.00")), Some(1170.0));
        assert_eq!(normalize_amount(&json!("-50")), Some(-50.0));
        assert_eq!(normalize_amount(&json!("n/a")), None);
        assert_eq!(normalize_amount(&json!(null)), None);
    }

    #[test]
    fn test_normalize_amount_decimal_comma() {
        assert_eq!(normalize_amount(&json!("12,50")), Some(12.5));
        assert_eq!(normalize_amount(&json!("1.234,56")), Some(1234.56));
        assert_eq!(normalize_amount(&json!("1,234.56")), Some(1234.56));
        assert_eq!(normalize_amount(&json!("€ 1.234.567,8")), Some(1234567.8));
        assert_eq!(normalize_amount(&json!("1,234")), Some(1234.0));
        assert_eq!(normalize_amount(&json!("1,234,567")), Some(1234567.0));
        assert_eq!(normalize_amount(&json!("0.125")), Some(0.125));
    }

    #[test]
    fn test_normalize_amount_ambiguous_is_none() {
        assert_eq!(normalize_amount(&json!("1,2345")), None);
        assert_eq!(normalize_amount(&json!("1,23,45")), None);
        assert_eq!(normalize_amount(&json!("1.2.3,45")), None);
        assert_eq!(normalize_amount(&json!("12,50,00.1")), None);
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency("₪").as_deref(), Some("ILS"));
        assert_eq!(normalize_currency("usd").as_deref(), Some("USD"));
        assert_eq!(normalize_currency("dollars"), None);
    }

    #[test]
    fn test_blank_strings_become_none() {
        let raw = RawExtraction {
            supplier_name: Some("   ".to_string()),
            document_number: Some(" INV-7 ".to_string()),
            ..Default::default()
        };
        let fields = normalize_extraction(&raw);
        assert_eq!(fields.supplier_name, None);
        assert_eq!(fields.document_number.as_deref(), Some("INV-7"));
    }
}
