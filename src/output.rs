//! Output types: line items, per-page extractions, run statistics, and the
//! HTTP response envelope.
//!
//! Wire names follow the established bill-extraction contract: items carry
//! `item_name` / `item_code` / `item_quantity` / `item_rate` / `item_amount`,
//! pages carry a *string* `page_no`, and the envelope is
//! `{is_success, token_usage, data: {pagewise_line_items, total_item_count}}`.
//! Keeping the serde renames here, in one place, means the internal Rust
//! names can stay descriptive without breaking existing consumers.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Round a monetary/quantity value to two decimal places.
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// A single billed line item extracted from a bill page.
///
/// All numeric fields are `None` when the value is not printed on the bill.
/// The extraction prompt forbids inferring missing values, so `None` means
/// "absent on the page", never "failed to compute".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Item description as printed (service name, drug name, procedure…).
    #[serde(rename = "item_name")]
    pub description: Option<String>,

    /// Billing/tariff code printed alongside the item, if any.
    #[serde(rename = "item_code", default)]
    pub code: Option<String>,

    /// Billed quantity.
    #[serde(rename = "item_quantity")]
    pub quantity: Option<f64>,

    /// Unit rate.
    #[serde(rename = "item_rate")]
    pub rate: Option<f64>,

    /// Line amount (usually quantity × rate, but copied as printed).
    #[serde(rename = "item_amount")]
    pub amount: Option<f64>,
}

impl LineItem {
    /// True when the item carries neither a description nor an amount.
    /// Such rows are noise (stray table borders, empty cells) and are dropped
    /// during flattening.
    pub fn is_empty(&self) -> bool {
        self.description.as_deref().map_or(true, |d| d.trim().is_empty()) && self.amount.is_none()
    }

    /// Deduplication key: lowercased trimmed description + amount in cents.
    pub(crate) fn dedup_key(&self) -> (String, Option<i64>) {
        let name = self
            .description
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let cents = self.amount.map(|a| (a * 100.0).round() as i64);
        (name, cents)
    }
}

/// Classification of a bill page.
///
/// Serialises to the human-readable labels used on the wire
/// (`"Bill Detail"`, `"Pharmacy"`, `"Final Bill"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageType {
    /// Itemised charges (default).
    #[default]
    #[serde(rename = "Bill Detail")]
    BillDetail,
    /// Pharmacy/medication charges.
    #[serde(rename = "Pharmacy")]
    Pharmacy,
    /// Summary page carrying the grand total / amount payable.
    #[serde(rename = "Final Bill")]
    FinalBill,
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PageType::BillDetail => "Bill Detail",
            PageType::Pharmacy => "Pharmacy",
            PageType::FinalBill => "Final Bill",
        };
        f.write_str(s)
    }
}

impl PageType {
    /// Parse a model-supplied label, tolerating case differences.
    /// Unknown labels return `None`; the keyword classifier decides instead.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "bill detail" | "bill_detail" => Some(PageType::BillDetail),
            "pharmacy" => Some(PageType::Pharmacy),
            "final bill" | "final_bill" => Some(PageType::FinalBill),
            _ => None,
        }
    }
}

/// Result of extracting a single page.
///
/// Always produced, even on failure — check [`PageExtraction::error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageExtraction {
    /// 1-indexed page number.
    pub page_num: usize,

    /// Page classification.
    pub page_type: PageType,

    /// Line items extracted from this page (post-repair, pre-dedup).
    pub items: Vec<LineItem>,

    /// Labelled totals found on the page (label → amount). Totals are kept
    /// apart from line items so downstream sums are not double-counted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detected_totals: BTreeMap<String, f64>,

    /// Prompt tokens consumed by the VLM call.
    pub input_tokens: u64,

    /// Completion tokens produced by the VLM call.
    pub output_tokens: u64,

    /// Wall-clock duration of the page, including retries.
    pub duration_ms: u64,

    /// Retries needed before the call succeeded (0 = first attempt).
    pub retries: u8,

    /// True when the raw model output failed to parse and the repair rules
    /// had to run before the payload became valid JSON.
    pub repaired: bool,

    /// Error if the page failed after all retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

/// Statistics for an extraction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the document.
    pub total_pages: usize,
    /// Pages that produced a usable payload.
    pub processed_pages: usize,
    /// Pages that failed after all retries.
    pub failed_pages: usize,
    /// Pages whose payload needed JSON repair before parsing.
    pub repaired_pages: usize,
    /// Total prompt tokens across all pages.
    pub total_input_tokens: u64,
    /// Total completion tokens across all pages.
    pub total_output_tokens: u64,
    /// End-to-end wall-clock duration.
    pub total_duration_ms: u64,
    /// Time spent rasterising pages.
    pub render_duration_ms: u64,
    /// Time spent in VLM calls (including retries and backoff).
    pub model_duration_ms: u64,
}

/// Token usage in the wire envelope's shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Complete result of a bill extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// Per-page extractions, sorted by page number.
    pub pages: Vec<PageExtraction>,

    /// Flattened, deduplicated line items across all pages, in reading order.
    pub items: Vec<LineItem>,

    /// Run statistics.
    pub stats: ExtractionStats,
}

impl ExtractionOutput {
    /// Token usage summed over all pages.
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            total_tokens: self.stats.total_input_tokens + self.stats.total_output_tokens,
            input_tokens: self.stats.total_input_tokens,
            output_tokens: self.stats.total_output_tokens,
        }
    }
}

// ── Wire envelope ────────────────────────────────────────────────────────

/// One page in the envelope's `pagewise_line_items` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagewiseItems {
    /// 1-based page number, as a string per the wire contract.
    pub page_no: String,
    pub page_type: PageType,
    pub bill_items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detected_totals: BTreeMap<String, f64>,
}

/// `data` object of the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractData {
    pub pagewise_line_items: Vec<PagewiseItems>,
    pub total_item_count: usize,
}

/// Response envelope for `POST /extract-bill-data` (and `medbill extract --json`).
///
/// Failures are reported in-band: `is_success: false` plus an `error` string,
/// with an empty `data` object, matching the established contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub is_success: bool,
    pub token_usage: TokenUsage,
    pub data: ExtractData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractResponse {
    /// Build a success envelope from an extraction output.
    ///
    /// Failed pages are omitted from `pagewise_line_items` (their items are
    /// unknown); `total_item_count` counts the flat deduplicated list.
    /// A missing item description serialises as `""`, never `null`.
    pub fn success(output: &ExtractionOutput) -> Self {
        let pagewise = output
            .pages
            .iter()
            .filter(|p| p.error.is_none())
            .map(|p| PagewiseItems {
                page_no: p.page_num.to_string(),
                page_type: p.page_type,
                bill_items: p
                    .items
                    .iter()
                    .map(|it| LineItem {
                        description: Some(it.description.clone().unwrap_or_default()),
                        ..it.clone()
                    })
                    .collect(),
                detected_totals: p.detected_totals.clone(),
            })
            .collect();

        ExtractResponse {
            is_success: true,
            token_usage: output.token_usage(),
            data: ExtractData {
                pagewise_line_items: pagewise,
                total_item_count: output.items.len(),
            },
            error: None,
        }
    }

    /// Build a failure envelope carrying the error message.
    pub fn failure(error: impl fmt::Display) -> Self {
        ExtractResponse {
            is_success: false,
            token_usage: TokenUsage::default(),
            data: ExtractData {
                pagewise_line_items: Vec::new(),
                total_item_count: 0,
            },
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: Option<&str>, amount: Option<f64>) -> LineItem {
        LineItem {
            description: name.map(String::from),
            code: None,
            quantity: None,
            rate: None,
            amount,
        }
    }

    #[test]
    fn line_item_wire_names() {
        let it = LineItem {
            description: Some("CBC Test".into()),
            code: Some("LAB-101".into()),
            quantity: Some(2.0),
            rate: Some(150.0),
            amount: Some(300.0),
        };
        let json = serde_json::to_value(&it).unwrap();
        assert_eq!(json["item_name"], "CBC Test");
        assert_eq!(json["item_code"], "LAB-101");
        assert_eq!(json["item_quantity"], 2.0);
        assert_eq!(json["item_rate"], 150.0);
        assert_eq!(json["item_amount"], 300.0);
    }

    #[test]
    fn line_item_missing_code_deserialises() {
        let it: LineItem = serde_json::from_str(
            r#"{"item_name":"X-Ray","item_quantity":null,"item_rate":null,"item_amount":450.0}"#,
        )
        .unwrap();
        assert_eq!(it.code, None);
        assert_eq!(it.amount, Some(450.0));
    }

    #[test]
    fn page_type_wire_labels() {
        assert_eq!(
            serde_json::to_string(&PageType::BillDetail).unwrap(),
            "\"Bill Detail\""
        );
        assert_eq!(
            serde_json::to_string(&PageType::FinalBill).unwrap(),
            "\"Final Bill\""
        );
    }

    #[test]
    fn page_type_parse_tolerates_case() {
        assert_eq!(PageType::parse("pharmacy"), Some(PageType::Pharmacy));
        assert_eq!(PageType::parse("FINAL BILL"), Some(PageType::FinalBill));
        assert_eq!(PageType::parse("cover letter"), None);
    }

    #[test]
    fn dedup_key_normalises_case_and_cents() {
        let a = item(Some("  Paracetamol "), Some(12.5));
        let b = item(Some("paracetamol"), Some(12.504));
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn empty_item_detection() {
        assert!(item(None, None).is_empty());
        assert!(item(Some("   "), None).is_empty());
        assert!(!item(Some("Bed charges"), None).is_empty());
        assert!(!item(None, Some(100.0)).is_empty());
    }

    #[test]
    fn envelope_success_shape() {
        let output = ExtractionOutput {
            pages: vec![PageExtraction {
                page_num: 1,
                page_type: PageType::BillDetail,
                items: vec![item(None, Some(10.0))],
                detected_totals: BTreeMap::new(),
                input_tokens: 100,
                output_tokens: 50,
                duration_ms: 1200,
                retries: 0,
                repaired: false,
                error: None,
            }],
            items: vec![item(None, Some(10.0))],
            stats: ExtractionStats {
                total_pages: 1,
                processed_pages: 1,
                total_input_tokens: 100,
                total_output_tokens: 50,
                ..Default::default()
            },
        };

        let resp = ExtractResponse::success(&output);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["is_success"], true);
        assert_eq!(json["token_usage"]["total_tokens"], 150);
        assert_eq!(json["data"]["total_item_count"], 1);
        assert_eq!(json["data"]["pagewise_line_items"][0]["page_no"], "1");
        // Missing description serialises as "" in the envelope.
        assert_eq!(
            json["data"]["pagewise_line_items"][0]["bill_items"][0]["item_name"],
            ""
        );
    }

    #[test]
    fn envelope_failure_shape() {
        let resp = ExtractResponse::failure("boom");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["is_success"], false);
        assert_eq!(json["data"]["total_item_count"], 0);
        assert_eq!(json["error"], "boom");
        assert_eq!(json["token_usage"]["total_tokens"], 0);
    }

    #[test]
    fn failed_pages_excluded_from_envelope() {
        let output = ExtractionOutput {
            pages: vec![PageExtraction {
                page_num: 2,
                page_type: PageType::BillDetail,
                items: vec![],
                detected_totals: BTreeMap::new(),
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: 0,
                retries: 3,
                repaired: false,
                error: Some(crate::error::PageError::Timeout { page: 2, secs: 60 }),
            }],
            items: vec![],
            stats: ExtractionStats::default(),
        };
        let resp = ExtractResponse::success(&output);
        assert!(resp.data.pagewise_line_items.is_empty());
    }

    #[test]
    fn round2_behaviour() {
        assert_eq!(round2(12.504), 12.5);
        assert_eq!(round2(12.346), 12.35);
        assert_eq!(round2(-3.14159), -3.14);
    }
}
