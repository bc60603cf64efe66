//! Bill flattening: merge grouped payloads into clean per-page item lists,
//! separate labelled totals, classify pages, and deduplicate across the
//! document.
//!
//! Models handle split tables and multi-column layouts inconsistently — the
//! same bill can come back as one list, several sections, or with its grand
//! total embedded as a line item. The rules here normalise all of that into
//! one shape: line items are billed rows only, totals live in their own map,
//! and the document-level list is deduplicated so a row repeated by a page
//! overlap or a re-read column appears exactly once.

use crate::output::{LineItem, PageType};
use crate::pipeline::repair::PagePayload;
use std::collections::{BTreeMap, HashSet};

/// Labels that mark a row as a total rather than a billed item.
const TOTAL_KEYWORDS: &[&str] = &[
    "grand total",
    "amount payable",
    "net amount",
    "balance due",
    "invoice total",
    "total amount",
    "subtotal",
    "total",
];

/// Totals labels that mark a page as the final/summary bill.
const FINAL_BILL_KEYWORDS: &[&str] = &["final amount", "total amount", "grand total"];

/// Result of flattening one page's payload.
#[derive(Debug, Clone)]
pub struct FlatPage {
    pub page_type: PageType,
    pub items: Vec<LineItem>,
    pub totals: BTreeMap<String, f64>,
}

/// Flatten a parsed page payload: merge item groups in reading order, drop
/// empty rows, move total rows into the totals map, and classify the page.
pub fn flatten_page(payload: &PagePayload) -> FlatPage {
    let mut items: Vec<LineItem> = Vec::new();
    let mut totals = payload.totals.clone();

    for group in &payload.item_groups {
        for item in group {
            if item.is_empty() {
                continue;
            }
            if let Some(label) = total_label(item) {
                // Keep the first amount seen for a repeated label.
                if let Some(amount) = item.amount {
                    totals.entry(label).or_insert(amount);
                }
                continue;
            }
            items.push(item.clone());
        }
    }

    let page_type = classify(payload.page_type.as_deref(), &items, &totals);

    FlatPage {
        page_type,
        items,
        totals,
    }
}

/// Deduplicate line items across the whole document, preserving first-seen
/// order. Key: lowercased trimmed description + amount in cents — the same
/// row re-read from an overlapping render or a duplicated column collapses,
/// while two genuinely distinct charges with the same name but different
/// amounts both survive.
pub fn dedup_items<'a, I>(pages: I) -> Vec<LineItem>
where
    I: IntoIterator<Item = &'a [LineItem]>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for page_items in pages {
        for item in page_items {
            if seen.insert(item.dedup_key()) {
                out.push(item.clone());
            }
        }
    }
    out
}

/// Decide whether an item row is really a labelled total.
///
/// A total row carries an amount but no quantity or rate; the qty/rate guard
/// keeps genuine items like "Total Knee Replacement" out of the totals map.
fn total_label(item: &LineItem) -> Option<String> {
    if item.quantity.is_some() || item.rate.is_some() {
        return None;
    }
    let desc = item.description.as_deref()?.trim();
    let lowered = desc.to_lowercase();
    if TOTAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        Some(desc.to_string())
    } else {
        None
    }
}

/// Classify the page.
///
/// A model-supplied label is honoured when it names a known type; otherwise
/// keyword heuristics decide: pharmacy mentions win, then final-bill totals
/// labels, then the default.
fn classify(
    model_label: Option<&str>,
    items: &[LineItem],
    totals: &BTreeMap<String, f64>,
) -> PageType {
    if let Some(page_type) = model_label.and_then(PageType::parse) {
        return page_type;
    }

    let mentions_pharmacy = items.iter().any(|it| {
        it.description
            .as_deref()
            .is_some_and(|d| d.to_lowercase().contains("pharmacy"))
    });
    if mentions_pharmacy {
        return PageType::Pharmacy;
    }

    let has_final_total = totals.keys().any(|label| {
        let lowered = label.to_lowercase();
        FINAL_BILL_KEYWORDS.iter().any(|k| lowered.contains(k))
    });
    if has_final_total {
        return PageType::FinalBill;
    }

    PageType::BillDetail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, amount: Option<f64>) -> LineItem {
        LineItem {
            description: Some(name.to_string()),
            code: None,
            quantity: None,
            rate: None,
            amount,
        }
    }

    fn payload(groups: Vec<Vec<LineItem>>) -> PagePayload {
        PagePayload {
            page_type: None,
            item_groups: groups,
            totals: BTreeMap::new(),
        }
    }

    #[test]
    fn groups_merge_in_reading_order() {
        let p = payload(vec![
            vec![item("Left 1", Some(1.0)), item("Left 2", Some(2.0))],
            vec![item("Right 1", Some(3.0))],
        ]);
        let flat = flatten_page(&p);
        let names: Vec<_> = flat
            .items
            .iter()
            .map(|i| i.description.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["Left 1", "Left 2", "Right 1"]);
    }

    #[test]
    fn empty_rows_dropped() {
        let p = payload(vec![vec![
            item("Real", Some(10.0)),
            LineItem {
                description: None,
                code: None,
                quantity: None,
                rate: None,
                amount: None,
            },
            LineItem {
                description: Some("  ".into()),
                code: None,
                quantity: None,
                rate: None,
                amount: None,
            },
        ]]);
        let flat = flatten_page(&p);
        assert_eq!(flat.items.len(), 1);
    }

    #[test]
    fn total_rows_move_to_totals() {
        let p = payload(vec![vec![
            item("Consultation", Some(500.0)),
            item("Grand Total", Some(500.0)),
        ]]);
        let flat = flatten_page(&p);
        assert_eq!(flat.items.len(), 1);
        assert_eq!(flat.totals.get("Grand Total"), Some(&500.0));
    }

    #[test]
    fn total_keyword_with_qty_stays_an_item() {
        // "Total Knee Replacement" is a procedure, not a summary row.
        let mut it = item("Total Knee Replacement", Some(185000.0));
        it.quantity = Some(1.0);
        let p = payload(vec![vec![it]]);
        let flat = flatten_page(&p);
        assert_eq!(flat.items.len(), 1);
        assert!(flat.totals.is_empty());
    }

    #[test]
    fn model_totals_survive_alongside_row_totals() {
        let mut p = payload(vec![vec![item("Net Amount", Some(900.0))]]);
        p.totals.insert("Amount Payable".into(), 900.0);
        let flat = flatten_page(&p);
        assert!(flat.items.is_empty());
        assert_eq!(flat.totals.len(), 2);
    }

    #[test]
    fn classify_honours_model_label() {
        let mut p = payload(vec![vec![item("Anything", Some(1.0))]]);
        p.page_type = Some("Pharmacy".into());
        assert_eq!(flatten_page(&p).page_type, PageType::Pharmacy);
    }

    #[test]
    fn classify_unknown_label_falls_back_to_keywords() {
        let mut p = payload(vec![vec![item("Pharmacy charges", Some(1.0))]]);
        p.page_type = Some("mystery".into());
        assert_eq!(flatten_page(&p).page_type, PageType::Pharmacy);
    }

    #[test]
    fn classify_final_bill_from_totals() {
        let p = payload(vec![vec![
            item("Room rent", Some(1000.0)),
            item("Total Amount", Some(1000.0)),
        ]]);
        assert_eq!(flatten_page(&p).page_type, PageType::FinalBill);
    }

    #[test]
    fn classify_defaults_to_bill_detail() {
        let p = payload(vec![vec![item("Dressing", Some(150.0))]]);
        assert_eq!(flatten_page(&p).page_type, PageType::BillDetail);
    }

    #[test]
    fn dedup_collapses_repeats_keeps_distinct_amounts() {
        let page1 = vec![item("Paracetamol", Some(12.5)), item("ECG", Some(300.0))];
        let page2 = vec![
            item("paracetamol ", Some(12.5)), // same row, different casing
            item("Paracetamol", Some(25.0)),  // second strip, different amount
        ];
        let flat = dedup_items([page1.as_slice(), page2.as_slice()]);
        assert_eq!(flat.len(), 3);
        assert_eq!(flat[0].amount, Some(12.5));
        assert_eq!(flat[2].amount, Some(25.0));
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let page1 = vec![item("B", Some(2.0)), item("A", Some(1.0))];
        let page2 = vec![item("A", Some(1.0)), item("C", Some(3.0))];
        let flat = dedup_items([page1.as_slice(), page2.as_slice()]);
        let names: Vec<_> = flat
            .iter()
            .map(|i| i.description.as_deref().unwrap())
            .collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }
}
