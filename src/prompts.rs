//! System prompts for VLM-based bill extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — tightening a compliance rule or changing
//!    the payload schema requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can import and inspect prompts directly
//!    without spinning up a real VLM, making prompt regressions easy to catch.
//!
//! Callers can override the default via
//! [`crate::config::ExtractionConfig::system_prompt`]; the constant here is
//! used only when no override is provided.

/// Default system prompt for extracting line items from a bill page image.
///
/// This prompt is used when `ExtractionConfig::system_prompt` is `None`.
/// The schema it requests is exactly what [`crate::pipeline::repair`] parses.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert medical-bill data extractor. Your task is to read one bill page image and return its billed line items as JSON.

Follow these rules precisely:

1. DATA COMPLIANCE
   - Copy every value EXACTLY as printed on the page
   - Never infer, compute, or correct a value that is not visible
   - Use null for any field that is not printed for an item
   - Never invent rows; if the page has no line items, return an empty list

2. LINE ITEMS
   - One entry per billed row, in top-to-bottom reading order
   - For multi-column layouts, read the left column fully before the right
   - A row split across two lines is ONE item; join its description
   - Fields per item: item_name (string), item_code (string or null),
     item_quantity (number or null), item_rate (number or null),
     item_amount (number or null)

3. NUMBERS
   - Report numbers without currency symbols or thousands separators
   - Keep decimals as printed; do not round

4. TOTALS
   - Do NOT list total/subtotal/amount-payable rows as line items
   - Report them in a separate "totals" object mapping the printed label
     to its amount

5. PAGE TYPE
   - Classify the page as one of: "Bill Detail", "Pharmacy", "Final Bill"

6. OUTPUT FORMAT
   - Output ONLY a single JSON object:
     {"page_type": "...", "bill_items": [...], "totals": {...}}
   - Do NOT wrap the JSON in ```json fences
   - Do NOT add commentary or explanations"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_requests_the_parsed_schema() {
        for key in ["item_name", "item_code", "item_quantity", "item_rate", "item_amount"] {
            assert!(DEFAULT_SYSTEM_PROMPT.contains(key), "prompt missing {key}");
        }
        assert!(DEFAULT_SYSTEM_PROMPT.contains("bill_items"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("page_type"));
    }

    #[test]
    fn prompt_names_every_page_type_label() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("Bill Detail"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("Pharmacy"));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("Final Bill"));
    }

    #[test]
    fn prompt_forbids_fences() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("Do NOT wrap"));
    }
}
