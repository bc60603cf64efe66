//! JSON self-healing: parse VLM output into a page payload, repairing
//! malformed JSON first when necessary.
//!
//! ## Why is repair necessary?
//!
//! Even well-prompted VLMs routinely emit payloads that are *semantically
//! right* but *syntactically broken*:
//!
//! - Wrapping the JSON in ` ```json ... ``` ` fences despite the prompt
//!   saying not to
//! - Leading prose ("Here is the extracted data:") before the payload
//! - Python-style literals (`None`, `True`, `NaN`) instead of JSON ones
//! - Trailing commas before `}` / `]`
//! - Truncated output with unclosed brackets when `max_tokens` is hit
//!
//! This module applies cheap, deterministic repair rules in a defined order
//! and only when a strict parse fails, so well-formed output pays nothing.
//! Each rule is a pure function (`&str → String`) and independently testable.
//!
//! Numeric item fields get their own normalisation: bills print amounts as
//! `₹1,250.00/-` or `$45`, and models sometimes copy them verbatim into
//! strings. [`clean_number`] strips currency decoration and parses the rest;
//! an unparseable number becomes `None`, never an error.

use crate::output::{round2, LineItem};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Parsed payload of one bill page.
///
/// `item_groups` preserves the grouping the model reported (sections or
/// columns); [`crate::pipeline::flatten`] merges them in order.
#[derive(Debug, Clone, Default)]
pub struct PagePayload {
    /// Model-supplied page classification label, if any.
    pub page_type: Option<String>,
    /// Item lists in reading order — one group per section/column.
    pub item_groups: Vec<Vec<LineItem>>,
    /// Labelled totals reported by the model (label → amount).
    pub totals: BTreeMap<String, f64>,
}

/// Parse raw model output into a [`PagePayload`].
///
/// Returns `(payload, repaired)` where `repaired` is true when the strict
/// parse failed and the repair rules had to run. Errors only when the text
/// is unparseable even after repair.
pub fn parse_payload(text: &str) -> Result<(PagePayload, bool), String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty model output".to_string());
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => Ok((interpret(value), false)),
        Err(first_err) => {
            let healed = repair_json(trimmed);
            match serde_json::from_str::<serde_json::Value>(&healed) {
                Ok(value) => Ok((interpret(value), true)),
                Err(_) => Err(first_err.to_string()),
            }
        }
    }
}

/// Apply all repair rules to malformed model output.
///
/// Rules (applied in order):
/// 1. Strip outer code fences
/// 2. Strip BOM / zero-width / invisible characters
/// 3. Slice to the outermost JSON value (drops surrounding prose)
/// 4. Normalise Python-style literals (`None` → `null`, …)
/// 5. Remove trailing commas before `}` / `]`
/// 6. Balance unclosed strings and brackets (truncated output)
pub fn repair_json(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = remove_invisible_chars(&s);
    let s = slice_outer_json(&s);
    let s = normalise_python_literals(&s);
    let s = remove_trailing_commas(&s);
    balance_brackets(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json)?\s*\n?(.*?)\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 3: Slice to the outermost JSON value ────────────────────────────
//
// Models sometimes prefix the payload with prose or append a closing remark.
// Scan for the first `{` or `[` and cut at its matching close; if the close
// is missing (truncation), keep everything to the end and let the balancing
// rule finish the job.

fn slice_outer_json(input: &str) -> String {
    let bytes = input.as_bytes();
    let start = match bytes.iter().position(|&b| b == b'{' || b == b'[') {
        Some(i) => i,
        None => return input.to_string(),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return input[start..=i].to_string();
                }
            }
            _ => {}
        }
    }

    input[start..].to_string()
}

// ── Rule 4: Normalise Python-style literals ──────────────────────────────
//
// Word-boundary replacement can in principle touch string contents, but a
// bill description containing a bare `None` token is far rarer than a model
// emitting Python literals, and this rule only runs on already-broken JSON.

static RE_PY_NONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNone\b").unwrap());
static RE_PY_TRUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTrue\b").unwrap());
static RE_PY_FALSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bFalse\b").unwrap());
static RE_NAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNaN\b").unwrap());

fn normalise_python_literals(input: &str) -> String {
    let s = RE_PY_NONE.replace_all(input, "null");
    let s = RE_PY_TRUE.replace_all(&s, "true");
    let s = RE_PY_FALSE.replace_all(&s, "false");
    RE_NAN.replace_all(&s, "null").to_string()
}

// ── Rule 5: Remove trailing commas ───────────────────────────────────────

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").to_string()
}

// ── Rule 6: Balance unclosed strings and brackets ────────────────────────
//
// Truncated output (max_tokens hit mid-array) leaves a dangling string or
// open brackets. Close the string, drop a trailing comma, then append the
// missing closers innermost-first.

fn balance_brackets(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(last) = out.chars().last() {
        if last == ',' || last.is_whitespace() {
            out.pop();
        } else {
            break;
        }
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

// ── Payload interpretation ───────────────────────────────────────────────

/// Interpret a parsed JSON value as a page payload.
///
/// Accepts three shapes: a bare item array, a page object with `bill_items`
/// (and optional `page_type` / `totals`), or a sectioned object where each
/// section carries its own item list.
fn interpret(value: serde_json::Value) -> PagePayload {
    use serde_json::Value;

    match value {
        Value::Array(arr) => PagePayload {
            page_type: None,
            item_groups: vec![items_from_array(&arr)],
            totals: BTreeMap::new(),
        },
        Value::Object(map) => {
            let page_type = map
                .get("page_type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let mut item_groups = Vec::new();

            if let Some(Value::Array(sections)) = map.get("sections") {
                for section in sections {
                    if let Some(arr) = section
                        .get("bill_items")
                        .or_else(|| section.get("items"))
                        .and_then(|v| v.as_array())
                    {
                        item_groups.push(items_from_array(arr));
                    }
                }
            }

            if let Some(arr) = map
                .get("bill_items")
                .or_else(|| map.get("items"))
                .or_else(|| map.get("line_items"))
                .and_then(|v| v.as_array())
            {
                item_groups.push(items_from_array(arr));
            }

            let totals = map
                .get("totals")
                .or_else(|| map.get("detected_totals"))
                .and_then(|v| v.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| coerce_number(v).map(|n| (k.clone(), n)))
                        .collect()
                })
                .unwrap_or_default();

            PagePayload {
                page_type,
                item_groups,
                totals,
            }
        }
        _ => PagePayload::default(),
    }
}

fn items_from_array(arr: &[serde_json::Value]) -> Vec<LineItem> {
    arr.iter().filter_map(item_from_value).collect()
}

/// Build a [`LineItem`] from one JSON object, tolerating field aliases and
/// string-typed numbers. Non-object entries are dropped.
fn item_from_value(value: &serde_json::Value) -> Option<LineItem> {
    let obj = value.as_object()?;

    let field = |names: &[&str]| -> Option<serde_json::Value> {
        names.iter().find_map(|n| obj.get(*n)).cloned()
    };

    let description = field(&["item_name", "name", "description"])
        .and_then(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    let code = field(&["item_code", "code"])
        .and_then(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty());
    let quantity = field(&["item_quantity", "quantity", "qty"])
        .as_ref()
        .and_then(coerce_number);
    let rate = field(&["item_rate", "rate"]).as_ref().and_then(coerce_number);
    let amount = field(&["item_amount", "amount"])
        .as_ref()
        .and_then(coerce_number);

    Some(LineItem {
        description,
        code,
        quantity,
        rate,
        amount,
    })
}

/// Coerce a JSON value into a rounded `f64`.
///
/// Numbers pass through; strings are run through [`clean_number`].
fn coerce_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(round2),
        serde_json::Value::String(s) => clean_number(s),
        _ => None,
    }
}

static RE_NON_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\d.\-]").unwrap());
// "Rs." must go before the blanket strip or its dot survives as a leading
// decimal point ("Rs. 320" → ".320" → 0.32).
static RE_CURRENCY_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(rs\.?|inr)\s*").unwrap());

/// Parse a printed number, stripping currency decoration.
///
/// Handles `₹1,250.00/-`, `$45`, `1,000`, `Rs. 320`. Returns `None` for
/// anything that leaves no digits behind.
pub fn clean_number(token: &str) -> Option<f64> {
    let s = RE_CURRENCY_PREFIX.replace(token.trim(), "");
    let s = s.replace(['₹', '$'], "").replace("/-", "").replace(',', "");
    let s = RE_NON_NUMERIC.replace_all(&s, "");
    if s.is_empty() || s == "." || s == "-" {
        return None;
    }
    s.parse::<f64>().ok().map(round2)
}

// ── Tests ────────────────────────────────────────────────────────────────
