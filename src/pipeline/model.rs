//! VLM interaction: build the vision message for one page and call the
//! provider.
//!
//! This module is intentionally thin — all prompt engineering lives in
//! [`crate::prompts`] and all payload parsing in
//! [`crate::pipeline::repair`], so each can change without touching retry or
//! error-handling logic here.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors from VLM APIs are transient and frequent under
//! concurrent load. Exponential backoff (`retry_backoff_ms * 2^attempt`)
//! avoids thundering-herd: with 500 ms base and 3 retries the wait sequence
//! is 500 ms → 1 s → 2 s, totalling < 4 s of back-off per page. Each attempt
//! is additionally bounded by `api_timeout_secs`; a hung connection must not
//! pin a pool slot forever.

use crate::config::ExtractionConfig;
use crate::error::PageError;
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Raw result of one page's VLM round-trip, before payload parsing.
#[derive(Debug, Clone)]
pub struct RawPage {
    /// 1-indexed page number.
    pub page_num: usize,
    /// Raw model output (possibly malformed JSON; see `repair`).
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    /// Retries needed before success (0 = first attempt).
    pub retries: u8,
    /// Set when all retries were exhausted.
    pub error: Option<PageError>,
}

/// Send a single rasterised page to the VLM and return its raw output.
///
/// ## Message Layout
///
/// 1. **System message** — the extraction rules (or user-supplied override)
/// 2. **User message** — the page PNG as a base64 image attachment (empty
///    text; VLM APIs require at least one user turn, but the image carries
///    all the actual content)
///
/// ## Return Value
///
/// Always returns a `RawPage` — never propagates the error upward, so a
/// single bad page doesn't abort the entire bill. Callers check
/// `raw.error` to decide whether to parse or skip the page.
pub async fn process_page(
    provider: &Arc<dyn LLMProvider>,
    page_num: usize,
    image_data: ImageData,
    config: &ExtractionConfig,
) -> RawPage {
    let start = Instant::now();
    let system_prompt = config
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT);

    let messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user_with_images("", vec![image_data]),
    ];

    let options = build_options(config);
    let api_timeout = Duration::from_secs(config.api_timeout_secs);

    let mut last_err: Option<String> = None;
    let mut timed_out = false;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = backoff_delay_ms(config.retry_backoff_ms, attempt);
            warn!(
                "Page {}: retry {}/{} after {}ms",
                page_num, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }

        match timeout(api_timeout, provider.chat(&messages, Some(&options))).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                debug!(
                    "Page {}: {} input tokens, {} output tokens, {:?}",
                    page_num, response.prompt_tokens, response.completion_tokens, duration
                );

                return RawPage {
                    page_num,
                    text: response.content,
                    input_tokens: response.prompt_tokens as u64,
                    output_tokens: response.completion_tokens as u64,
                    duration_ms: duration.as_millis() as u64,
                    retries: attempt as u8,
                    error: None,
                };
            }
            Ok(Err(e)) => {
                let err_msg = format!("{}", e);
                warn!(
                    "Page {}: attempt {} failed — {}",
                    page_num,
                    attempt + 1,
                    err_msg
                );
                last_err = Some(err_msg);
                timed_out = false;
            }
            Err(_) => {
                warn!(
                    "Page {}: attempt {} timed out after {}s",
                    page_num,
                    attempt + 1,
                    config.api_timeout_secs
                );
                last_err = Some(format!("timed out after {}s", config.api_timeout_secs));
                timed_out = true;
            }
        }
    }

    // All retries exhausted
    let duration = start.elapsed();
    let error = if timed_out {
        PageError::Timeout {
            page: page_num,
            secs: config.api_timeout_secs,
        }
    } else {
        PageError::ModelFailed {
            page: page_num,
            retries: config.max_retries as u8,
            detail: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        }
    };

    RawPage {
        page_num,
        text: String::new(),
        input_tokens: 0,
        output_tokens: 0,
        duration_ms: duration.as_millis() as u64,
        retries: config.max_retries as u8,
        error: Some(error),
    }
}

/// Exponential backoff delay for retry `attempt` (1-based). Saturates
/// rather than overflowing, so an absurd `max_retries` cannot panic in a
/// debug build.
fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Build `CompletionOptions` from the extraction config.
fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}
