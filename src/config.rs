//! Configuration types for bill extraction.
//!
//! All extraction behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share configs across threads (the HTTP server holds one in an
//! `Arc`), serialise them for logging, and diff two runs to understand why
//! their outputs differ.

use crate::error::ExtractError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Configuration for a bill extraction run.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use medbill_extract::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .dpi(200)
///     .concurrency(4)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Rendering DPI used when rasterising each PDF page. Range: 72–400. Default: 150.
    ///
    /// 150 DPI keeps printed bill text sharp enough for a VLM while image
    /// sizes stay well below API upload limits. Faint dot-matrix pharmacy
    /// receipts sometimes need 200–300.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 2000.
    ///
    /// A safety cap independent of DPI so an oversized scan can never exhaust
    /// memory: either dimension is capped and the other scales proportionally.
    pub max_rendered_pixels: u32,

    /// Number of concurrent VLM API calls. Default: 8.
    ///
    /// Pages of a bill are independent, so per-page requests are fanned out
    /// under a bounded pool. Lower this if the provider returns 429s.
    pub concurrency: usize,

    /// VLM model identifier, e.g. "gpt-4.1-mini", "gemini-2.0-flash".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// VLM provider name (e.g. "openai", "gemini", "anthropic").
    /// If None along with `provider`, auto-detects from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed VLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the VLM completion. Default: 0.1.
    ///
    /// Low temperature keeps the model faithful to what is printed on the
    /// page — exactly what a data-compliance extraction needs.
    pub temperature: f32,

    /// Maximum tokens the VLM may generate per page. Default: 4096.
    ///
    /// Dense pharmacy pages can run past 100 line items; truncated output is
    /// exactly what produces unbalanced JSON, so leave headroom.
    pub max_tokens: usize,

    /// Maximum retry attempts on a transient VLM API failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, so N concurrent
    /// workers never retry in lock-step against a recovering endpoint.
    pub retry_backoff_ms: u64,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom system prompt. If None, uses the built-in extraction prompt.
    pub system_prompt: Option<String>,

    /// Page selection. Default: All pages.
    pub pages: PageSelection,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Per-VLM-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Optional per-page progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            max_rendered_pixels: 2000,
            concurrency: 8,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            password: None,
            system_prompt: None,
            pages: PageSelection::default(),
            download_timeout_secs: 120,
            api_timeout_secs: 60,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("concurrency", &self.concurrency)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("pages", &self.pages)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(ExtractError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(ExtractError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of the document to extract.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub enum PageSelection {
    /// Extract all pages (default).
    #[default]
    All,
    /// Extract a single page (1-indexed).
    Single(usize),
    /// Extract a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Extract specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Lowest 1-indexed page the selection asks for, independent of the
    /// document. Used for error reporting when the selection expands to
    /// nothing.
    pub fn first_requested(&self) -> usize {
        match self {
            PageSelection::All => 1,
            PageSelection::Single(p) => *p,
            PageSelection::Range(start, _) => (*start).max(1),
            PageSelection::Set(pages) => pages.iter().copied().min().unwrap_or(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_are_valid() {
        let config = ExtractionConfig::builder().build().unwrap();
        assert_eq!(config.dpi, 150);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn builder_clamps_dpi_and_concurrency() {
        let config = ExtractionConfig::builder()
            .dpi(9999)
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(config.dpi, 400);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn builder_rejects_zero_max_tokens() {
        let err = ExtractionConfig::builder().max_tokens(0).build().unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn page_selection_to_indices() {
        assert_eq!(PageSelection::All.to_indices(5), vec![0, 1, 2, 3, 4]);
        assert_eq!(PageSelection::Single(3).to_indices(5), vec![2]);
        assert_eq!(PageSelection::Single(6).to_indices(5), Vec::<usize>::new());
        assert_eq!(PageSelection::Range(2, 4).to_indices(5), vec![1, 2, 3]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).to_indices(5),
            vec![0, 2] // deduplicated and sorted
        );
    }

    #[test]
    fn page_selection_first_requested() {
        assert_eq!(PageSelection::All.first_requested(), 1);
        assert_eq!(PageSelection::Single(12).first_requested(), 12);
        assert_eq!(PageSelection::Range(7, 9).first_requested(), 7);
        assert_eq!(PageSelection::Set(vec![5, 3, 8]).first_requested(), 3);
        assert_eq!(PageSelection::Set(vec![]).first_requested(), 1);
    }
}
