//! CLI binary for medbill-extract.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use medbill_extract::{
    extract, extract_to_file, ExtractResponse, ExtractionConfig, ExtractionProgressCallback,
    PageSelection, ProgressCallback,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: renders a live progress bar and per-page log
/// lines using [indicatif]. Designed to work correctly when pages complete
/// out-of-order (concurrent fan-out).
struct CliProgressCallback {
    /// The single progress bar anchored at the bottom of the terminal.
    bar: ProgressBar,
    /// Per-page wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
    /// Count of pages that errored out.
    errors: AtomicUsize,
}

impl CliProgressCallback {
    /// Create a callback whose progress-bar length is set dynamically
    /// by `on_conversion_start` (called before any pages are processed).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_conversion_start

        // Initial style: spinner only (no counter until we know the total).
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch to the full progress-bar style once we know `total`.
    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_conversion_start(&self, total_pages: usize) {
        // Switch from spinner-only style to full progress bar now that we
        // know the actual page count.
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting extraction of {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap()
            .insert(page_num, Instant::now());
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, item_count: usize) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&page_num)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{item_count:>4} items")),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&page_num)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);

        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = truncate_message(error, 80);

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages extracted  ({} failed)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

/// Truncate a message to at most `max_chars` characters, appending an
/// ellipsis. Counts characters, not bytes — provider errors can echo
/// arbitrary model text, and slicing inside a multibyte character panics.
fn truncate_message(s: &str, max_chars: usize) -> String {
    let mut tail = s.char_indices().skip(max_chars.saturating_sub(1));
    match (tail.next(), tail.next()) {
        (Some((cut, _)), Some(_)) => format!("{}\u{2026}", &s[..cut]),
        _ => s.to_string(),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic extraction (JSON to stdout)
  medbill extract bill.pdf

  # Write result to a file
  medbill extract bill.pdf -o items.json

  # Specific pages, specific model
  medbill extract --pages 1-5 --model gpt-4.1 --provider openai bill.pdf

  # Extract from URL, wire-envelope output
  medbill extract --envelope https://example.com/bills/inv-2041.pdf

  # Standalone bill photo
  medbill extract scan.jpg -o items.json

  # Run the HTTP API
  medbill serve --addr 0.0.0.0:10000

SUPPORTED PROVIDERS & MODELS:
  Provider     Model                        Vision
  ─────────    ──────────────────────────   ──────
  openai       gpt-4.1-mini (default)       ✓
  openai       gpt-4.1, gpt-4o              ✓
  anthropic    claude-sonnet-4-20250514     ✓
  gemini       gemini-2.0-flash             ✓
  ollama       llava, llama3.2-vision       ✓

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY         OpenAI API key
  ANTHROPIC_API_KEY      Anthropic API key
  GEMINI_API_KEY         Google Gemini API key
  MEDBILL_LLM_PROVIDER   Override provider (openai, anthropic, gemini, ollama)
  MEDBILL_MODEL          Override model ID
  MEDBILL_ADDR           Listen address for `medbill serve`

SETUP:
  1. Set API key:  export OPENAI_API_KEY=sk-...
  2. Extract:      medbill extract bill.pdf -o items.json
"#;

/// Extract structured line items from medical bills using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "medbill",
    version,
    about = "Extract structured line items from medical bills using Vision LLMs",
    long_about = "Extract itemised charges (name, code, quantity, rate, amount) from medical \
bill PDFs and images using Vision Language Models. Supports OpenAI, Anthropic, Google Gemini, \
and any OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract line items from a bill document.
    Extract(ExtractArgs),
    /// Run the HTTP extraction API.
    #[cfg(feature = "server")]
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ExtractArgs {
    /// Local PDF/image path or HTTP/HTTPS URL.
    input: String,

    /// Write JSON to this file instead of stdout.
    #[arg(short, long, env = "MEDBILL_OUTPUT")]
    output: Option<PathBuf>,

    /// VLM model ID (e.g. gpt-4.1-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "MEDBILL_MODEL")]
    model: Option<String>,

    /// VLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "MEDBILL_PROVIDER",
        long_help = "VLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "MEDBILL_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Number of concurrent VLM API calls.
    #[arg(short, long, env = "MEDBILL_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "MEDBILL_PAGES", default_value = "all")]
    pages: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "MEDBILL_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "MEDBILL_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max VLM output tokens per page.
    #[arg(long, env = "MEDBILL_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// VLM temperature (0.0–2.0).
    #[arg(long, env = "MEDBILL_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per page on VLM failure.
    #[arg(long, env = "MEDBILL_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Output the wire envelope (is_success/token_usage/data) instead of the
    /// full per-page result.
    #[arg(long, env = "MEDBILL_ENVELOPE")]
    envelope: bool,

    /// Disable progress bar.
    #[arg(long, env = "MEDBILL_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MEDBILL_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MEDBILL_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "MEDBILL_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-page VLM call timeout in seconds.
    #[arg(long, env = "MEDBILL_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

#[cfg(feature = "server")]
#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "MEDBILL_ADDR", default_value = medbill_extract::server::DEFAULT_ADDR)]
    addr: String,

    /// VLM model ID used for all requests.
    #[arg(long, env = "MEDBILL_MODEL")]
    model: Option<String>,

    /// VLM provider used for all requests.
    #[arg(long, env = "MEDBILL_PROVIDER")]
    provider: Option<String>,

    /// Number of concurrent VLM API calls per request.
    #[arg(short, long, env = "MEDBILL_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Extract(args) => run_extract(args).await,
        #[cfg(feature = "server")]
        Command::Serve(args) => run_serve(args).await,
    }
}

async fn run_extract(args: ExtractArgs) -> Result<()> {
    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !args.quiet && !args.no_progress;
    let filter = if args.verbose {
        "debug"
    } else if args.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    // The progress bar is initialised with a spinner (no page count yet);
    // `on_conversion_start` resizes it to the correct total once the
    // document has been inspected.
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&args, progress_cb).await?;

    // ── Run extraction ───────────────────────────────────────────────────
    if let Some(ref output_path) = args.output {
        let stats = extract_to_file(&args.input, output_path, &config)
            .await
            .context("Extraction failed")?;

        // Summary line (callback already printed the per-page log).
        if !args.quiet {
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if stats.failed_pages == 0 {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                stats.processed_pages,
                stats.processed_pages + stats.failed_pages,
                stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
            eprintln!(
                "   {} tokens in  /  {} tokens out",
                dim(&stats.total_input_tokens.to_string()),
                dim(&stats.total_output_tokens.to_string()),
            );
        }
    } else {
        let output = extract(&args.input, &config)
            .await
            .context("Extraction failed")?;

        let json = if args.envelope {
            serde_json::to_string_pretty(&ExtractResponse::success(&output))
                .context("Failed to serialise envelope")?
        } else {
            serde_json::to_string_pretty(&output).context("Failed to serialise output")?
        };

        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(json.as_bytes())
            .context("Failed to write to stdout")?;
        handle.write_all(b"\n").ok();

        // Summary (the callback already printed the final green/red tick).
        if !args.quiet && !show_progress {
            eprintln!(
                "Extracted {} items from {}/{} pages in {}ms",
                output.items.len(),
                output.stats.processed_pages,
                output.stats.total_pages,
                output.stats.total_duration_ms
            );
            if output.stats.failed_pages > 0 {
                eprintln!("  {} pages failed", output.stats.failed_pages);
            }
        } else if !args.quiet {
            eprintln!(
                "   {} items  —  {} tokens in  /  {} tokens out  —  {}ms total",
                bold(&output.items.len().to_string()),
                dim(&output.stats.total_input_tokens.to_string()),
                dim(&output.stats.total_output_tokens.to_string()),
                output.stats.total_duration_ms,
            );
        }
    }

    Ok(())
}

#[cfg(feature = "server")]
async fn run_serve(args: ServeArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ExtractionConfig::builder()
        .concurrency(args.concurrency)
        .build()
        .context("Invalid configuration")?;
    config.model = args.model;
    config.provider_name = args.provider;

    let state = medbill_extract::server::ApiState::new(config);
    medbill_extract::server::start_server(&args.addr, state)
        .await
        .context("Server failed")
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(
    args: &ExtractArgs,
    progress: Option<ProgressCallback>,
) -> Result<ExtractionConfig> {
    let system_prompt = if let Some(ref path) = args.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let pages = parse_pages(&args.pages)?;

    let mut builder = ExtractionConfig::builder()
        .dpi(args.dpi)
        .concurrency(args.concurrency)
        .pages(pages)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .max_retries(args.max_retries)
        .download_timeout_secs(args.download_timeout)
        .api_timeout_secs(args.api_timeout);

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;

    // Apply fields the builder doesn't have setters for (or that need special handling)
    config.model = args.model.clone();
    config.provider_name = args.provider.clone();
    config.password = args.password.clone();
    config.system_prompt = system_prompt;

    Ok(config)
}

/// Parse `--pages` string into `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim().to_lowercase();

    if s == "all" {
        return Ok(PageSelection::All);
    }

    // Range: "3-15"
    if let Some((start, end)) = s.split_once('-') {
        let start: usize = start
            .trim()
            .parse()
            .context("Invalid start page in range")?;
        let end: usize = end.trim().parse().context("Invalid end page in range")?;

        if start < 1 {
            anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", start);
        }
        if start > end {
            anyhow::bail!(
                "Invalid page range '{}-{}': start must be <= end",
                start,
                end
            );
        }

        return Ok(PageSelection::Range(start, end));
    }

    // Set: "1,3,5,7"
    if s.contains(',') {
        let pages: Vec<usize> = s
            .split(',')
            .map(|p| {
                p.trim()
                    .parse::<usize>()
                    .context(format!("Invalid page number: '{}'", p.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        for &p in &pages {
            if p < 1 {
                anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", p);
            }
        }

        return Ok(PageSelection::Set(pages));
    }

    // Single page: "5"
    let page: usize = s.parse().context("Invalid page number")?;
    if page < 1 {
        anyhow::bail!("Pages are 1-indexed, minimum is 1 (got {})", page);
    }

    Ok(PageSelection::Single(page))
}
