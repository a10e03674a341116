//! CLI binary for statement-extract.
//!
//! Maps flags onto `ExtractionConfig`, runs the extraction and writes the
//! transaction table as CSV (or the full output as JSON).

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use statement_extract::{
    extract, CancellationToken, ExtractionConfig, ExtractionProgressCallback, PageSelection,
    PageStatus, ProgressCallback, StatementOutput,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
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

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress bar ─────────────────────────────────────────────────────────────

/// Live progress bar plus one log line per resolved page. Pages resolve out
/// of order, so timings are keyed by page number.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(SPINNER);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Rendering statement…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
    }

    fn elapsed(&self, page_num: usize) -> String {
        let ms = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut t| t.remove(&page_num))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.set_message("detecting fields…");
    }

    fn on_schema_ready(&self, fields: &[String]) {
        self.bar.println(format!(
            "{} {} {}",
            cyan("◆"),
            bold("Fields:"),
            fields.join(", ")
        ));
        self.bar.set_message("");
    }

    fn on_service_busy(&self, page_num: usize, in_flight: Option<usize>, wait: Duration) {
        let load = in_flight
            .map(|n| format!("{n} jobs in flight"))
            .unwrap_or_else(|| "load check failed".into());
        self.bar.set_message(yellow(&format!(
            "service busy ({load}), page {page_num} retries in {}s",
            wait.as_secs()
        )));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut t) = self.start_times.lock() {
            t.insert(page_num, Instant::now());
        }
        self.bar.set_message(format!("submitting page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, content_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{content_len:>6} bytes")),
            dim(&self.elapsed(page_num)),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(['…']).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&self.elapsed(page_num)),
        ));
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, _total_pages: usize, _success_count: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Whole statement to stdout
  stmt2csv statement.pdf

  # Write CSV to a file
  stmt2csv statement.pdf -o transactions.csv

  # Skip detection and name the columns yourself
  stmt2csv --fields "Date,Description,Debit,Credit,Balance" statement.pdf

  # Only pages 2 to 6, lower the service ceiling
  stmt2csv --pages 2-6 --max-processing 20 statement.pdf -o out.csv

  # Full JSON output (schema, rows, per-page manifest, stats)
  stmt2csv --json statement.pdf > out.json

ENVIRONMENT VARIABLES:
  NANONETS_API_KEY   API key for the extraction service
  PDFIUM_LIB_PATH    Path to the pdfium shared library
  RUST_LOG           Log filter, overrides -v / -q

EXIT STATUS:
  0  every page extracted
  1  fatal error, or at least one page failed (partial CSV is still written)
"#;

/// Extract the transaction table of a PDF bank statement to CSV.
#[derive(Parser, Debug)]
#[command(
    name = "stmt2csv",
    version,
    about = "Extract bank-statement transactions from a PDF into CSV",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write CSV to this file instead of stdout.
    #[arg(short, long, env = "STMT2CSV_OUTPUT")]
    output: Option<PathBuf>,

    /// Extraction API key.
    #[arg(long, env = "NANONETS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Extraction API base URL.
    #[arg(long, env = "STMT2CSV_BASE_URL", default_value = statement_extract::config::DEFAULT_BASE_URL)]
    base_url: String,

    /// OCR model.
    #[arg(long, env = "STMT2CSV_MODEL", default_value = statement_extract::config::DEFAULT_MODEL)]
    model: String,

    /// Comma-separated column names; skips detection from page 1.
    #[arg(long, env = "STMT2CSV_FIELDS", value_delimiter = ',')]
    fields: Option<Vec<String>>,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "STMT2CSV_PAGES", default_value = "all")]
    pages: String,

    /// Rendering DPI (72–400).
    #[arg(long, env = "STMT2CSV_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Concurrent page workers (default: one per page).
    #[arg(short, long, env = "STMT2CSV_CONCURRENCY")]
    concurrency: Option<usize>,

    /// In-flight job count at which the service counts as busy.
    #[arg(long, env = "STMT2CSV_MAX_PROCESSING", default_value_t = 50)]
    max_processing: usize,

    /// Seconds between status polls.
    #[arg(long, env = "STMT2CSV_POLL_INTERVAL", default_value_t = 5)]
    poll_interval: u64,

    /// Give up on a page after this many seconds.
    #[arg(long, env = "STMT2CSV_PAGE_TIMEOUT")]
    page_timeout: Option<u64>,

    /// PDF user password for encrypted statements.
    #[arg(long, env = "STMT2CSV_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Output the full result as JSON instead of CSV.
    #[arg(long, env = "STMT2CSV_JSON")]
    json: bool,

    /// Disable the progress bar.
    #[arg(long, env = "STMT2CSV_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "STMT2CSV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "STMT2CSV_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "STMT2CSV_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-request timeout for the extraction API in seconds.
    #[arg(long, env = "STMT2CSV_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The progress bar replaces INFO logs; -v always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
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

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} interrupted, cancelling outstanding pages…", yellow("⚠"));
            on_interrupt.cancel();
        }
    });

    let config = build_config(&cli, progress_cb, cancellation)?;
    let output = extract(&cli.input, &config)
        .await
        .context("Extraction failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if let Some(path) = &cli.output {
        output
            .dataset
            .write_csv(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    } else {
        let csv = output.dataset.to_csv_string().context("Failed to render CSV")?;
        io::stdout()
            .lock()
            .write_all(csv.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !cli.quiet {
        print_summary(&output, cli.output.as_ref());
    }

    if output.stats.failed_pages > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(output: &StatementOutput, path: Option<&PathBuf>) {
    let stats = &output.stats;
    let marker = if stats.failed_pages == 0 {
        green("✔")
    } else {
        yellow("⚠")
    };
    let target = path
        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
        .unwrap_or_default();

    eprintln!(
        "{marker}  {} rows from {}/{} pages  {}{target}",
        bold(&stats.total_rows.to_string()),
        stats.extracted_pages,
        stats.total_pages,
        dim(&format!(
            "{} duplicates dropped, {}ms",
            stats.duplicate_rows, stats.total_duration_ms
        )),
    );

    for page in &output.pages {
        if let PageStatus::Failed { error } = &page.status {
            eprintln!("   {} {}", red("✗"), error);
        }
    }
}

fn build_config(
    cli: &Cli,
    progress: Option<ProgressCallback>,
    cancellation: CancellationToken,
) -> Result<ExtractionConfig> {
    let pages = PageSelection::parse(&cli.pages).context("Invalid --pages")?;

    let mut builder = ExtractionConfig::builder()
        .base_url(&cli.base_url)
        .model(&cli.model)
        .pages(pages)
        .dpi(cli.dpi)
        .max_processing_limit(cli.max_processing)
        .poll_interval(Duration::from_secs(cli.poll_interval))
        .download_timeout_secs(cli.download_timeout)
        .request_timeout_secs(cli.api_timeout)
        .cancellation(cancellation);

    if let Some(key) = &cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(fields) = &cli.fields {
        builder = builder.fields(fields.iter().map(|f| f.trim().to_string()));
    }
    if let Some(n) = cli.concurrency {
        builder = builder.concurrency(n);
    }
    if let Some(secs) = cli.page_timeout {
        builder = builder.page_timeout(Duration::from_secs(secs));
    }
    if let Some(pwd) = &cli.password {
        builder = builder.password(pwd);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
