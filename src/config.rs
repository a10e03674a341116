//! Configuration types for statement extraction.
//!
//! Every knob of a run lives in [`ExtractionConfig`], built through
//! [`ExtractionConfigBuilder`]. Callers set what they care about and rely on
//! the defaults for the rest.

use crate::cancel::CancellationToken;
use crate::error::StatementError;
use crate::progress::ProgressCallback;
use crate::service::ExtractionService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default endpoint of the hosted extraction API.
pub const DEFAULT_BASE_URL: &str = "https://extraction-api.nanonets.com";

/// Default OCR model.
pub const DEFAULT_MODEL: &str = "nanonets-ocr-s";

/// Output mode requested for the sample page; it yields HTML tables.
pub const DEFAULT_SCHEMA_OUTPUT_TYPE: &str = "markdown-financial-docs";

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use statement_extract::ExtractionConfig;
/// use std::time::Duration;
///
/// let config = ExtractionConfig::builder()
///     .dpi(150)
///     .max_processing_limit(20)
///     .poll_interval(Duration::from_secs(2))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Bearer token for the extraction API. `None` falls back to the
    /// `NANONETS_API_KEY` environment variable.
    pub api_key: Option<String>,

    /// Base URL of the extraction API, without trailing slash.
    pub base_url: String,

    /// OCR model identifier sent with every request.
    pub model: String,

    /// Output mode for the synchronous sample-page request.
    pub schema_output_type: String,

    /// Column names to extract. `None` detects them from the first page.
    pub fields: Option<Vec<String>>,

    /// Rendering DPI. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Cap on either rendered dimension in pixels. Default: 2400.
    ///
    /// A 200-DPI render of an oversized page would otherwise allocate a
    /// huge bitmap; the longer edge is clamped and the other scaled.
    pub max_rendered_pixels: u32,

    /// Page workers running at once. `None` starts one per page and lets
    /// admission control do the throttling.
    pub concurrency: Option<usize>,

    /// In-flight job count at or above which the service counts as busy. Default: 50.
    pub max_processing_limit: usize,

    /// First wait after a busy observation. Default: 5 s.
    pub initial_backoff: Duration,

    /// Ceiling for the doubling busy wait. Default: 60 s.
    pub max_backoff: Duration,

    /// Interval between status polls of a submitted job. Default: 5 s.
    pub poll_interval: Duration,

    /// Consecutive failed status requests tolerated before a page fails. Default: 3.
    pub max_poll_errors: u32,

    /// Timeout for each HTTP request to the service, in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Wall-clock limit for one page from admission to completion. Default: none.
    pub page_timeout: Option<Duration>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// PDF user password for encrypted statements.
    pub password: Option<String>,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Prefix for uploaded file names. `None` uses the input's file stem.
    pub document_name: Option<String>,

    /// Pre-built service. Takes precedence over `api_key`/`base_url`.
    pub service: Option<Arc<dyn ExtractionService>>,

    /// Receives per-page progress events.
    pub progress_callback: Option<ProgressCallback>,

    /// Cancels the run. Clone the token before building to keep a handle.
    pub cancellation: CancellationToken,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            schema_output_type: DEFAULT_SCHEMA_OUTPUT_TYPE.to_string(),
            fields: None,
            dpi: 200,
            max_rendered_pixels: 2400,
            concurrency: None,
            max_processing_limit: 50,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_poll_errors: 3,
            request_timeout_secs: 60,
            page_timeout: None,
            download_timeout_secs: 120,
            password: None,
            pages: PageSelection::default(),
            document_name: None,
            service: None,
            progress_callback: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("schema_output_type", &self.schema_output_type)
            .field("fields", &self.fields)
            .field("dpi", &self.dpi)
            .field("concurrency", &self.concurrency)
            .field("max_processing_limit", &self.max_processing_limit)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_errors", &self.max_poll_errors)
            .field("page_timeout", &self.page_timeout)
            .field("pages", &self.pages)
            .field("service", &self.service.as_ref().map(|_| "<dyn ExtractionService>"))
            .finish()
    }
}

impl ExtractionConfig {
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn schema_output_type(mut self, output_type: impl Into<String>) -> Self {
        self.config.schema_output_type = output_type.into();
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = Some(n.max(1));
        self
    }

    pub fn max_processing_limit(mut self, n: usize) -> Self {
        self.config.max_processing_limit = n;
        self
    }

    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.config.initial_backoff = d;
        self
    }

    pub fn max_backoff(mut self, d: Duration) -> Self {
        self.config.max_backoff = d;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.config.poll_interval = d;
        self
    }

    pub fn max_poll_errors(mut self, n: u32) -> Self {
        self.config.max_poll_errors = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn page_timeout(mut self, d: Duration) -> Self {
        self.config.page_timeout = Some(d);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn document_name(mut self, name: impl Into<String>) -> Self {
        self.config.document_name = Some(name.into());
        self
    }

    pub fn service(mut self, service: Arc<dyn ExtractionService>) -> Self {
        self.config.service = Some(service);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.config.cancellation = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, StatementError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(StatementError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.max_processing_limit == 0 {
            return Err(StatementError::InvalidConfig(
                "max_processing_limit must be ≥ 1".into(),
            ));
        }
        if c.initial_backoff.is_zero() || c.max_backoff < c.initial_backoff {
            return Err(StatementError::InvalidConfig(format!(
                "backoff must satisfy 0 < initial ({:?}) ≤ max ({:?})",
                c.initial_backoff, c.max_backoff
            )));
        }
        if c.poll_interval.is_zero() {
            return Err(StatementError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }
        if c.max_poll_errors == 0 {
            return Err(StatementError::InvalidConfig(
                "max_poll_errors must be ≥ 1".into(),
            ));
        }
        if c.base_url.trim().is_empty() {
            return Err(StatementError::InvalidConfig("base_url is empty".into()));
        }
        if let Some(fields) = &c.fields {
            // Reject bad field lists at build time rather than mid-run.
            crate::schema::FieldSchema::from_fields(fields)?;
        }
        Ok(self.config)
    }
}

/// Which pages of the statement to extract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// Contiguous range (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Parse `all`, `5`, `3-15` or `1,3,5`.
    pub fn parse(s: &str) -> Result<Self, StatementError> {
        let s = s.trim();
        let bad = |detail: &str| {
            StatementError::InvalidConfig(format!("invalid page selection '{s}': {detail}"))
        };
        let number = |part: &str| {
            part.trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| bad("pages are positive integers"))
        };

        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        if s.contains(',') {
            let pages = s.split(',').map(number).collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }
        if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (number(start)?, number(end)?);
            if start > end {
                return Err(bad("range start exceeds end"));
            }
            return Ok(PageSelection::Range(start, end));
        }
        Ok(PageSelection::Single(number(s)?))
    }

    /// Expand into a sorted, deduplicated list of 0-indexed page numbers.
    /// Pages beyond `total_pages` are dropped.
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

    /// Highest 1-indexed page the selection names, if bounded.
    pub fn max_page(&self) -> Option<usize> {
        match self {
            PageSelection::All => None,
            PageSelection::Single(p) => Some(*p),
            PageSelection::Range(_, end) => Some(*end),
            PageSelection::Set(pages) => pages.iter().copied().max(),
        }
    }
}
