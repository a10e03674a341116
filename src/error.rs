//! Error types for the statement-extract library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`StatementError`] is **Fatal**: the run cannot proceed at all (bad input
//!   file, wrong password, service not configured, no table on the sample
//!   page). Returned as `Err(StatementError)` from the top-level `extract*`
//!   functions.
//!
//! * [`PageError`] is **Non-fatal**: a single page's extraction job failed
//!   (rejected submission, service-reported failure, cancellation) while its
//!   siblings carry on. Stored inside [`crate::output::PageResult`] so callers
//!   see exactly which pages are missing from the dataset.
//!
//! * [`ServiceError`]: transport-level failure of one call to the remote
//!   extraction service. The orchestrator turns these into a [`PageError`]
//!   or, for the load check, into "service busy".

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the statement-extract library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageResult`] rather than propagated here.
#[derive(Debug, Error)]
pub enum StatementError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The page selection matched no page of the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// There was nothing to extract.
    #[error("No pages to extract")]
    NoPages,

    /// The pdfium shared library could not be loaded.
    #[error("pdfium library unavailable: {detail}\nPlace libpdfium next to the binary or set PDFIUM_LIB_PATH.")]
    PdfiumUnavailable { detail: String },

    // ── Service errors ────────────────────────────────────────────────────
    /// No API key or pre-built service is available.
    #[error("Extraction service is not configured.\n{hint}")]
    ServiceNotConfigured { hint: String },

    /// The synchronous request for the sample page failed.
    #[error("Sample page request failed: {0}")]
    SamplePage(#[source] ServiceError),

    /// No usable table on the sample page; no page can be normalized.
    #[error("Could not detect the field schema from page 1: {reason}")]
    SchemaDetection { reason: String },

    /// Every page succeeded except `failed` of them.
    ///
    /// Returned by [`crate::output::StatementOutput::into_result`] when the
    /// caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during extraction: {pages:?}")]
    PartialFailure {
        failed: usize,
        total: usize,
        pages: Vec<usize>,
    },

    // ── Output errors ─────────────────────────────────────────────────────
    /// CSV serialisation failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled before any page was submitted.
    #[error("Extraction cancelled")]
    Cancelled,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The page is excluded from the dataset and listed in the run's page
/// manifest; sibling pages are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The service rejected the job submission or could not be reached.
    #[error("Page {page}: submission failed: {detail}")]
    Submission { page: usize, detail: String },

    /// The service reported the job as `failed` / `error`.
    #[error("Page {page}: job {record_id} reported '{status}': {diagnostic}")]
    JobFailed {
        page: usize,
        record_id: String,
        status: String,
        diagnostic: String,
    },

    /// Status requests kept failing at the transport level.
    #[error("Page {page}: status polling failed {attempts} times in a row: {detail}")]
    PollFailed {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The caller-supplied wall-clock limit elapsed.
    #[error("Page {page}: extraction timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The run was cancelled before this page resolved.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Submission { page, .. }
            | PageError::JobFailed { page, .. }
            | PageError::PollFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::Cancelled { page } => *page,
        }
    }
}

/// Failure of a single call to the remote extraction service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection, TLS, timeout or body-read failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}
