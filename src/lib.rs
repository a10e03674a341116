//! # statement-extract
//!
//! Turn scanned or digital bank statements (PDF) into one clean transaction
//! table, using a hosted OCR extraction service.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file, download URL or spill bytes
//!  ├─ 2. Render     rasterise pages to PNG via pdfium (spawn_blocking)
//!  ├─ 3. Schema     sample page 1 in table mode, widest table → fields
//!  ├─ 4. Jobs       one async job per page: admission → submit → poll
//!  ├─ 5. Normalize  HTML tables / JSON arrays / object lines / envelopes → rows
//!  └─ 6. Merge      tag page + row_number, drop duplicates → CSV
//! ```
//!
//! The service is throttled through admission control: a page is only
//! submitted while fewer than `max_processing_limit` jobs are in flight,
//! otherwise the worker backs off 5 s, 10 s, 20 s … up to 60 s.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use statement_extract::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key read from NANONETS_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract("statement.pdf", &config).await?;
//!     print!("{}", output.dataset.to_csv_string()?);
//!     eprintln!(
//!         "{} rows from {} pages ({} failed)",
//!         output.stats.total_rows, output.stats.total_pages, output.stats.failed_pages
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `stmt2csv` binary (clap + anyhow + indicatif + tracing-subscriber) |

pub mod cancel;
pub mod config;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod schema;
pub mod service;

pub use cancel::CancellationToken;
pub use config::{ExtractionConfig, ExtractionConfigBuilder, PageSelection};
pub use dataset::{Dataset, Record};
pub use error::{PageError, ServiceError, StatementError};
pub use extract::{extract, extract_from_bytes, extract_pages, extract_sync, extract_to_file};
pub use output::{ExtractionStats, PageReport, PageResult, PageStatus, StatementOutput};
pub use pipeline::render::PageImage;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::{detect_schema, FieldSchema};
pub use service::http::NanonetsClient;
pub use service::{ExtractionService, JobStatus};
