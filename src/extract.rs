//! Top-level extraction entry points.
//!
//! ```text
//! input ─▶ resolve ─▶ render ─▶ sample page ─▶ schema ─▶ orchestrate ─▶ merge
//! ```
//!
//! Every function returns `Ok(StatementOutput)` even when some pages failed;
//! failed pages are listed in [`StatementOutput::pages`]. Call
//! [`StatementOutput::into_result`] to treat any page failure as an error.

use crate::config::ExtractionConfig;
use crate::error::StatementError;
use crate::output::{ExtractionStats, PageStatus, StatementOutput};
use crate::pipeline::input::{self, ResolvedInput};
use crate::pipeline::merge;
use crate::pipeline::orchestrator::{JobOrchestrator, OrchestratorSettings};
use crate::pipeline::render::{self, PageImage, RenderOptions};
use crate::schema::{detect_schema, FieldSchema};
use crate::service::http::NanonetsClient;
use crate::service::ExtractionService;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Fallback prefix for uploaded page images when the input has no name.
const DEFAULT_DOCUMENT_NAME: &str = "statement";

/// Extract the transaction table of a PDF statement (path or URL).
///
/// # Errors
/// Only fatal errors: unreadable input, bad PDF, service not configured,
/// failed sample page or no detectable schema.
pub async fn extract(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<StatementOutput, StatementError> {
    let started = Instant::now();
    let input = input.as_ref();
    info!("Starting extraction: {}", input);

    let resolved = input::resolve_input(input, config.download_timeout_secs).await?;
    extract_resolved(&resolved, config, started).await
}

/// Extract from an in-memory PDF.
///
/// # Example
/// ```rust,no_run
/// use statement_extract::{extract_from_bytes, ExtractionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes = std::fs::read("statement.pdf")?;
/// let output = extract_from_bytes(&bytes, &ExtractionConfig::default()).await?;
/// print!("{}", output.dataset.to_csv_string()?);
/// # Ok(())
/// # }
/// ```
pub async fn extract_from_bytes(
    bytes: &[u8],
    config: &ExtractionConfig,
) -> Result<StatementOutput, StatementError> {
    let started = Instant::now();
    let name = config
        .document_name
        .as_deref()
        .unwrap_or(DEFAULT_DOCUMENT_NAME);
    let resolved = input::spill_bytes(bytes, name).await?;
    extract_resolved(&resolved, config, started).await
}

/// Run the extraction on pages that are already rendered.
///
/// The first page is the schema sample unless `config.fields` is set.
pub async fn extract_pages(
    pages: Vec<PageImage>,
    config: &ExtractionConfig,
) -> Result<StatementOutput, StatementError> {
    let started = Instant::now();
    let name = config
        .document_name
        .as_deref()
        .unwrap_or(DEFAULT_DOCUMENT_NAME);
    let service = resolve_service(config, name)?;

    let mut output = run_pipeline(service, pages, config).await?;
    output.stats.total_duration_ms = started.elapsed().as_millis() as u64;
    Ok(output)
}

/// Extract and write the dataset as CSV to `output_path`.
///
/// Writes to a temp file and renames it, so a crash never leaves a
/// truncated CSV behind.
pub async fn extract_to_file(
    input: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionStats, StatementError> {
    let output = extract(input, config).await?;
    let path = output_path.as_ref();
    let write_failed = |e| StatementError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
    }

    let csv = output.dataset.to_csv_string()?;
    let tmp_path = path.with_extension("csv.tmp");
    tokio::fs::write(&tmp_path, csv).await.map_err(write_failed)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_failed)?;

    info!("Wrote {} row(s) to {}", output.stats.total_rows, path.display());
    Ok(output.stats)
}

/// Blocking wrapper around [`extract`]; builds its own tokio runtime.
pub fn extract_sync(
    input: impl AsRef<str>,
    config: &ExtractionConfig,
) -> Result<StatementOutput, StatementError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| StatementError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

async fn extract_resolved(
    resolved: &ResolvedInput,
    config: &ExtractionConfig,
    started: Instant,
) -> Result<StatementOutput, StatementError> {
    let pdf_path = resolved.path();
    let service = resolve_service(config, &resolved.document_name())?;

    let total_pages = render::page_count(pdf_path, config.password.as_deref()).await?;
    if total_pages == 0 {
        return Err(StatementError::NoPages);
    }

    let page_indices = config.pages.to_indices(total_pages);
    if page_indices.is_empty() {
        return Err(StatementError::PageOutOfRange {
            page: config.pages.max_page().unwrap_or(0),
            total: total_pages,
        });
    }
    debug!("Selected {} of {} pages", page_indices.len(), total_pages);

    let render_start = Instant::now();
    let options = RenderOptions {
        dpi: config.dpi,
        max_rendered_pixels: config.max_rendered_pixels,
        password: config.password.clone(),
    };
    let images = render::render_pages(pdf_path, &options, &page_indices).await?;
    let render_duration_ms = render_start.elapsed().as_millis() as u64;
    info!("Rendered {} pages in {}ms", images.len(), render_duration_ms);

    let mut output = run_pipeline(service, images, config).await?;
    output.stats.render_duration_ms = render_duration_ms;
    output.stats.total_duration_ms = started.elapsed().as_millis() as u64;
    Ok(output)
}

/// Pick the extraction service: a pre-built one from the config, else a
/// Nanonets client from the API key.
fn resolve_service(
    config: &ExtractionConfig,
    document_name: &str,
) -> Result<Arc<dyn ExtractionService>, StatementError> {
    if let Some(service) = &config.service {
        return Ok(Arc::clone(service));
    }

    let client = NanonetsClient::from_config(config)?;
    let client = match config.document_name {
        Some(_) => client,
        None => client.with_document_name(document_name),
    };
    Ok(Arc::new(client))
}

async fn run_pipeline(
    service: Arc<dyn ExtractionService>,
    pages: Vec<PageImage>,
    config: &ExtractionConfig,
) -> Result<StatementOutput, StatementError> {
    let Some(sample) = pages.first() else {
        return Err(StatementError::NoPages);
    };
    let total = pages.len();

    if let Some(cb) = &config.progress_callback {
        cb.on_extraction_start(total);
    }

    let schema = match &config.fields {
        Some(fields) => FieldSchema::from_fields(fields)?,
        None => {
            tokio::select! {
                biased;
                _ = config.cancellation.cancelled() => return Err(StatementError::Cancelled),
                schema = sample_schema(service.as_ref(), sample, config) => schema?,
            }
        }
    };
    if let Some(cb) = &config.progress_callback {
        cb.on_schema_ready(schema.fields());
    }

    let orchestrator = JobOrchestrator::new(service, OrchestratorSettings::from(config))
        .with_progress(config.progress_callback.clone())
        .with_cancellation(config.cancellation.clone());

    let extraction_start = Instant::now();
    let results = orchestrator.run(pages, &schema).await;
    let extraction_duration_ms = extraction_start.elapsed().as_millis() as u64;

    let merged = merge::merge_pages(&schema, &results);

    let failed_pages = merged.pages.iter().filter(|p| p.is_failed()).count();
    let empty_pages = merged
        .pages
        .iter()
        .filter(|p| matches!(p.status, PageStatus::Extracted { rows: 0, .. }))
        .count();
    let stats = ExtractionStats {
        total_pages: total,
        extracted_pages: total - failed_pages,
        failed_pages,
        empty_pages,
        total_rows: merged.dataset.len(),
        duplicate_rows: merged.duplicates_removed,
        total_duration_ms: 0,
        render_duration_ms: 0,
        extraction_duration_ms,
    };

    info!(
        "Extraction complete: {}/{} pages, {} rows, {}ms",
        stats.extracted_pages, total, stats.total_rows, extraction_duration_ms
    );
    if let Some(cb) = &config.progress_callback {
        cb.on_extraction_complete(total, stats.extracted_pages);
    }

    Ok(StatementOutput {
        schema,
        dataset: merged.dataset,
        pages: merged.pages,
        stats,
    })
}

/// Request the sample page in table mode and detect the schema from it.
async fn sample_schema(
    service: &dyn ExtractionService,
    sample: &PageImage,
    config: &ExtractionConfig,
) -> Result<FieldSchema, StatementError> {
    info!(
        "Detecting fields from page {} ({})",
        sample.page_num, config.schema_output_type
    );
    let content = service
        .extract_sync(sample, &config.schema_output_type)
        .await
        .map_err(StatementError::SamplePage)?;
    detect_schema(&content)
}
