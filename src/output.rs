//! Result types returned by the extraction entry points.

use crate::dataset::Dataset;
use crate::error::{PageError, StatementError};
use crate::pipeline::normalize::NormalizeStrategy;
use crate::schema::FieldSchema;
use serde::{Deserialize, Serialize};

/// Outcome of one page's remote job, as produced by the orchestrator.
///
/// `outcome` holds the raw service content on success. A failed page never
/// mixes an error marker into the content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-based page number.
    pub page_num: usize,
    /// Remote identifier, once the job was accepted.
    pub record_id: Option<String>,
    /// Status requests issued for the job.
    pub polls: u32,
    /// Wall-clock time from admission check to resolution.
    pub duration_ms: u64,
    pub outcome: Result<String, PageError>,
}

impl PageResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn content(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&PageError> {
        self.outcome.as_ref().err()
    }
}

/// Per-page manifest entry so failed pages are visible next to the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageReport {
    pub page_num: usize,
    pub record_id: Option<String>,
    pub status: PageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageStatus {
    /// The job completed. `rows` counts normalized rows before
    /// deduplication; `strategies` lists the encodings recognised.
    Extracted {
        rows: usize,
        strategies: Vec<NormalizeStrategy>,
    },
    Failed { error: PageError },
}

impl PageReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, PageStatus::Failed { .. })
    }
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages selected for extraction.
    pub total_pages: usize,
    pub extracted_pages: usize,
    pub failed_pages: usize,
    /// Completed pages that yielded no rows.
    pub empty_pages: usize,
    /// Records in the final dataset.
    pub total_rows: usize,
    /// Rows dropped as exact duplicates.
    pub duplicate_rows: usize,
    pub total_duration_ms: u64,
    pub render_duration_ms: u64,
    pub extraction_duration_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOutput {
    pub schema: FieldSchema,
    pub dataset: Dataset,
    pub pages: Vec<PageReport>,
    pub stats: ExtractionStats,
}

impl StatementOutput {
    /// Pages that did not produce a result, in page order.
    pub fn failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.is_failed())
            .map(|p| p.page_num)
            .collect()
    }

    /// Treat any failed page as an error.
    ///
    /// `Ok(self)` when every page completed; otherwise
    /// [`StatementError::PartialFailure`] naming the failed pages.
    pub fn into_result(self) -> Result<Self, StatementError> {
        let failed = self.failed_pages();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(StatementError::PartialFailure {
                failed: failed.len(),
                total: self.pages.len(),
                pages: failed,
            })
        }
    }
}
