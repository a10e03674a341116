//! Result merging: per-page outcomes → one deduplicated dataset.
//!
//! Pages are consumed in page order. Each successful page is normalized,
//! its rows are tagged with `page` and a page-local 1-based `row_number`,
//! and then appended. A row whose schema values match an earlier row is a
//! duplicate and is dropped; the first occurrence keeps its tags. Failed and
//! empty pages contribute no rows but always appear in the page manifest.

use crate::dataset::{Dataset, Record};
use crate::output::{PageReport, PageResult, PageStatus};
use crate::pipeline::normalize::{normalize_page, Row};
use crate::schema::FieldSchema;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    pub pages: Vec<PageReport>,
    pub duplicates_removed: usize,
}

/// Normalize every successful page and merge the rows.
///
/// `results` must already be in page order, which is what the orchestrator
/// returns.
pub fn merge_pages(schema: &FieldSchema, results: &[PageResult]) -> MergeOutcome {
    let mut seen: HashSet<Row> = HashSet::new();
    let mut records = Vec::new();
    let mut pages = Vec::with_capacity(results.len());
    let mut duplicates_removed = 0;

    for result in results {
        let status = match &result.outcome {
            Ok(content) => {
                let page = normalize_page(content, schema);
                let row_count = page.rows.len();

                for (i, values) in page.rows.into_iter().enumerate() {
                    if seen.contains(&values) {
                        duplicates_removed += 1;
                        continue;
                    }
                    seen.insert(values.clone());
                    records.push(Record {
                        page: result.page_num,
                        row_number: i + 1,
                        values,
                    });
                }

                debug!("Page {}: {} row(s) normalized", result.page_num, row_count);
                PageStatus::Extracted {
                    rows: row_count,
                    strategies: page.matched,
                }
            }
            Err(error) => PageStatus::Failed {
                error: error.clone(),
            },
        };

        pages.push(PageReport {
            page_num: result.page_num,
            record_id: result.record_id.clone(),
            status,
        });
    }

    info!(
        "Merged {} page(s) into {} row(s), {} duplicate(s) removed",
        results.len(),
        records.len(),
        duplicates_removed
    );

    MergeOutcome {
        dataset: Dataset {
            columns: schema.clone(),
            records,
        },
        pages,
        duplicates_removed,
    }
}
