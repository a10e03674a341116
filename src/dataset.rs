//! The final table: deduplicated records in page order, plus CSV export.

use crate::error::StatementError;
use crate::schema::FieldSchema;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Column appended to every record: 1-based source page.
pub const PAGE_COLUMN: &str = "page";

/// Column appended to every record: 1-based row position within its page.
pub const ROW_NUMBER_COLUMN: &str = "row_number";

/// One row of the final dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub page: usize,
    /// Position among the page's normalized rows, before deduplication.
    pub row_number: usize,
    /// Cells aligned with the dataset's columns; `None` is an empty cell.
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: FieldSchema,
    /// Dense, 0-based; index is the row's position in the table.
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn empty(columns: FieldSchema) -> Self {
        Self {
            columns,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Schema fields followed by `page` and `row_number`.
    pub fn headers(&self) -> Vec<&str> {
        self.columns
            .fields()
            .iter()
            .map(String::as_str)
            .chain([PAGE_COLUMN, ROW_NUMBER_COLUMN])
            .collect()
    }

    /// Cell of record `index` under `field`, if both exist and the cell is set.
    pub fn value(&self, index: usize, field: &str) -> Option<&str> {
        let col = self.columns.fields().iter().position(|f| f == field)?;
        self.records.get(index)?.values.get(col)?.as_deref()
    }

    /// Write the table as UTF-8 CSV with a header row.
    pub fn to_writer<W: io::Write>(&self, writer: W) -> Result<(), StatementError> {
        let mut writer = WriterBuilder::new().from_writer(writer);
        writer.write_record(self.headers())?;

        for record in &self.records {
            let page = record.page.to_string();
            let row_number = record.row_number.to_string();
            let cells = record
                .values
                .iter()
                .map(|v| v.as_deref().unwrap_or(""))
                .chain([page.as_str(), row_number.as_str()]);
            writer.write_record(cells)?;
        }

        writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String, StatementError> {
        let mut buf = Vec::new();
        self.to_writer(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| StatementError::Internal(format!("CSV output is not UTF-8: {e}")))
    }

    /// Write the CSV to `path`, replacing any existing file.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), StatementError> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).map_err(|e| StatementError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        self.to_writer(io::BufWriter::new(file))
    }
}
