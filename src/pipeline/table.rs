//! HTML table reader shared by schema detection and normalization.
//!
//! The extraction service embeds tables as raw `<table>` markup inside its
//! Markdown output. We only need a grid of cell texts plus the header row,
//! so the reader is deliberately small: every `<tr>` becomes a row, `th` and
//! `td` cells become text (whitespace collapsed), and `colspan` repeats the
//! cell so columns stay aligned.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

// Selector::parse() only fails on invalid CSS; these are constants.
static TABLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("th, td").unwrap());

/// Upper bound on `colspan` so a malformed attribute cannot explode a row.
const MAX_COLSPAN: usize = 64;

/// One parsed `<table>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlTable {
    /// Text of the first row.
    pub header: Vec<String>,
    /// True when the first row is marked up as a header (`<th>` or `<thead>`).
    pub header_marked: bool,
    /// Remaining rows, in document order.
    pub rows: Vec<Vec<String>>,
}

impl HtmlTable {
    /// Widest row, header included.
    pub fn column_count(&self) -> usize {
        self.rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(self.header.len()))
            .max()
            .unwrap_or(0)
    }
}

/// Parse every `<table>` in `content`, in document order.
///
/// Tables without any non-empty row are skipped.
pub fn parse_html_tables(content: &str) -> Vec<HtmlTable> {
    let document = Html::parse_fragment(content);
    document
        .select(&TABLE_SELECTOR)
        .filter_map(parse_table)
        .collect()
}

fn parse_table(table: ElementRef<'_>) -> Option<HtmlTable> {
    let mut rows = table
        .select(&ROW_SELECTOR)
        .map(|row| (row_is_header(row), row_cells(row)))
        .filter(|(_, cells)| !cells.is_empty());

    let (header_marked, header) = rows.next()?;
    Some(HtmlTable {
        header,
        header_marked,
        rows: rows.map(|(_, cells)| cells).collect(),
    })
}

fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    let mut cells = Vec::new();
    for cell in row.select(&CELL_SELECTOR) {
        let text = collapse_whitespace(&cell.text().collect::<String>());
        let span = cell
            .value()
            .attr("colspan")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_COLSPAN);
        for _ in 0..span {
            cells.push(text.clone());
        }
    }
    cells
}

fn row_is_header(row: ElementRef<'_>) -> bool {
    let in_thead = row
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|el| el.value().name() == "thead");
    in_thead
        || row
            .select(&CELL_SELECTOR)
            .any(|cell| cell.value().name() == "th")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
