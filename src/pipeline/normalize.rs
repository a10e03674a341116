//! Response normalization: one page's raw service output → schema rows.
//!
//! The extraction service is not consistent about how it encodes a page,
//! even within one document. Four encodings have been observed:
//!
//! | Strategy | Looks like |
//! |----------|------------|
//! | [`NormalizeStrategy::HtmlTable`]        | Markdown with embedded `<table>` markup |
//! | [`NormalizeStrategy::BracketedJson`]    | `[{...}, {...}]`, often fenced and mixed with `<!-- -->` comments |
//! | [`NormalizeStrategy::LineObjects`]      | one `{...}` object literal per line |
//! | [`NormalizeStrategy::MetadataEnvelope`] | `{"metadata": {...}, "content": [...]}` |
//!
//! Before any strategy runs, field labels are repaired to their canonical
//! spelling via the schema's [`KeyMap`](crate::schema::KeyMap). Then every
//! strategy whose predicate matches is run and the rows are concatenated, so
//! a page mixing two encodings yields the union. A page matching nothing
//! yields zero rows; that is not an error.
//!
//! Parsing is lenient throughout: a fragment that fails to parse is skipped
//! and logged at `debug`, never surfaced. Partial data beats a lost page.

use crate::schema::FieldSchema;
use crate::pipeline::table::parse_html_tables;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// One normalized row: cell values aligned with the schema's fields.
pub type Row = Vec<Option<String>>;

/// Marker that disables the JSON fragment strategies; the envelope
/// strategy owns such payloads.
const METADATA_MARKER: &str = "\"metadata\"";

/// Every strategy, in the order they run.
pub const ALL_STRATEGIES: [NormalizeStrategy; 4] = [
    NormalizeStrategy::HtmlTable,
    NormalizeStrategy::BracketedJson,
    NormalizeStrategy::LineObjects,
    NormalizeStrategy::MetadataEnvelope,
];

/// A structural parser for one response encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeStrategy {
    HtmlTable,
    BracketedJson,
    LineObjects,
    MetadataEnvelope,
}

impl NormalizeStrategy {
    /// Cheap structural sniff: could this payload hold our encoding?
    pub fn matches(self, content: &str) -> bool {
        match self {
            NormalizeStrategy::HtmlTable => content.contains("<table"),
            NormalizeStrategy::BracketedJson => {
                ['[', '{', '}', ']'].iter().all(|c| content.contains(*c))
                    && !content.contains(METADATA_MARKER)
            }
            NormalizeStrategy::LineObjects => {
                content.contains('{')
                    && content.contains('}')
                    && !content.contains(METADATA_MARKER)
            }
            NormalizeStrategy::MetadataEnvelope => {
                content.contains("\"metadata") && content.contains("\"content")
            }
        }
    }

    /// Parse `content` into rows of `schema`.
    pub fn parse(self, content: &str, schema: &FieldSchema) -> Vec<Row> {
        match self {
            NormalizeStrategy::HtmlTable => parse_html_rows(content, schema),
            NormalizeStrategy::BracketedJson => parse_bracketed_json(content, schema),
            NormalizeStrategy::LineObjects => parse_line_objects(content, schema),
            NormalizeStrategy::MetadataEnvelope => parse_envelope(content, schema),
        }
    }
}

/// Rows of one page plus which strategies produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedPage {
    pub rows: Vec<Row>,
    pub matched: Vec<NormalizeStrategy>,
}

/// Normalize one page's raw response.
pub fn normalize_page(raw: &str, schema: &FieldSchema) -> NormalizedPage {
    let content = schema.key_map().repair(raw);
    let mut page = NormalizedPage::default();

    for strategy in ALL_STRATEGIES {
        if !strategy.matches(&content) {
            continue;
        }
        let rows = strategy.parse(&content, schema);
        debug!("{:?}: {} row(s)", strategy, rows.len());
        page.rows.extend(rows);
        page.matched.push(strategy);
    }

    if page.matched.is_empty() {
        debug!("No strategy matched a {}-byte response", raw.len());
    }
    page
}

// ── HTML tables ──────────────────────────────────────────────────────────

fn parse_html_rows(content: &str, schema: &FieldSchema) -> Vec<Row> {
    let mut rows = Vec::new();

    for table in parse_html_tables(content) {
        let mut mapping: Vec<Option<usize>> =
            table.header.iter().map(|h| schema.resolve(h)).collect();
        let mut body: Vec<&Vec<String>> = table.rows.iter().collect();

        // A header-less table as wide as the schema is taken positionally.
        if mapping.iter().all(Option::is_none) {
            if table.header_marked || table.column_count() != schema.len() {
                debug!(
                    "Skipping {}-column table: no header matches the schema",
                    table.column_count()
                );
                continue;
            }
            mapping = (0..schema.len()).map(Some).collect();
            body.insert(0, &table.header);
        }

        for cells in body {
            let mut row: Row = vec![None; schema.len()];
            for (value, target) in cells.iter().zip(&mapping) {
                if let Some(i) = *target {
                    if row[i].is_none() && !value.is_empty() {
                        row[i] = Some(value.clone());
                    }
                }
            }
            push_if_populated(&mut rows, row);
        }
    }

    rows
}

// ── Bracketed JSON arrays ────────────────────────────────────────────────

static RE_HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

fn parse_bracketed_json(content: &str, schema: &FieldSchema) -> Vec<Row> {
    let text = RE_HTML_COMMENT.replace_all(content, "");
    let mut rows = Vec::new();
    for value in json_arrays(&text) {
        flatten_into(&value, schema, &mut rows);
    }
    rows
}

/// Every balanced `[...]` span that parses as JSON, outermost first.
///
/// When a span does not parse, the spans nested inside it are tried next,
/// so arrays inside a broken one are still found.
fn json_arrays(text: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut next = 0;

    for (start, end) in bracket_pairs(text.as_bytes()) {
        if start < next {
            continue;
        }
        match serde_json::from_str::<Value>(&text[start..=end]) {
            Ok(value) => {
                out.push(value);
                next = end + 1;
            }
            Err(e) => debug!("Skipping unparsable array fragment: {}", e),
        }
    }

    out
}

/// Pair every `[` with its closing `]` in one pass, sorted by opening
/// position. Unclosed brackets are dropped.
///
/// Brackets inside JSON strings are ignored. Quotes only open a string
/// inside a bracket, and a raw newline ends one, so a stray quote in the
/// surrounding prose cannot hide later arrays.
fn bracket_pairs(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut open: Vec<usize> = Vec::new();
    let mut pairs = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (pos, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                b'\n' => {
                    in_string = false;
                    escaped = false;
                }
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' if !open.is_empty() => in_string = true,
            b'[' => open.push(pos),
            b']' => {
                if let Some(start) = open.pop() {
                    pairs.push((start, pos));
                }
            }
            _ => {}
        }
    }

    pairs.sort_unstable();
    pairs
}

/// Objects become rows; arrays are walked recursively; scalars are dropped.
fn flatten_into(value: &Value, schema: &FieldSchema, rows: &mut Vec<Row>) {
    match value {
        Value::Object(map) => {
            if let Some(row) = object_row(map, schema) {
                rows.push(row);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(item, schema, rows);
            }
        }
        _ => {}
    }
}

// ── Line-delimited object literals ───────────────────────────────────────

fn parse_line_objects(content: &str, schema: &FieldSchema) -> Vec<Row> {
    let mut rows = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if !(line.starts_with('{') && line.ends_with('}')) {
            continue;
        }
        match parse_object_literal(line) {
            Some(map) => {
                if let Some(row) = object_row(&map, schema) {
                    rows.push(row);
                }
            }
            None => debug!("Skipping unparsable object line: {}", line),
        }
    }

    rows
}

/// Parse a JSON object, or failing that, the single-quoted literal form
/// (`{'Date': '01/02', 'Pending': True, 'Ref': None}`).
fn parse_object_literal(line: &str) -> Option<Map<String, Value>> {
    let parsed = serde_json::from_str::<Value>(line)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&literal_to_json(line)).ok());
    match parsed {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Rewrite single-quoted literal syntax into JSON.
///
/// Handles `'...'` strings, `True` / `False` / `None`, and trailing commas.
/// Anything else passes through and is left for `serde_json` to reject.
fn literal_to_json(src: &str) -> String {
    let mut out = String::with_capacity(src.len() + 8);
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push('"');
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(next) => {
                                out.push('\\');
                                out.push(next);
                            }
                            None => out.push('\\'),
                        },
                        '"' if quote == '\'' => out.push_str("\\\""),
                        _ if ch == quote => break,
                        _ => out.push(ch),
                    }
                }
                out.push('"');
            }
            '}' | ']' => {
                let kept = out.trim_end().trim_end_matches(',').len();
                out.truncate(kept);
                out.push(c);
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            _ => out.push(c),
        }
    }

    out
}

// ── Metadata envelope ────────────────────────────────────────────────────

fn parse_envelope(content: &str, schema: &FieldSchema) -> Vec<Row> {
    let Some(envelope) = parse_envelope_value(content) else {
        debug!("Metadata envelope did not parse as JSON");
        return Vec::new();
    };

    let mut rows = Vec::new();
    match envelope.get("content") {
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::Object(map) = item {
                    if let Some(row) = object_row(map, schema) {
                        rows.push(row);
                    }
                }
            }
        }
        Some(Value::Object(map)) => rows.extend(mapping_rows(map, schema)),
        other => debug!("Envelope content is neither list nor mapping: {:?}", other),
    }
    rows
}

/// The whole payload, or the outermost `{...}` span when the service
/// wrapped the envelope in prose or a code fence.
fn parse_envelope_value(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// A mapping is one row, unless every value is a list, in which case it is
/// column-oriented (`{"Date": [..], "Amount": [..]}`) and zipped into rows.
fn mapping_rows(map: &Map<String, Value>, schema: &FieldSchema) -> Vec<Row> {
    let columnar = !map.is_empty() && map.values().all(Value::is_array);
    if !columnar {
        return object_row(map, schema).into_iter().collect();
    }

    let height = map
        .values()
        .filter_map(Value::as_array)
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    let mut rows = Vec::with_capacity(height);
    for r in 0..height {
        let mut row: Row = vec![None; schema.len()];
        for (key, column) in map {
            let (Some(i), Some(value)) = (schema.resolve(key), column.get(r)) else {
                continue;
            };
            if row[i].is_none() {
                row[i] = cell_text(value);
            }
        }
        push_if_populated(&mut rows, row);
    }
    rows
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Project an object onto the schema; keys outside it are dropped.
fn object_row(map: &Map<String, Value>, schema: &FieldSchema) -> Option<Row> {
    let mut row: Row = vec![None; schema.len()];
    for (key, value) in map {
        match schema.resolve(key) {
            Some(i) if row[i].is_none() => row[i] = cell_text(value),
            Some(_) => {}
            None => debug!("Dropping key outside the schema: {}", key),
        }
    }
    row.iter().any(Option::is_some).then_some(row)
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => serde_json::to_string(nested).ok(),
    }
}

fn push_if_populated(rows: &mut Vec<Row>, row: Row) {
    if row.iter().any(Option::is_some) {
        rows.push(row);
    }
}
