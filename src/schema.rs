//! Field schema: the ordered column set every page is normalized into.
//!
//! The schema is detected once per document from the sample (first) page
//! and is immutable afterwards. Alongside the canonical names it carries a
//! [`KeyMap`] of the case/spacing variants the service tends to emit for the
//! same label (`opening balance`, `opening_balance`, `openingbalance`), used
//! both to repair raw text and to resolve keys during normalization.

use crate::error::StatementError;
use crate::pipeline::table::parse_html_tables;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered, distinct field names.
#[derive(Clone)]
pub struct FieldSchema {
    fields: Vec<String>,
    key_map: Arc<KeyMap>,
}

impl FieldSchema {
    /// Build a schema from caller-supplied names.
    ///
    /// Names are trimmed; an empty list, an empty name or a repeated name is
    /// rejected.
    pub fn from_fields<I, S>(fields: I) -> Result<Self, StatementError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| f.as_ref().trim().to_string())
            .collect();
        if fields.is_empty() {
            return Err(StatementError::InvalidConfig(
                "field schema must contain at least one field".into(),
            ));
        }
        for (i, f) in fields.iter().enumerate() {
            if f.is_empty() {
                return Err(StatementError::InvalidConfig(format!(
                    "field {} of the schema is empty",
                    i + 1
                )));
            }
            if fields[..i].contains(f) {
                return Err(StatementError::InvalidConfig(format!(
                    "field '{f}' appears more than once in the schema"
                )));
            }
        }
        Ok(Self::new_unchecked(fields))
    }

    fn new_unchecked(fields: Vec<String>) -> Self {
        let key_map = Arc::new(KeyMap::new(&fields));
        Self { fields, key_map }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn key_map(&self) -> &KeyMap {
        &self.key_map
    }

    /// Position of the field a raw key or header label refers to.
    ///
    /// Exact canonical names win; otherwise the label is matched against the
    /// case/spacing variants of every field.
    pub fn resolve(&self, label: &str) -> Option<usize> {
        let label = label.trim();
        if let Some(i) = self.fields.iter().position(|f| f == label) {
            return Some(i);
        }
        self.key_map.lookup(label)
    }

    /// Comma-joined list, as sent in the `specified_fields` form field.
    pub fn joined(&self) -> String {
        self.fields.join(", ")
    }
}

impl PartialEq for FieldSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for FieldSchema {}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FieldSchema").field(&self.fields).finish()
    }
}

impl fmt::Display for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

impl Serialize for FieldSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.fields)
    }
}

impl<'de> Deserialize<'de> for FieldSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Vec::<String>::deserialize(deserializer)?;
        FieldSchema::from_fields(fields).map_err(serde::de::Error::custom)
    }
}

// ── Key map ──────────────────────────────────────────────────────────────

/// Case/spacing variants of each field, pointing back to the canonical name.
pub struct KeyMap {
    /// variant → field position
    variants: HashMap<String, usize>,
    /// canonical names, indexed by position
    canonical: Vec<String>,
    /// Alternation of every variant that differs from its canonical name,
    /// longest first so the longest label wins at a given offset.
    pattern: Option<Regex>,
}

impl KeyMap {
    fn new(fields: &[String]) -> Self {
        let mut variants: HashMap<String, usize> = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            for v in variants_of(field) {
                variants.entry(v).or_insert(i);
            }
        }

        let mut rewritable: Vec<&str> = variants
            .iter()
            .filter(|(v, &i)| **v != fields[i])
            .map(|(v, _)| v.as_str())
            .collect();
        rewritable.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

        let pattern = if rewritable.is_empty() {
            None
        } else {
            let alternation = rewritable
                .iter()
                .map(|v| regex::escape(v))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&alternation).ok()
        };

        Self {
            variants,
            canonical: fields.to_vec(),
            pattern,
        }
    }

    fn lookup(&self, label: &str) -> Option<usize> {
        variants_of(label)
            .into_iter()
            .find_map(|v| self.variants.get(&v).copied())
    }

    /// Rewrite every whole-token occurrence of a field variant to its
    /// canonical spelling.
    ///
    /// A match counts only when the characters on either side are not
    /// alphanumeric or `_`, so `update` is left alone for a field `Date`.
    pub fn repair<'a>(&self, content: &'a str) -> Cow<'a, str> {
        let Some(pattern) = &self.pattern else {
            return Cow::Borrowed(content);
        };

        let mut out = String::new();
        let mut last = 0;
        let mut at = 0;
        while let Some(m) = pattern.find_at(content, at) {
            let accepted = is_token(content, m.start(), m.end())
                .then(|| self.variants.get(m.as_str()))
                .flatten();
            let Some(&idx) = accepted else {
                // A shorter variant may start inside the rejected span.
                at = m.start() + content[m.start()..].chars().next().map_or(1, char::len_utf8);
                continue;
            };
            out.push_str(&content[last..m.start()]);
            out.push_str(&self.canonical[idx]);
            last = m.end();
            at = m.end();
        }

        if last == 0 {
            Cow::Borrowed(content)
        } else {
            out.push_str(&content[last..]);
            Cow::Owned(out)
        }
    }
}

impl fmt::Debug for KeyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMap")
            .field("variants", &self.variants.len())
            .finish()
    }
}

/// lower-case, snake_case and space-stripped spellings of a label.
fn variants_of(label: &str) -> [String; 3] {
    let lower = label.trim().to_lowercase();
    let snake = lower.replace(' ', "_");
    let nospace = lower.replace(' ', "");
    [lower, snake, nospace]
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_token(s: &str, start: usize, end: usize) -> bool {
    let before = s[..start].chars().next_back();
    let after = s[end..].chars().next();
    !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
}

// ── Detection ────────────────────────────────────────────────────────────

/// Derive the field schema from the sample page's table-mode response.
///
/// Every embedded HTML table is parsed and the widest one (first wins on a
/// tie) supplies the column labels. Empty labels become `Unnamed: {i}` and
/// repeats get a `.1`, `.2` … suffix so the schema stays distinct.
///
/// # Errors
/// [`StatementError::SchemaDetection`] when the response holds no table or
/// the widest table has no columns.
pub fn detect_schema(sample_content: &str) -> Result<FieldSchema, StatementError> {
    let tables = parse_html_tables(sample_content);
    if tables.is_empty() {
        return Err(StatementError::SchemaDetection {
            reason: "no <table> found in the sample page response".into(),
        });
    }
    debug!("Sample page holds {} table(s)", tables.len());

    let mut widest = &tables[0];
    for t in &tables[1..] {
        if t.column_count() > widest.column_count() {
            widest = t;
        }
    }

    let width = widest.column_count();
    if width == 0 {
        return Err(StatementError::SchemaDetection {
            reason: "the widest table has zero columns".into(),
        });
    }

    let mut fields: Vec<String> = Vec::with_capacity(width);
    for i in 0..width {
        let label = widest
            .header
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Unnamed: {i}"));
        fields.push(dedupe_label(&fields, label));
    }

    info!("Fields detected: {}", fields.join(", "));
    Ok(FieldSchema::new_unchecked(fields))
}

fn dedupe_label(existing: &[String], label: String) -> String {
    if !existing.contains(&label) {
        return label;
    }
    (1..)
        .map(|n| format!("{label}.{n}"))
        .find(|candidate| !existing.contains(candidate))
        .unwrap_or(label)
}
