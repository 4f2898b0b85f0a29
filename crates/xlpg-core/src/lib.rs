//! Tabular model shared by every xlpg tool: cell values, sheet tables,
//! column-name normalization and the content hash used for change detection.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "xlpg-core";

/// Columns maintained by the sync itself; never hashed, never taken from a sheet.
pub const AUDIT_COLUMNS: [&str; 3] = ["created_at", "updated_at", "row_hash"];

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Largest magnitude at which a float is still rendered as an integer.
const INTEGRAL_LIMIT: f64 = 1e15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Stable textual form used for row hashing. Two runs over the same data
    /// must produce byte-identical output here.
    pub fn canonical(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Int(v) => v.to_string(),
            CellValue::Float(v) if v.fract() == 0.0 && v.abs() < INTEGRAL_LIMIT => format!("{v:.0}"),
            CellValue::Float(v) => format_significant(*v, 10),
            CellValue::Bool(true) => "True".to_string(),
            CellValue::Bool(false) => "False".to_string(),
            CellValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    /// Text literal bound into SQL and cast server-side to the column type.
    pub fn sql_text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Text(s) => Some(s.clone()),
            CellValue::Int(v) => Some(v.to_string()),
            CellValue::Float(v) if v.is_nan() => None,
            CellValue::Float(v) => Some(render_float(*v)),
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            CellValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Human-facing rendering for CSV exports and printed tables.
    pub fn display_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.clone(),
            CellValue::Float(v) if v.is_nan() => String::new(),
            CellValue::Float(v) => render_float(*v),
            CellValue::Bool(true) => "True".to_string(),
            CellValue::Bool(false) => "False".to_string(),
            CellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            other => other.canonical(),
        }
    }

    /// Key columns are compared as trimmed text, whatever the cell type.
    pub fn into_key_text(self) -> CellValue {
        match self {
            CellValue::Empty => CellValue::Empty,
            CellValue::Float(v) if v.is_nan() => CellValue::Empty,
            other => {
                let text = other.canonical();
                if text.is_empty() {
                    CellValue::Empty
                } else {
                    CellValue::Text(text)
                }
            }
        }
    }
}

fn render_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < INTEGRAL_LIMIT {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

fn trim_fraction(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

/// `%g`-style rendering with `digits` significant digits: trailing zeros
/// dropped, scientific notation outside `1e-4 <= |v| < 10^digits`.
pub fn format_significant(value: f64, digits: usize) -> String {
    if value.is_nan() {
        return String::new();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let digits = digits.max(1);
    let sci = format!("{:.*e}", digits - 1, value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}"))
    }
}

/// SHA-256 over the canonical cells joined with `|`, lowercase hex.
pub fn row_hash<'a>(cells: impl IntoIterator<Item = &'a CellValue>) -> String {
    let joined = cells
        .into_iter()
        .map(CellValue::canonical)
        .collect::<Vec<_>>()
        .join("|");
    sha256_hex(joined.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Trim, spaces to underscores, lowercase.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim().replace(' ', "_").to_lowercase()
}

/// Normalize a header row. Blank headers become `Unnamed: <index>`, repeated
/// raw headers get `.1`, `.2`, ... suffixes, then every name is normalized.
/// Names that only collide after normalization get the next free suffix,
/// skipping names a later column already holds.
pub fn normalize_columns(raw: &[String]) -> Vec<String> {
    let mut suffixed: Vec<String> = Vec::with_capacity(raw.len());
    for (idx, header) in raw.iter().enumerate() {
        let base = if header.trim().is_empty() {
            format!("Unnamed: {idx}")
        } else {
            header.clone()
        };
        let name = next_free(&base, |c| suffixed.contains(c));
        suffixed.push(name);
    }

    let normalized: Vec<String> = suffixed.iter().map(|h| normalize_column_name(h)).collect();
    let mut out: Vec<String> = Vec::with_capacity(normalized.len());
    for (idx, name) in normalized.iter().enumerate() {
        let name = if out.contains(name) {
            let later = &normalized[idx + 1..];
            next_free(name, |c| out.contains(c) || later.contains(c))
        } else {
            name.clone()
        };
        out.push(name);
    }
    out
}

fn next_free(base: &str, taken: impl Fn(&String) -> bool) -> String {
    let mut candidate = base.to_string();
    let mut n = 1;
    while taken(&candidate) {
        candidate = format!("{base}.{n}");
        n += 1;
    }
    candidate
}

pub fn is_audit_column(name: &str) -> bool {
    AUDIT_COLUMNS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl SheetTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Pad or cut every row to the header width.
    pub fn squared(mut self) -> Self {
        let width = self.columns.len();
        for row in &mut self.rows {
            row.resize(width, CellValue::Empty);
        }
        self
    }

    pub fn with_normalized_columns(mut self) -> Self {
        self.columns = normalize_columns(&self.columns);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Date,
}

impl ColumnType {
    pub fn pg_type(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::BigInt => "bigint",
            ColumnType::Double => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
        }
    }

    fn of_cell(cell: &CellValue) -> Option<ColumnType> {
        match cell {
            CellValue::Empty => None,
            CellValue::Float(v) if v.is_nan() => None,
            CellValue::Text(s) if s.trim().is_empty() => None,
            CellValue::Text(_) => Some(ColumnType::Text),
            CellValue::Int(_) => Some(ColumnType::BigInt),
            CellValue::Float(v) if v.fract() == 0.0 && v.abs() < INTEGRAL_LIMIT => {
                Some(ColumnType::BigInt)
            }
            CellValue::Float(_) => Some(ColumnType::Double),
            CellValue::Bool(_) => Some(ColumnType::Boolean),
            CellValue::DateTime(_) => Some(ColumnType::Timestamp),
            CellValue::Date(_) => Some(ColumnType::Date),
        }
    }

    fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Double) | (Double, BigInt) => Double,
            (Timestamp, Date) | (Date, Timestamp) => Timestamp,
            _ => Text,
        }
    }

    /// Narrowest type that holds every non-empty cell; all-empty is text.
    pub fn infer<'a>(cells: impl IntoIterator<Item = &'a CellValue>) -> ColumnType {
        cells
            .into_iter()
            .filter_map(ColumnType::of_cell)
            .reduce(ColumnType::widen)
            .unwrap_or(ColumnType::Text)
    }
}

/// Double-quote an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Cut to at most `max_bytes` without splitting a character.
pub fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// `uq_<table>_<key1>_<key2>`, trimmed so PostgreSQL stores the same name we look up.
pub fn constraint_name(table: &str, keys: &[String]) -> String {
    let full = format!("uq_{}_{}", table, keys.join("_"));
    truncate_on_char_boundary(&full, MAX_IDENTIFIER_BYTES).to_string()
}
