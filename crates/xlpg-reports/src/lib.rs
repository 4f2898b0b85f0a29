//! Report outputs built from the database or a workbook: schema-metadata
//! and table-preview workbooks, and per-sheet PDF exports.

use std::collections::HashSet;
use std::path::PathBuf;

use rust_xlsxwriter::{Format, Workbook, XlsxError};

pub mod pdf;
pub mod preview;
pub mod schema_dump;

pub use pdf::{ConversionRun, PdfExportConfig, PdfExportError, SheetPdfExporter};
pub use preview::export_table_previews;
pub use schema_dump::{export_schema_metadata, fetch_column_metadata, ColumnMetadata};

pub const CRATE_NAME: &str = "xlpg-reports";

/// Excel refuses longer worksheet names.
pub const MAX_SHEET_NAME_CHARS: usize = 31;

const FORBIDDEN_SHEET_CHARS: [char; 7] = ['[', ']', ':', '*', '?', '/', '\\'];

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub export_path: PathBuf,
    /// Schemas covered by the metadata dumps.
    pub schemas: Vec<String>,
    /// Schema whose tables are previewed.
    pub preview_schema: String,
}

impl ExportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let schemas = get("SCHEMAS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec!["public".to_string()]);
        Self {
            export_path: get("EXPORT_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            schemas,
            preview_schema: get("SCHEMA_NAME").unwrap_or_else(|| "public".to_string()),
        }
    }
}

/// A worksheet name Excel accepts: forbidden characters replaced, no
/// surrounding apostrophes, at most 31 characters, never blank.
pub fn excel_sheet_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if FORBIDDEN_SHEET_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'');
    let cut: String = cleaned.chars().take(MAX_SHEET_NAME_CHARS).collect();
    if cut.trim().is_empty() {
        "Sheet".to_string()
    } else {
        cut
    }
}

/// Hands out worksheet names that are unique within one workbook. Excel
/// compares names case-insensitively.
#[derive(Debug, Default)]
pub struct SheetNamer {
    used: HashSet<String>,
}

impl SheetNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_for(&mut self, raw: &str) -> String {
        let base = excel_sheet_name(raw);
        if self.used.insert(base.to_lowercase()) {
            return base;
        }
        let mut n = 2usize;
        loop {
            let suffix = format!("~{n}");
            let keep = MAX_SHEET_NAME_CHARS - suffix.chars().count();
            let candidate = format!("{}{}", base.chars().take(keep).collect::<String>(), suffix);
            if self.used.insert(candidate.to_lowercase()) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Header row in bold, then one row per record; `None` leaves the cell blank.
pub fn write_table_sheet<H, R>(
    workbook: &mut Workbook,
    name: &str,
    headers: H,
    rows: R,
) -> Result<(), XlsxError>
where
    H: IntoIterator,
    H::Item: AsRef<str>,
    R: IntoIterator<Item = Vec<Option<String>>>,
{
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(name)?;
    for (col, header) in headers.into_iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, header.as_ref(), &bold)?;
    }
    for (idx, row) in rows.into_iter().enumerate() {
        let row_no = idx as u32 + 1;
        for (col, value) in row.into_iter().enumerate() {
            if let Some(value) = value {
                sheet.write_string(row_no, col as u16, value)?;
            }
        }
    }
    sheet.autofit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sheet_names_are_cleaned_and_cut() {
        assert_eq!(excel_sheet_name("public.vendor_search_results_2025_q1"), "public.vendor_search_results_20");
        assert_eq!(excel_sheet_name("ppt.[weird]/name?"), "ppt._weird__name_");
        assert_eq!(excel_sheet_name("'quoted'"), "quoted");
        assert_eq!(excel_sheet_name("   "), "Sheet");
    }

    #[test]
    fn namer_disambiguates_truncated_collisions() {
        let mut namer = SheetNamer::new();
        let a = namer.name_for("public.vendor_search_results_2025_q1");
        let b = namer.name_for("public.vendor_search_results_2025_q2");
        let c = namer.name_for("PUBLIC.VENDOR_SEARCH_RESULTS_2025_Q3");
        assert_eq!(a, "public.vendor_search_results_20");
        assert_eq!(b, "public.vendor_search_results_~2");
        assert_eq!(c, "PUBLIC.VENDOR_SEARCH_RESULTS_~3");
        assert!(c.chars().count() <= MAX_SHEET_NAME_CHARS);
    }

    #[test]
    fn export_config_defaults() {
        let config = ExportConfig::from_lookup(|_| None);
        assert_eq!(config.schemas, vec!["public"]);
        assert_eq!(config.preview_schema, "public");
        assert_eq!(config.export_path, PathBuf::from("."));

        let config = ExportConfig::from_lookup(|name| match name {
            "SCHEMAS" => Some("public, analytics".to_string()),
            _ => None,
        });
        assert_eq!(config.schemas, vec!["public", "analytics"]);
    }
}
