//! Sheets to `<OUTPUT_DIR>/CLEANED_CSV/<sheet>.csv`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use xlpg_core::SheetTable;
use xlpg_sources::{table_to_csv_bytes, SourceError, TableSource, WorkbookSource};
use xlpg_storage::OutputStore;

use crate::config::{lookup_nonempty, process_env, split_list};
use crate::{closest_sheet_name, SyncError};

pub const CLEANED_CSV_DIR: &str = "CLEANED_CSV";

/// Export settings; unlike the sync this needs no database.
#[derive(Debug, Clone)]
pub struct CsvExportConfig {
    pub excel_path: PathBuf,
    pub sheet_names: Vec<String>,
    pub output_dir: PathBuf,
}

impl CsvExportConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let excel = lookup_nonempty(&lookup, "EXCEL_FILE_PATH");
        let sheets = lookup_nonempty(&lookup, "SHEET_NAMES")
            .map(|raw| split_list(&raw))
            .filter(|list| !list.is_empty());
        let (Some(excel), Some(sheet_names)) = (excel.clone(), sheets.clone()) else {
            let mut missing = Vec::new();
            if excel.is_none() {
                missing.push("EXCEL_FILE_PATH".to_string());
            }
            if sheets.is_none() {
                missing.push("SHEET_NAMES".to_string());
            }
            return Err(SyncError::MissingEnv(missing));
        };
        Ok(Self {
            excel_path: PathBuf::from(excel),
            sheet_names,
            output_dir: lookup_nonempty(&lookup, "OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CsvExport {
    pub sheet: String,
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CsvExportSummary {
    pub exported: Vec<CsvExport>,
    pub skipped: Vec<String>,
}

/// Read the requested sheets; sheets absent from the workbook are skipped
/// with a warning. Headers are normalized the same way the sync does.
pub fn read_sheets(source: &mut impl TableSource, sheets: &[String]) -> Result<(Vec<SheetTable>, Vec<String>)> {
    let available = source.sheet_names();
    let mut tables = Vec::new();
    let mut skipped = Vec::new();
    for sheet in sheets {
        match source.read_table(sheet) {
            Ok(table) => tables.push(table.with_normalized_columns()),
            Err(SourceError::SheetNotFound { .. }) => {
                warn!(
                    sheet = %sheet,
                    available = ?available,
                    suggestion = ?closest_sheet_name(sheet, &available),
                    "sheet not found in workbook; skipping"
                );
                skipped.push(sheet.clone());
            }
            Err(err) => return Err(err).with_context(|| format!("reading sheet {sheet}")),
        }
    }
    Ok((tables, skipped))
}

pub async fn export_sheets_to_csv(
    excel_path: &Path,
    sheets: &[String],
    output_dir: &Path,
) -> Result<CsvExportSummary> {
    let path = excel_path.to_path_buf();
    let wanted = sheets.to_vec();
    let (tables, skipped) = tokio::task::spawn_blocking(move || -> Result<(Vec<SheetTable>, Vec<String>)> {
        let mut workbook = WorkbookSource::open(&path)?;
        read_sheets(&mut workbook, &wanted)
    })
    .await
    .context("workbook reader task panicked")??;

    let store = OutputStore::new(output_dir);
    Ok(CsvExportSummary {
        exported: write_tables(&store, &tables).await?,
        skipped,
    })
}

/// Write each table to `CLEANED_CSV/<table>.csv` under the store root.
pub async fn write_tables(store: &OutputStore, tables: &[SheetTable]) -> Result<Vec<CsvExport>> {
    let mut exported = Vec::with_capacity(tables.len());
    for table in tables {
        let bytes = table_to_csv_bytes(table, None)?;
        let stored = store
            .write_bytes(Path::new(CLEANED_CSV_DIR).join(format!("{}.csv", table.name)), &bytes)
            .await?;
        info!(
            sheet = %table.name,
            path = %stored.absolute_path.display(),
            rows = table.rows.len(),
            sha256 = %stored.sha256,
            "exported sheet"
        );
        exported.push(CsvExport {
            sheet: table.name.clone(),
            path: stored.absolute_path,
            rows: table.rows.len(),
            columns: table.width(),
            bytes: stored.byte_size,
            sha256: stored.sha256,
        });
    }
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xlpg_core::CellValue;
    use xlpg_sources::CsvDirectorySource;

    #[test]
    fn missing_sheets_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("Vendors.csv"), "Unique ID,Firm\n1,Acme\n").expect("write");
        let mut source = CsvDirectorySource::new(dir.path());

        let (tables, skipped) =
            read_sheets(&mut source, &["Vendors".to_string(), "Vendorz2".to_string()]).expect("read");
        assert_eq!(skipped, vec!["Vendorz2"]);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].columns, vec!["unique_id", "firm"]);
        assert_eq!(tables[0].rows[0][1], CellValue::Text("Acme".into()));
    }

    #[test]
    fn export_config_needs_only_workbook_settings() {
        let config = CsvExportConfig::from_lookup(|name| match name {
            "EXCEL_FILE_PATH" => Some("book.xlsx".to_string()),
            "SHEET_NAMES" => Some("Vendors, AFERS".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.sheet_names, vec!["Vendors", "AFERS"]);
        assert_eq!(config.output_dir, PathBuf::from("."));

        let err = CsvExportConfig::from_lookup(|_| None).expect_err("missing");
        assert!(matches!(err, SyncError::MissingEnv(names) if names.len() == 2));
    }

    #[tokio::test]
    async fn exported_csv_reports_digest_of_written_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut table = SheetTable::new("vendors", vec!["unique_id".to_string(), "firm".to_string()]);
        table.rows.push(vec![CellValue::Int(1), CellValue::Text("Acme".into())]);
        let store = OutputStore::new(dir.path());

        let exported = write_tables(&store, &[table]).await.expect("export");
        assert_eq!(exported.len(), 1);
        let written = std::fs::read(&exported[0].path).expect("read back");
        assert!(exported[0].path.ends_with("CLEANED_CSV/vendors.csv"));
        assert_eq!(exported[0].bytes, written.len());
        assert_eq!(exported[0].sha256.len(), 64);
        assert!(exported[0].sha256.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(exported[0].sha256, xlpg_core::sha256_hex(&written));
    }
}
