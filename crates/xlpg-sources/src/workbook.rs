use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader, Sheets};
use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;
use xlpg_core::{CellValue, SheetTable};

use crate::{table_from_grid, SourceError, TableSource};

/// An opened `.xlsx`/`.xlsm`/`.xls`/`.ods` workbook.
pub struct WorkbookSource {
    path: PathBuf,
    workbook: Sheets<BufReader<File>>,
    sheet_names: Vec<String>,
}

impl std::fmt::Debug for WorkbookSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkbookSource")
            .field("path", &self.path)
            .field("sheet_names", &self.sheet_names)
            .finish()
    }
}

impl WorkbookSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let workbook = open_workbook_auto(&path).map_err(|e| SourceError::Workbook {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let sheet_names = workbook.sheet_names().to_vec();
        debug!(path = %path.display(), sheets = ?sheet_names, "opened workbook");
        Ok(Self {
            path,
            workbook,
            sheet_names,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw cell grid of the sheet's used range.
    pub fn read_grid(&mut self, sheet: &str) -> Result<Vec<Vec<CellValue>>, SourceError> {
        if !self.sheet_names.iter().any(|s| s == sheet) {
            return Err(SourceError::SheetNotFound {
                sheet: sheet.to_string(),
                available: self.sheet_names.clone(),
            });
        }
        let range = self
            .workbook
            .worksheet_range(sheet)
            .map_err(|e| SourceError::Sheet {
                sheet: sheet.to_string(),
                message: e.to_string(),
            })?;
        Ok(range
            .rows()
            .map(|row| row.iter().map(cell_from_data).collect())
            .collect())
    }
}

impl TableSource for WorkbookSource {
    fn sheet_names(&self) -> Vec<String> {
        self.sheet_names.clone()
    }

    fn read_table(&mut self, sheet: &str) -> Result<SheetTable, SourceError> {
        let grid = self.read_grid(sheet)?;
        Ok(table_from_grid(sheet, grid))
    }
}

fn parse_iso_cell(text: &str) -> CellValue {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return CellValue::DateTime(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return CellValue::Date(d);
    }
    CellValue::Text(text.to_string())
}

pub(crate) fn cell_from_data(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) if s.is_empty() => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(v) => CellValue::Int(*v),
        Data::Float(v) => CellValue::Float(*v),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) if dt.is_duration() => CellValue::Float(dt.as_f64()),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Float(dt.as_f64())),
        Data::DateTimeIso(s) => parse_iso_cell(s),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
        // Formula errors (#N/A, #DIV/0!) read as missing values.
        Data::Error(_) => CellValue::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_cells_map_onto_cell_values() {
        assert_eq!(cell_from_data(&Data::Empty), CellValue::Empty);
        assert_eq!(cell_from_data(&Data::String(String::new())), CellValue::Empty);
        assert_eq!(
            cell_from_data(&Data::String("WA".into())),
            CellValue::Text("WA".into())
        );
        assert_eq!(cell_from_data(&Data::Float(1.5)), CellValue::Float(1.5));
        assert_eq!(cell_from_data(&Data::Bool(true)), CellValue::Bool(true));
    }

    #[test]
    fn iso_strings_parse_as_dates_when_possible() {
        assert!(matches!(
            cell_from_data(&Data::DateTimeIso("2025-01-31T10:00:00".into())),
            CellValue::DateTime(_)
        ));
        assert!(matches!(
            cell_from_data(&Data::DateTimeIso("2025-01-31".into())),
            CellValue::Date(_)
        ));
        assert_eq!(
            cell_from_data(&Data::DateTimeIso("not a date".into())),
            CellValue::Text("not a date".into())
        );
    }

    #[test]
    fn opening_a_missing_workbook_is_a_workbook_error() {
        let err = WorkbookSource::open("/definitely/not/here.xlsx").expect_err("missing file");
        assert!(matches!(err, SourceError::Workbook { .. }));
    }
}
