//! Readers that turn files into [`SheetTable`]s: Excel workbooks, directories
//! of exported CSVs, and the fixed-width spend report layout.

use std::path::PathBuf;

use thiserror::Error;
use xlpg_core::{CellValue, SheetTable};

pub mod csv_table;
pub mod fixed_width;
pub mod workbook;

pub use csv_table::{table_to_csv_bytes, CsvDirectorySource};
pub use workbook::WorkbookSource;

pub const CRATE_NAME: &str = "xlpg-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open workbook {path}: {message}")]
    Workbook { path: PathBuf, message: String },
    #[error("sheet '{sheet}' not found; available: {available:?}")]
    SheetNotFound {
        sheet: String,
        available: Vec<String>,
    },
    #[error("reading sheet '{sheet}': {message}")]
    Sheet { sheet: String, message: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid file pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },
}

/// Anything that exposes named tables.
pub trait TableSource {
    fn sheet_names(&self) -> Vec<String>;

    fn read_table(&mut self, sheet: &str) -> Result<SheetTable, SourceError>;

    fn has_sheet(&self, sheet: &str) -> bool {
        self.sheet_names().iter().any(|s| s == sheet)
    }
}

/// First row is the header; fully blank data rows are discarded.
pub fn table_from_grid(name: &str, grid: Vec<Vec<CellValue>>) -> SheetTable {
    let mut rows = grid.into_iter();
    let Some(header) = rows.next() else {
        return SheetTable::new(name, Vec::new());
    };
    let columns = header.iter().map(CellValue::display_text).collect::<Vec<_>>();
    let mut table = SheetTable::new(name, columns);
    table.rows = rows
        .filter(|row| row.iter().any(|cell| !cell.is_empty()))
        .collect();
    table.squared()
}
