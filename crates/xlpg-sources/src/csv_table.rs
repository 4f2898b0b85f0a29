use std::path::{Path, PathBuf};

use xlpg_core::{CellValue, SheetTable};

use crate::{SourceError, TableSource};

/// Serialize a table as CSV with a header row, optionally only its first `limit` rows.
pub fn table_to_csv_bytes(table: &SheetTable, limit: Option<usize>) -> Result<Vec<u8>, SourceError> {
    let csv_err = |source| SourceError::Csv {
        path: PathBuf::from(format!("<{}>", table.name)),
        source,
    };
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns).map_err(csv_err)?;
    let take = limit.unwrap_or(table.rows.len());
    for row in table.rows.iter().take(take) {
        writer
            .write_record(row.iter().map(CellValue::display_text))
            .map_err(csv_err)?;
    }
    writer.into_inner().map_err(|e| SourceError::Io {
        path: PathBuf::from(format!("<{}>", table.name)),
        source: e.into_error(),
    })
}

/// A folder of `<sheet>.csv` files, read back with every value as text.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    dir: PathBuf,
}

impl CsvDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sheet: &str) -> PathBuf {
        self.dir.join(format!("{sheet}.csv"))
    }
}

impl TableSource for CsvDirectorySource {
    fn sheet_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    fn read_table(&mut self, sheet: &str) -> Result<SheetTable, SourceError> {
        let path = self.path_for(sheet);
        if !path.exists() {
            return Err(SourceError::SheetNotFound {
                sheet: sheet.to_string(),
                available: self.sheet_names(),
            });
        }
        let csv_err = |source| SourceError::Csv {
            path: path.clone(),
            source,
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&path)
            .map_err(csv_err)?;
        let columns = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let mut table = SheetTable::new(sheet, columns);
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            table.rows.push(
                record
                    .iter()
                    .map(|v| {
                        if v.is_empty() {
                            CellValue::Empty
                        } else {
                            CellValue::Text(v.to_string())
                        }
                    })
                    .collect(),
            );
        }
        Ok(table.squared())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> SheetTable {
        let mut table = SheetTable::new(
            "vendors",
            vec!["uniqueid".to_string(), "amount".to_string()],
        );
        table.rows = vec![
            vec![CellValue::Text("A-1".into()), CellValue::Float(12.0)],
            vec![CellValue::Text("A, 2".into()), CellValue::Empty],
            vec![CellValue::Text("A-3".into()), CellValue::Float(0.5)],
        ];
        table
    }

    #[test]
    fn csv_bytes_quote_and_limit() {
        let bytes = table_to_csv_bytes(&sample(), Some(2)).expect("csv");
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(text, "uniqueid,amount\nA-1,12\n\"A, 2\",\n");
    }

    #[test]
    fn directory_source_reads_back_exported_tables() {
        let dir = tempdir().expect("tempdir");
        let bytes = table_to_csv_bytes(&sample(), None).expect("csv");
        std::fs::write(dir.path().join("vendors.csv"), bytes).expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"ignored").expect("write");

        let mut source = CsvDirectorySource::new(dir.path());
        assert_eq!(source.sheet_names(), vec!["vendors"]);
        assert!(source.has_sheet("vendors"));

        let table = source.read_table("vendors").expect("read");
        assert_eq!(table.columns, vec!["uniqueid", "amount"]);
        assert_eq!(table.rows[0][1], CellValue::Text("12".into()));
        assert_eq!(table.rows[1][1], CellValue::Empty);

        let err = source.read_table("missing").expect_err("missing");
        assert!(matches!(err, SourceError::SheetNotFound { .. }));
    }
}
