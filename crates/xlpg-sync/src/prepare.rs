//! Turns a raw sheet into rows ready for the database: normalized headers,
//! text keys, a content hash per row and an inferred column type per column.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::{info, warn};
use xlpg_core::{is_audit_column, row_hash, CellValue, ColumnType, SheetTable};

use crate::config::{SheetSpec, SyncMode};
use crate::SyncError;

/// At most this many dropped rows are kept for the inspection file.
pub const DROPPED_SAMPLE_LIMIT: usize = 100;
/// Dropped rows whose keys are echoed to the log.
pub const DROPPED_LOG_SAMPLES: usize = 3;

pub const ROW_HASH_COLUMN: &str = "row_hash";

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepareStats {
    pub rows_read: usize,
    pub rows_dropped: usize,
    pub duplicate_hashes: usize,
    pub collapsed_duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct PreparedSheet {
    pub sheet: String,
    pub table: String,
    pub mode: SyncMode,
    /// Conflict-key columns (keyed mode), normalized.
    pub keys: Vec<String>,
    /// Data columns in sheet order, audit columns excluded.
    pub columns: Vec<String>,
    pub column_types: Vec<ColumnType>,
    pub rows: Vec<Vec<CellValue>>,
    /// One hash per entry in `rows`.
    pub hashes: Vec<String>,
    /// First rows that were dropped for missing keys, with the sheet's columns.
    pub dropped_sample: Option<SheetTable>,
    pub stats: PrepareStats,
}

impl PreparedSheet {
    /// Columns named in `ON CONFLICT (...)`.
    pub fn conflict_columns(&self) -> Vec<String> {
        match self.mode {
            SyncMode::Keyed => self.keys.clone(),
            SyncMode::HashOnly => vec![ROW_HASH_COLUMN.to_string()],
        }
    }

    pub fn typed_columns(&self) -> Vec<(String, ColumnType)> {
        self.columns
            .iter()
            .cloned()
            .zip(self.column_types.iter().copied())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn prepare_sheet(table: SheetTable, spec: &SheetSpec) -> Result<PreparedSheet, SyncError> {
    let table = table.with_normalized_columns();
    let sheet = table.name.clone();
    let rows_read = table.rows.len();

    let keep: Vec<usize> = (0..table.width())
        .filter(|idx| !is_audit_column(&table.columns[*idx]))
        .collect();
    if keep.len() != table.width() {
        info!(sheet = %sheet, "ignoring audit columns present in the sheet");
    }
    let columns: Vec<String> = keep.iter().map(|i| table.columns[*i].clone()).collect();

    let keys = match spec.mode {
        SyncMode::Keyed => spec.normalized_keys(),
        SyncMode::HashOnly => Vec::new(),
    };
    let missing: Vec<String> = keys
        .iter()
        .filter(|k| !columns.contains(k))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::MissingKeyColumns {
            sheet,
            missing,
            available: columns,
        });
    }
    let key_positions: Vec<usize> = keys
        .iter()
        .filter_map(|k| columns.iter().position(|c| c == k))
        .collect();

    let mut kept_rows: Vec<Vec<CellValue>> = Vec::with_capacity(rows_read);
    let mut dropped: Vec<Vec<CellValue>> = Vec::new();
    let mut rows_dropped = 0usize;
    for row in table.rows {
        let mut cells: Vec<CellValue> = Vec::with_capacity(keep.len());
        for idx in &keep {
            cells.push(row.get(*idx).cloned().unwrap_or(CellValue::Empty));
        }
        for pos in &key_positions {
            let cell = std::mem::replace(&mut cells[*pos], CellValue::Empty);
            cells[*pos] = cell.into_key_text();
        }
        if key_positions.iter().any(|pos| cells[*pos].is_empty()) {
            rows_dropped += 1;
            if dropped.len() < DROPPED_SAMPLE_LIMIT {
                dropped.push(row);
            }
            continue;
        }
        kept_rows.push(cells);
    }

    let dropped_sample = if rows_dropped > 0 {
        warn!(
            sheet = %sheet,
            dropped = rows_dropped,
            keys = ?keys,
            "dropping rows with missing or empty conflict keys"
        );
        for row in dropped.iter().take(DROPPED_LOG_SAMPLES) {
            let sample: Vec<String> = key_positions
                .iter()
                .map(|pos| row.get(keep[*pos]).map(CellValue::display_text).unwrap_or_default())
                .collect();
            info!(sheet = %sheet, keys = ?sample, "dropped row sample");
        }
        let mut sample = SheetTable::new(sheet.clone(), table.columns.clone());
        sample.rows = dropped;
        Some(sample)
    } else {
        None
    };

    let hashes: Vec<String> = kept_rows.iter().map(|row| row_hash(row)).collect();
    let mut seen = HashSet::with_capacity(hashes.len());
    let duplicate_hashes = hashes.iter().filter(|h| !seen.insert(h.as_str())).count();
    if duplicate_hashes > 0 {
        warn!(sheet = %sheet, duplicates = duplicate_hashes, "duplicate row_hash values");
    }

    let (rows, hashes, collapsed_duplicates) = match spec.mode {
        SyncMode::Keyed => collapse_by(kept_rows, hashes, |row, _| {
            key_positions.iter().map(|pos| row[*pos].canonical()).collect::<Vec<_>>()
        }),
        SyncMode::HashOnly => collapse_by(kept_rows, hashes, |_, hash| vec![hash.to_string()]),
    };
    if collapsed_duplicates > 0 {
        warn!(
            sheet = %sheet,
            collapsed = collapsed_duplicates,
            "rows sharing a conflict key collapsed to their last occurrence"
        );
    }

    let column_types = (0..columns.len())
        .map(|idx| {
            if key_positions.contains(&idx) {
                ColumnType::Text
            } else {
                ColumnType::infer(rows.iter().map(|row| &row[idx]))
            }
        })
        .collect();

    Ok(PreparedSheet {
        table: spec.table_name(&sheet),
        sheet,
        mode: spec.mode,
        keys,
        columns,
        column_types,
        rows,
        hashes,
        dropped_sample,
        stats: PrepareStats {
            rows_read,
            rows_dropped,
            duplicate_hashes,
            collapsed_duplicates,
        },
    })
}

/// Later rows replace earlier rows with the same identity, keeping the
/// position of the first one.
fn collapse_by<F>(
    rows: Vec<Vec<CellValue>>,
    hashes: Vec<String>,
    identity: F,
) -> (Vec<Vec<CellValue>>, Vec<String>, usize)
where
    F: Fn(&[CellValue], &str) -> Vec<String>,
{
    let mut index: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
    let mut out_rows: Vec<Vec<CellValue>> = Vec::with_capacity(rows.len());
    let mut out_hashes: Vec<String> = Vec::with_capacity(rows.len());
    let mut collapsed = 0usize;
    for (row, hash) in rows.into_iter().zip(hashes) {
        let id = identity(&row, &hash);
        match index.get(&id) {
            Some(slot) => {
                out_rows[*slot] = row;
                out_hashes[*slot] = hash;
                collapsed += 1;
            }
            None => {
                index.insert(id, out_rows.len());
                out_rows.push(row);
                out_hashes.push(hash);
            }
        }
    }
    (out_rows, out_hashes, collapsed)
}
