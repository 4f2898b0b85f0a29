use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use xlpg_storage::write_atomic;

use crate::{write_table_sheet, SheetNamer};

pub const ALL_IN_ONE_FILE: &str = "schema_metadata.xlsx";
pub const ALL_IN_ONE_SHEET: &str = "columns_and_types";
pub const PER_TABLE_FILE: &str = "schema_metadata_by_table.xlsx";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ColumnMetadata {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

pub async fn fetch_column_metadata(pool: &PgPool, schemas: &[String]) -> Result<Vec<ColumnMetadata>> {
    sqlx::query_as::<_, ColumnMetadata>(
        "SELECT table_schema::text AS table_schema,
                table_name::text AS table_name,
                column_name::text AS column_name,
                data_type::text AS data_type
         FROM information_schema.columns
         WHERE table_schema = ANY($1)
         ORDER BY table_schema, table_name, ordinal_position",
    )
    .bind(schemas)
    .fetch_all(pool)
    .await
    .with_context(|| format!("reading column metadata for schemas {schemas:?}"))
}

/// Consecutive runs of columns belonging to the same table. Input must be
/// ordered by schema and table.
pub fn group_by_table(columns: &[ColumnMetadata]) -> Vec<(&str, &str, Vec<&ColumnMetadata>)> {
    let mut groups: Vec<(&str, &str, Vec<&ColumnMetadata>)> = Vec::new();
    for column in columns {
        match groups.last_mut() {
            Some((schema, table, members))
                if *schema == column.table_schema && *table == column.table_name =>
            {
                members.push(column)
            }
            _ => groups.push((column.table_schema.as_str(), column.table_name.as_str(), vec![column])),
        }
    }
    groups
}

/// One worksheet listing every column of every table.
pub fn all_in_one_workbook(columns: &[ColumnMetadata]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    write_table_sheet(
        &mut workbook,
        ALL_IN_ONE_SHEET,
        &["table_schema", "table_name", "column_name", "data_type"],
        columns.iter().map(|c| {
            vec![
                Some(c.table_schema.clone()),
                Some(c.table_name.clone()),
                Some(c.column_name.clone()),
                Some(c.data_type.clone()),
            ]
        }),
    )?;
    Ok(workbook.save_to_buffer()?)
}

/// One worksheet per table, named `<schema>.<table>`.
pub fn per_table_workbook(columns: &[ColumnMetadata]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut namer = SheetNamer::new();
    let groups = group_by_table(columns);
    if groups.is_empty() {
        write_table_sheet(&mut workbook, "empty", &["column_name", "data_type"], Vec::new())?;
    }
    for (schema, table, members) in groups {
        let name = namer.name_for(&format!("{schema}.{table}"));
        write_table_sheet(
            &mut workbook,
            &name,
            &["column_name", "data_type"],
            members
                .iter()
                .map(|c| vec![Some(c.column_name.clone()), Some(c.data_type.clone())]),
        )?;
        info!(schema, table, sheet = %name, "wrote metadata sheet");
    }
    Ok(workbook.save_to_buffer()?)
}

/// Fetch metadata for `schemas` and write it under `export_path`; returns
/// the workbook path.
pub async fn export_schema_metadata(
    pool: &PgPool,
    schemas: &[String],
    export_path: &Path,
    per_table: bool,
) -> Result<PathBuf> {
    let columns = fetch_column_metadata(pool, schemas).await?;
    info!(columns = columns.len(), schemas = ?schemas, "fetched column metadata");
    let (file, bytes) = if per_table {
        (PER_TABLE_FILE, per_table_workbook(&columns)?)
    } else {
        (ALL_IN_ONE_FILE, all_in_one_workbook(&columns)?)
    };
    let path = export_path.join(file);
    write_atomic(&path, &bytes).await?;
    info!(path = %path.display(), "finished exporting schema metadata");
    Ok(path)
}
