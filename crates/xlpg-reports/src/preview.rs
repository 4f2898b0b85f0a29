//! First rows of every base table in a schema, one worksheet per table.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::Workbook;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use xlpg_core::{qualified_name, quote_ident};
use xlpg_storage::write_atomic;

use crate::{write_table_sheet, SheetNamer};

pub const PREVIEW_FILE: &str = "tables_preview.xlsx";
pub const DEFAULT_PREVIEW_ROWS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct TablePreview {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

pub async fn list_base_tables(pool: &PgPool, schema: &str) -> Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT table_name::text
         FROM information_schema.tables
         WHERE table_schema = $1 AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .bind(schema)
    .fetch_all(pool)
    .await
    .with_context(|| format!("listing tables in schema {schema}"))
}

async fn table_columns(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT column_name::text
         FROM information_schema.columns
         WHERE table_schema = $1 AND table_name = $2
         ORDER BY ordinal_position",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(pool)
    .await
    .with_context(|| format!("reading columns of {schema}.{table}"))
}

/// Every column rendered by PostgreSQL as text, so any column type previews
/// the same way it prints in psql.
pub fn preview_sql(schema: &str, table: &str, columns: &[String], limit: i64) -> String {
    let select = columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {select} FROM {} LIMIT {limit}",
        qualified_name(schema, table)
    )
}

pub async fn fetch_preview(pool: &PgPool, schema: &str, table: &str, limit: i64) -> Result<TablePreview> {
    let columns = table_columns(pool, schema, table).await?;
    if columns.is_empty() {
        return Ok(TablePreview {
            table: table.to_string(),
            columns,
            rows: Vec::new(),
        });
    }
    let rows = sqlx::query(&preview_sql(schema, table, &columns, limit))
        .fetch_all(pool)
        .await
        .with_context(|| format!("selecting preview rows from {schema}.{table}"))?;
    let rows = rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|idx| row.try_get::<Option<String>, _>(idx))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding preview rows from {schema}.{table}"))?;
    Ok(TablePreview {
        table: table.to_string(),
        columns,
        rows,
    })
}

pub fn preview_workbook(previews: &[TablePreview]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut namer = SheetNamer::new();
    if previews.is_empty() {
        write_table_sheet(&mut workbook, "empty", Vec::<String>::new(), Vec::new())?;
    }
    for preview in previews {
        let name = namer.name_for(&preview.table);
        write_table_sheet(&mut workbook, &name, &preview.columns, preview.rows.clone())?;
    }
    Ok(workbook.save_to_buffer()?)
}

/// Write `tables_preview.xlsx`; tables that cannot be read are skipped.
pub async fn export_table_previews(
    pool: &PgPool,
    schema: &str,
    export_path: &Path,
    limit: i64,
) -> Result<PathBuf> {
    let tables = list_base_tables(pool, schema).await?;
    info!(schema, tables = tables.len(), "previewing tables");
    let mut previews = Vec::with_capacity(tables.len());
    for table in &tables {
        match fetch_preview(pool, schema, table, limit).await {
            Ok(preview) => {
                info!(table = %table, rows = preview.rows.len(), "read preview");
                previews.push(preview);
            }
            Err(err) => warn!(table = %table, error = %format!("{err:#}"), "skipping table"),
        }
    }
    let bytes = preview_workbook(&previews)?;
    let path = export_path.join(PREVIEW_FILE);
    write_atomic(&path, &bytes).await?;
    info!(path = %path.display(), sheets = previews.len(), "finished table preview");
    Ok(path)
}
