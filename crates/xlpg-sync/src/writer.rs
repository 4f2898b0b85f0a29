//! PostgreSQL side of a sheet sync. All statements for one sheet run on a
//! single connection inside the caller's transaction.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use xlpg_core::{constraint_name, qualified_name, quote_ident, CellValue, ColumnType};

use crate::config::SyncMode;
use crate::prepare::{PreparedSheet, ROW_HASH_COLUMN};

/// Bind parameters PostgreSQL accepts in one statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub batch_size: usize,
    pub copy_threshold: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub table_created: bool,
    pub columns_added: Vec<String>,
    pub used_copy: bool,
    /// Inserted plus changed rows; unchanged rows are not counted.
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub elapsed_ms: u128,
}

/// Rows per INSERT so that `rows * params_per_row` stays under the bind limit.
pub fn rows_per_statement(batch_size: usize, params_per_row: usize) -> usize {
    let cap = MAX_BIND_PARAMS / params_per_row.max(1);
    batch_size.clamp(1, cap.max(1))
}

pub fn create_table_sql(schema: &str, table: &str, columns: &[(String, ColumnType)]) -> String {
    let defs = columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.pg_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_name(schema, table),
        defs
    )
}

/// Adds the bookkeeping columns when absent. `updated_at` only changes when
/// a row's content changes, so it carries no default.
pub fn audit_columns_sql(schema: &str, table: &str) -> String {
    let target = qualified_name(schema, table);
    format!(
        "ALTER TABLE {target} \
         ADD COLUMN IF NOT EXISTS created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
         ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ, \
         ADD COLUMN IF NOT EXISTS {hash} TEXT; \
         ALTER TABLE {target} ALTER COLUMN updated_at DROP DEFAULT;",
        hash = quote_ident(ROW_HASH_COLUMN),
    )
}

pub fn add_column_sql(schema: &str, table: &str, column: &str, ty: ColumnType) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        qualified_name(schema, table),
        quote_ident(column),
        ty.pg_type()
    )
}

pub fn add_unique_constraint_sql(schema: &str, table: &str, name: &str, columns: &[String]) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
        qualified_name(schema, table),
        quote_ident(name),
        quoted_list(columns)
    )
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cast suffix for a bound text value; text columns need none.
pub fn cast_suffix(column_type: &str) -> String {
    match column_type {
        "text" => String::new(),
        other => format!("::{other}"),
    }
}

/// One multi-row `INSERT .. ON CONFLICT` for a slice of prepared rows. Every
/// value is bound as text and cast to the column's real type.
pub fn build_upsert<'a>(
    schema: &str,
    table: &str,
    mode: SyncMode,
    columns: &[String],
    casts: &'a [String],
    conflict_columns: &[String],
    rows: &'a [Vec<CellValue>],
    hashes: &'a [String],
) -> QueryBuilder<'a, Postgres> {
    let mut insert_columns = columns.to_vec();
    insert_columns.push(ROW_HASH_COLUMN.to_string());

    let mut qb: QueryBuilder<'a, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} AS target ({}) ",
        qualified_name(schema, table),
        quoted_list(&insert_columns)
    ));
    qb.push_values(rows.iter().zip(hashes), |mut b, (row, hash)| {
        for (cell, cast) in row.iter().zip(casts) {
            b.push_bind(cell.sql_text());
            b.push_unseparated(cast.as_str());
        }
        b.push_bind(hash.as_str());
    });

    match mode {
        SyncMode::HashOnly => {
            qb.push(format!(
                " ON CONFLICT ({}) DO NOTHING",
                quote_ident(ROW_HASH_COLUMN)
            ));
        }
        SyncMode::Keyed => {
            let hash = quote_ident(ROW_HASH_COLUMN);
            let mut assignments = columns
                .iter()
                .filter(|c| !conflict_columns.contains(c))
                .map(|c| {
                    let q = quote_ident(c);
                    format!("{q} = EXCLUDED.{q}")
                })
                .collect::<Vec<_>>();
            assignments.push(format!("{hash} = EXCLUDED.{hash}"));
            assignments.push("updated_at = now()".to_string());
            qb.push(format!(
                " ON CONFLICT ({}) DO UPDATE SET {} WHERE target.{hash} IS DISTINCT FROM EXCLUDED.{hash}",
                quoted_list(conflict_columns),
                assignments.join(", ")
            ));
        }
    }
    qb
}

pub fn copy_statement(schema: &str, table: &str, columns: &[String]) -> String {
    let mut all = columns.to_vec();
    all.push(ROW_HASH_COLUMN.to_string());
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        qualified_name(schema, table),
        quoted_list(&all)
    )
}

fn push_copy_field(out: &mut String, value: Option<&str>) {
    let Some(value) = value else {
        out.push_str("\\N");
        return;
    };
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
}

/// Rows in COPY text format: tab separated, `\N` for NULL.
pub fn copy_payload(rows: &[Vec<CellValue>], hashes: &[String]) -> String {
    let mut out = String::new();
    for (row, hash) in rows.iter().zip(hashes) {
        for cell in row {
            push_copy_field(&mut out, cell.sql_text().as_deref());
            out.push('\t');
        }
        push_copy_field(&mut out, Some(hash));
        out.push('\n');
    }
    out
}

pub async fn ensure_schema(conn: &mut PgConnection, schema: &str) -> Result<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))
        .execute(&mut *conn)
        .await
        .with_context(|| format!("creating schema {schema}"))?;
    Ok(())
}

pub async fn table_exists(conn: &mut PgConnection, schema: &str, table: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
        )",
    )
    .bind(schema)
    .bind(table)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("checking whether {schema}.{table} exists"))?;
    Ok(exists)
}

/// Column names and their `format_type` spelling, in table order.
pub async fn reflect_columns(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT a.attname::text AS name, format_type(a.atttypid, a.atttypmod) AS data_type
         FROM pg_attribute a
         JOIN pg_class c ON c.oid = a.attrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await
    .with_context(|| format!("reading columns of {schema}.{table}"))?;

    rows.into_iter()
        .map(|row| Ok((row.try_get("name")?, row.try_get("data_type")?)))
        .collect()
}

pub async fn constraint_exists(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    name: &str,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (
            SELECT 1 FROM pg_constraint con
            JOIN pg_class c ON c.oid = con.conrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND con.conname = $3
        )",
    )
    .bind(schema)
    .bind(table)
    .bind(name)
    .fetch_one(&mut *conn)
    .await
    .context("looking up unique constraint")?;
    Ok(exists)
}

pub async fn count_rows(conn: &mut PgConnection, schema: &str, table: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT count(*) FROM {}",
        qualified_name(schema, table)
    ))
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("counting rows of {schema}.{table}"))?;
    Ok(count)
}

/// Removes rows whose hash is not among `hashes`. Rows without a hash are
/// left alone, and nothing is deleted when `hashes` is empty.
pub async fn delete_stale(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    hashes: &[String],
) -> Result<u64> {
    if hashes.is_empty() {
        return Ok(0);
    }
    let hash = quote_ident(ROW_HASH_COLUMN);
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE {hash} IS NOT NULL AND NOT ({hash} = ANY($1))",
        qualified_name(schema, table)
    ))
    .bind(hashes)
    .execute(&mut *conn)
    .await
    .with_context(|| format!("deleting stale rows from {schema}.{table}"))?;
    Ok(result.rows_affected())
}

async fn copy_rows(conn: &mut PgConnection, schema: &str, sheet: &PreparedSheet, chunk: usize) -> Result<u64> {
    let statement = copy_statement(schema, &sheet.table, &sheet.columns);
    let mut copy = conn
        .copy_in_raw(&statement)
        .await
        .with_context(|| format!("starting COPY into {schema}.{}", sheet.table))?;
    for (rows, hashes) in sheet.rows.chunks(chunk).zip(sheet.hashes.chunks(chunk)) {
        copy.send(copy_payload(rows, hashes).into_bytes())
            .await
            .context("streaming COPY data")?;
    }
    let copied = copy.finish().await.context("finishing COPY")?;
    Ok(copied)
}

/// Create or evolve the target table and bring it in line with the sheet,
/// all inside one transaction.
pub async fn sync_sheet(
    pool: &PgPool,
    schema: &str,
    sheet: &PreparedSheet,
    options: LoadOptions,
) -> Result<LoadStats> {
    let started = Instant::now();
    let table = sheet.table.as_str();
    let mut stats = LoadStats::default();
    let mut tx = pool.begin().await.context("starting transaction")?;

    ensure_schema(&mut tx, schema).await?;
    if !table_exists(&mut tx, schema, table).await? {
        sqlx::query(&create_table_sql(schema, table, &sheet.typed_columns()))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("creating table {schema}.{table}"))?;
        stats.table_created = true;
        info!(schema, table, "created table");
    }

    sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&audit_columns_sql(schema, table)))
        .await
        .with_context(|| format!("ensuring audit columns on {schema}.{table}"))?;

    let existing: HashSet<String> = reflect_columns(&mut tx, schema, table)
        .await?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    for (column, ty) in sheet.typed_columns() {
        if !existing.contains(&column) {
            sqlx::query(&add_column_sql(schema, table, &column, ty))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("adding column {column} to {schema}.{table}"))?;
            info!(schema, table, column = %column, "added column");
            stats.columns_added.push(column);
        }
    }

    let conflict_columns = sheet.conflict_columns();
    let constraint = constraint_name(table, &conflict_columns);
    if !constraint_exists(&mut tx, schema, table, &constraint).await? {
        sqlx::query(&add_unique_constraint_sql(schema, table, &constraint, &conflict_columns))
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!("adding unique constraint {constraint}; the table may already hold duplicate keys")
            })?;
        info!(schema, table, constraint = %constraint, "added unique constraint");
    }

    let reflected = reflect_columns(&mut tx, schema, table).await?;
    let casts: Vec<String> = sheet
        .columns
        .iter()
        .map(|column| {
            reflected
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, ty)| cast_suffix(ty))
                .unwrap_or_default()
        })
        .collect();

    let per_statement = rows_per_statement(options.batch_size, sheet.columns.len() + 1);
    let existing_rows = count_rows(&mut tx, schema, table).await?;
    if existing_rows == 0 && !sheet.is_empty() && sheet.rows.len() >= options.copy_threshold {
        stats.used_copy = true;
        stats.rows_written = copy_rows(&mut tx, schema, sheet, per_statement).await?;
        info!(schema, table, rows = stats.rows_written, "bulk loaded with COPY");
    } else {
        for (batch_no, (rows, hashes)) in sheet
            .rows
            .chunks(per_statement)
            .zip(sheet.hashes.chunks(per_statement))
            .enumerate()
        {
            let mut qb = build_upsert(
                schema,
                table,
                sheet.mode,
                &sheet.columns,
                &casts,
                &conflict_columns,
                rows,
                hashes,
            );
            let result = qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting batch {} into {schema}.{table}", batch_no + 1))?;
            debug!(table, batch = batch_no + 1, affected = result.rows_affected(), "batch upserted");
            stats.rows_written += result.rows_affected();
        }
        info!(schema, table, rows = stats.rows_written, "upserted rows (only changed data)");
    }

    stats.rows_deleted = delete_stale(&mut tx, schema, table, &sheet.hashes).await?;
    if stats.rows_deleted > 0 {
        info!(schema, table, deleted = stats.rows_deleted, "deleted stale rows");
    }

    tx.commit().await.context("committing sheet transaction")?;
    stats.elapsed_ms = started.elapsed().as_millis();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn batch_size_respects_bind_limit() {
        assert_eq!(rows_per_statement(5000, 10), 5000);
        assert_eq!(rows_per_statement(5000, 40), 1638);
        assert_eq!(rows_per_statement(0, 3), 1);
        assert_eq!(rows_per_statement(10, 100_000), 1);
    }

    #[test]
    fn create_and_alter_statements_quote_identifiers() {
        let sql = create_table_sql(
            "public",
            "vendor search",
            &[
                ("uniqueid".to_string(), ColumnType::Text),
                ("amount".to_string(), ColumnType::Double),
            ],
        );
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"public\".\"vendor search\" (\"uniqueid\" text, \"amount\" double precision)"
        );

        let audit = audit_columns_sql("public", "t");
        assert!(audit.contains("created_at TIMESTAMPTZ NOT NULL DEFAULT now()"));
        assert!(audit.contains("ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ,"));
        assert!(audit.contains("ALTER COLUMN updated_at DROP DEFAULT"));

        assert_eq!(
            add_unique_constraint_sql("s", "t", "uq_t_a_b", &cols(&["a", "b"])),
            "ALTER TABLE \"s\".\"t\" ADD CONSTRAINT \"uq_t_a_b\" UNIQUE (\"a\", \"b\")"
        );
    }

    #[test]
    fn keyed_upsert_only_touches_changed_rows() {
        let columns = cols(&["uniqueid", "amount"]);
        let casts = vec![String::new(), cast_suffix("numeric(12,2)")];
        let rows = vec![
            vec![CellValue::Text("A".into()), CellValue::Float(1.5)],
            vec![CellValue::Text("B".into()), CellValue::Empty],
        ];
        let hashes = vec!["h1".to_string(), "h2".to_string()];
        let keys = cols(&["uniqueid"]);
        let qb = build_upsert("public", "t", SyncMode::Keyed, &columns, &casts, &keys, &rows, &hashes);
        let sql = qb.sql();

        assert!(sql.starts_with(
            "INSERT INTO \"public\".\"t\" AS target (\"uniqueid\", \"amount\", \"row_hash\") VALUES ($1, $2::numeric(12,2), $3), ($4, $5::numeric(12,2), $6)"
        ));
        assert!(sql.contains("ON CONFLICT (\"uniqueid\") DO UPDATE SET \"amount\" = EXCLUDED.\"amount\", \"row_hash\" = EXCLUDED.\"row_hash\", updated_at = now()"));
        assert!(sql.ends_with("WHERE target.\"row_hash\" IS DISTINCT FROM EXCLUDED.\"row_hash\""));
        assert!(!sql.contains("\"uniqueid\" = EXCLUDED"));
    }

    #[test]
    fn hash_only_upsert_never_updates() {
        let columns = cols(&["a"]);
        let casts = vec![String::new()];
        let rows = vec![vec![CellValue::Int(1)]];
        let hashes = vec!["h".to_string()];
        let qb = build_upsert("s", "t", SyncMode::HashOnly, &columns, &casts, &[], &rows, &hashes);
        assert!(qb.sql().ends_with("ON CONFLICT (\"row_hash\") DO NOTHING"));
    }

    #[test]
    fn copy_payload_escapes_and_marks_nulls() {
        let rows = vec![vec![
            CellValue::Text("tab\there".into()),
            CellValue::Empty,
            CellValue::Text("back\\slash\nline".into()),
            CellValue::Float(3.0),
        ]];
        let payload = copy_payload(&rows, &["abc".to_string()]);
        assert_eq!(payload, "tab\\there\t\\N\tback\\\\slash\\nline\t3\tabc\n");
        assert_eq!(
            copy_statement("public", "t", &cols(&["a"])),
            "COPY \"public\".\"t\" (\"a\", \"row_hash\") FROM STDIN WITH (FORMAT text)"
        );
    }
}
