use xlpg_core::{row_hash, CellValue, ColumnType, SheetTable};
use xlpg_sources::{CsvDirectorySource, TableSource};
use xlpg_sync::writer::{build_upsert, rows_per_statement};
use xlpg_sync::{prepare_sheet, ConflictKeyRegistry, SheetSpec, SyncMode};

const REGISTRY: &str = r#"
sheets:
  vendor_search_results:
    keys: [uniqueid, b2gnow_vendor_number]
  afers_ofm:
    keys: [index]
    table: afers_ofm_2025
"#;

fn write_fixture(dir: &std::path::Path) {
    std::fs::write(
        dir.join("vendor_search_results.csv"),
        "UniqueID,B2GNow Vendor Number,Firm Name,Certification\n\
         100,V-1,Acme,MBE\n\
         101,V-2,Globex,WBE\n\
         ,V-3,Nameless,MBE\n\
         100,V-1,Acme Holdings,MBE\n",
    )
    .expect("write vendors");
    std::fs::write(dir.join("afers_ofm.csv"), "Index,Amount\n1,10.50\n2,3\n").expect("write afers");
}

#[test]
fn csv_folder_sheets_prepare_like_workbook_sheets() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixture(dir.path());
    let registry = ConflictKeyRegistry::from_yaml(REGISTRY).expect("registry");
    let mut source = CsvDirectorySource::new(dir.path());

    let vendors = source.read_table("vendor_search_results").expect("vendors");
    let spec = registry.require("vendor_search_results").expect("spec");
    let prepared = prepare_sheet(vendors, spec).expect("prepare");

    assert_eq!(prepared.stats.rows_read, 4);
    assert_eq!(prepared.stats.rows_dropped, 1);
    assert_eq!(prepared.stats.collapsed_duplicates, 1);
    assert_eq!(prepared.rows.len(), 2);
    assert_eq!(prepared.rows[0][2], CellValue::Text("Acme Holdings".into()));
    assert_eq!(prepared.hashes[0], row_hash(&prepared.rows[0]));

    let afers = source.read_table("afers_ofm").expect("afers");
    let prepared_afers = prepare_sheet(afers, registry.require("afers_ofm").expect("spec")).expect("prepare");
    assert_eq!(prepared_afers.table, "afers_ofm_2025");
    assert_eq!(prepared_afers.mode, SyncMode::Keyed);
}

#[test]
fn rerunning_unchanged_data_yields_identical_hashes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixture(dir.path());
    let registry = ConflictKeyRegistry::from_yaml(REGISTRY).expect("registry");
    let spec = registry.require("vendor_search_results").expect("spec");

    let mut source = CsvDirectorySource::new(dir.path());
    let first = prepare_sheet(source.read_table("vendor_search_results").expect("read"), spec).expect("first");
    let second = prepare_sheet(source.read_table("vendor_search_results").expect("read"), spec).expect("second");
    assert_eq!(first.hashes, second.hashes);
}

#[test]
fn upsert_for_prepared_sheet_uses_composite_conflict_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixture(dir.path());
    let registry = ConflictKeyRegistry::from_yaml(REGISTRY).expect("registry");
    let mut source = CsvDirectorySource::new(dir.path());
    let prepared = prepare_sheet(
        source.read_table("vendor_search_results").expect("read"),
        registry.require("vendor_search_results").expect("spec"),
    )
    .expect("prepare");

    let casts = vec![String::new(); prepared.columns.len()];
    let per_statement = rows_per_statement(5000, prepared.columns.len() + 1);
    assert_eq!(per_statement, 5000);

    let conflict = prepared.conflict_columns();
    let qb = build_upsert(
        "public",
        &prepared.table,
        prepared.mode,
        &prepared.columns,
        &casts,
        &conflict,
        &prepared.rows,
        &prepared.hashes,
    );
    let sql = qb.sql();
    assert!(sql.contains("ON CONFLICT (\"uniqueid\", \"b2gnow_vendor_number\") DO UPDATE SET \"firm_name\" = EXCLUDED.\"firm_name\""));
    assert!(sql.contains("($1, $2, $3, $4, $5), ($6, $7, $8, $9, $10)"));
}

/// Cells as the workbook reader produces them: every number is a float.
fn workbook_payments() -> SheetTable {
    let mut table = SheetTable::new(
        "Payments",
        vec!["Vendor ID".to_string(), "Invoice".to_string(), "Amount".to_string()],
    );
    table.rows = vec![
        vec![CellValue::Float(100.0), CellValue::Float(1234567890123.0), CellValue::Float(10.5)],
        vec![CellValue::Float(100.0), CellValue::Float(1234567890124.0), CellValue::Float(99.0)],
        vec![CellValue::Float(30000000001.0), CellValue::Float(7.0), CellValue::Float(0.1 + 0.2)],
        vec![CellValue::Float(30000000002.0), CellValue::Float(7.0), CellValue::Float(0.3)],
    ];
    table
}

#[test]
fn workbook_float_keys_prepare_as_whole_numbers() {
    let spec = SheetSpec::keyed(["vendor_id", "invoice"]);
    let prepared = prepare_sheet(workbook_payments(), &spec).expect("prepare");

    assert_eq!(prepared.stats.collapsed_duplicates, 0);
    assert_eq!(prepared.rows.len(), 4);
    let keys: Vec<(CellValue, CellValue)> = prepared
        .rows
        .iter()
        .map(|row| (row[0].clone(), row[1].clone()))
        .collect();
    assert_eq!(keys[0], (CellValue::Text("100".into()), CellValue::Text("1234567890123".into())));
    assert_eq!(keys[1], (CellValue::Text("100".into()), CellValue::Text("1234567890124".into())));
    assert_eq!(keys[2].0, CellValue::Text("30000000001".into()));
    assert_eq!(keys[3].0, CellValue::Text("30000000002".into()));
    assert_eq!(prepared.column_types[2], ColumnType::Double);

    // Float noise in a value column does not count as a change.
    let third = &prepared.rows[2][2..];
    let fourth = &prepared.rows[3][2..];
    assert_eq!(row_hash(third), row_hash(fourth));
}

#[test]
fn workbook_float_keys_match_typed_integer_keys() {
    let spec = SheetSpec::keyed(["vendor_id", "invoice"]);
    let from_workbook = prepare_sheet(workbook_payments(), &spec).expect("workbook");

    let mut typed = workbook_payments();
    typed.rows[0][0] = CellValue::Int(100);
    typed.rows[0][1] = CellValue::Int(1234567890123);
    let from_typed = prepare_sheet(typed, &spec).expect("typed");

    assert_eq!(from_workbook.rows[0][..2], from_typed.rows[0][..2]);
    assert_eq!(from_workbook.hashes[0], from_typed.hashes[0]);
}

#[test]
fn changing_a_long_number_changes_the_row_hash() {
    let spec = SheetSpec::keyed(["vendor_id", "invoice"]);
    let before = prepare_sheet(workbook_payments(), &spec).expect("before");

    let mut edited = workbook_payments();
    edited.rows[2][2] = CellValue::Float(98765432101.0);
    let after_first = prepare_sheet(edited.clone(), &spec).expect("first edit");
    edited.rows[2][2] = CellValue::Float(98765432102.0);
    let after_second = prepare_sheet(edited, &spec).expect("second edit");

    assert_ne!(before.hashes[2], after_first.hashes[2]);
    assert_ne!(after_first.hashes[2], after_second.hashes[2]);
    assert_eq!(before.hashes[0], after_second.hashes[0]);
}
