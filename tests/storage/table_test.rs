use chrono::NaiveDate;
use rust_decimal::Decimal;
use xbase::{
    storage::{
        codec::encode_sortable_double,
        options::{MemoType, OpenMode, TableOptions},
        schema::{ColumnDefinition, NativeType},
        table::Table,
    },
    types::{error::XbaseError, row::Row, value::Value},
    utils::mock::{MemoFixture, TableFixture, TempTable},
};

fn three_column_fixture() -> TableFixture {
    TableFixture::new()
        .column("AAA", b'C', 10, 0)
        .column("BBB", b'N', 8, 3)
        .column("DDD", b'L', 1, 0)
}

#[test]
fn test_blank_row_reads_as_nulls() {
    let fixture = three_column_fixture().row(&["", "", ""]);
    let mut temp = TempTable::with_fixture("blank.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert_eq!(table.record_count(), 1);
    assert_eq!(table.header().row_length, 20);
    assert_eq!(table.columns().len(), 3);

    let row = table.row(0).unwrap();
    assert!(row.is_null("AAA").unwrap());
    assert!(row.is_null("BBB").unwrap());
    assert!(row.is_null("DDD").unwrap());
    assert_eq!(row.values().unwrap(), vec![Value::Null, Value::Null, Value::Null]);
}

#[test]
fn test_filled_row_decodes() {
    let fixture = three_column_fixture().row(&["HELLO", "12.500", "T"]);
    let mut temp = TempTable::with_fixture("filled.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    let row = table.row(0).unwrap();
    assert_eq!(row.get_string("AAA").unwrap(), Some("HELLO".to_string()));
    assert_eq!(row.get_decimal("BBB").unwrap(), Some(Decimal::new(125, 1)));
    assert_eq!(row.get_bool("DDD").unwrap(), Some(true));
    assert_eq!(row.get_raw_string("AAA").unwrap(), "HELLO     ");

    // decoding an unchanged buffer again gives the same values
    assert_eq!(row.values().unwrap(), row.values().unwrap());
}

#[test]
fn test_typed_columns() {
    let ratio = encode_sortable_double(-2.75);
    let fixture = TableFixture::new()
        .column("BORN", b'D', 8, 0)
        .column("COUNT", b'I', 4, 0)
        .column("RATIO", b'O', 8, 0)
        .column("RATE", b'F', 6, 2)
        .row_bytes(false, &[b"20240229", &(-5i32).to_le_bytes(), &ratio, b"3.14"]);
    let mut temp = TempTable::with_fixture("typed.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    let row = table.row(0).unwrap();
    assert_eq!(
        row.get_date("BORN").unwrap(),
        Some(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
    );
    assert_eq!(row.get_i32("COUNT").unwrap(), Some(-5));
    assert_eq!(row.get_value("RATIO").unwrap(), Value::Double(-2.75));
    assert_eq!(row.get_decimal("RATE").unwrap(), Some(Decimal::new(314, 2)));
    assert_eq!(row.get_f64("RATIO").unwrap(), Some(-2.75));
}

#[test]
fn test_invalid_logical_byte() {
    let fixture = three_column_fixture().row(&["X", "1", "X"]);
    let mut temp = TempTable::with_fixture("logical.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    let row = table.row(0).unwrap();
    assert!(matches!(row.get_value("DDD"), Err(XbaseError::Range { .. })));
}

#[test]
fn test_record_bounds() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]);
    let mut temp = TempTable::with_fixture("bounds.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert!(matches!(table.row(1), Err(XbaseError::Range { .. })));
    assert!(table.get_row(1, false).unwrap().is_none());
    assert!(table.get_row(0, false).unwrap().is_some());
}

#[test]
fn test_length_mismatch_fails_open() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]).record_count(2);
    let mut temp = TempTable::with_fixture("short.dbf", &fixture).unwrap();
    assert!(matches!(
        temp.open(TableOptions::default()),
        Err(XbaseError::Format { .. })
    ));
}

#[test]
fn test_unsupported_column_type() {
    let fixture = TableFixture::new().column("PIC", b'G', 10, 0).row(&["1"]);
    let mut temp = TempTable::with_fixture("general.dbf", &fixture).unwrap();
    assert!(matches!(
        temp.open(TableOptions::default()),
        Err(XbaseError::NotSupported { .. })
    ));
}

#[test]
fn test_delete_flag_written_back() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]).row(&["B", "2", "F"]);
    let mut temp = TempTable::with_fixture("delete.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    let mut row = table.row(1).unwrap();
    row.set_deleted(true);
    table.update_row(&mut row).unwrap();
    assert!(!row.is_modified());
    assert!(table.row(1).unwrap().is_deleted());
    assert!(!table.row(0).unwrap().is_deleted());

    let mut row = table.row(1).unwrap();
    row.set_deleted(false);
    table.write_row(&mut row).unwrap();
    assert_eq!(table.row(1).unwrap().buffer()[0], 0x20);
}

#[test]
fn test_read_only_rejects_updates() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]);
    let mut temp = TempTable::with_fixture("readonly.dbf", &fixture).unwrap();
    let table = temp
        .open(TableOptions::default().open_mode(OpenMode::ReadOnly))
        .unwrap();

    let mut row = table.row(0).unwrap();
    row.set_deleted(true);
    assert!(matches!(table.update_row(&mut row), Err(XbaseError::State { .. })));
}

#[test]
fn test_insert_is_not_implemented() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]);
    let mut temp = TempTable::with_fixture("insert.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    let mut orphan = Row::new(
        std::sync::Arc::new(table.columns().to_vec()),
        table.encoding(),
    )
    .unwrap();
    assert!(matches!(
        table.insert_row(&mut orphan),
        Err(XbaseError::NotImplemented { .. })
    ));
    assert!(matches!(
        table.write_row(&mut orphan),
        Err(XbaseError::NotImplemented { .. })
    ));
}

#[test]
fn test_rows_do_not_cross_tables() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]);
    let mut first = TempTable::with_fixture("first.dbf", &fixture).unwrap();
    let mut second = TempTable::with_fixture("second.dbf", &fixture).unwrap();
    let first = first.open(TableOptions::default()).unwrap();
    let second = second.open(TableOptions::default()).unwrap();
    assert_ne!(first.id(), second.id());

    let mut row = first.row(0).unwrap();
    assert!(matches!(second.update_row(&mut row), Err(XbaseError::State { .. })));
}

#[test]
fn test_detach_and_attach_identical_schema() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]).row(&["B", "2", "F"]);
    let mut first = TempTable::with_fixture("source.dbf", &fixture).unwrap();
    let mut second = TempTable::with_fixture("target.dbf", &fixture).unwrap();
    let source = first.open(TableOptions::default()).unwrap();
    let target = second.open(TableOptions::default()).unwrap();

    let mut row = source.row(0).unwrap();
    source.detach_row(&mut row).unwrap();
    assert!(row.is_orphan());
    assert_eq!(row.rec_no(), None);

    target.attach_row(&mut row, 1).unwrap();
    assert_eq!(row.table_id(), target.id());
    assert_eq!(row.rec_no(), Some(1));
    assert!(row.is_modified());

    target.update_row(&mut row).unwrap();
    assert_eq!(target.row(1).unwrap().get_string("AAA").unwrap(), Some("A".to_string()));
}

#[test]
fn test_attach_rejects_different_schema() {
    let narrow = three_column_fixture().row(&["A", "1", "T"]);
    let wide = TableFixture::new()
        .column("AAA", b'C', 12, 0)
        .column("BBB", b'N', 8, 3)
        .column("DDD", b'L', 1, 0)
        .row(&["A", "1", "T"]);
    let decimals = TableFixture::new()
        .column("AAA", b'C', 10, 0)
        .column("BBB", b'N', 8, 2)
        .column("DDD", b'L', 1, 0)
        .row(&["A", "1", "T"]);

    let mut source = TempTable::with_fixture("narrow.dbf", &narrow).unwrap();
    let source = source.open(TableOptions::default()).unwrap();
    let mut row = source.row(0).unwrap();
    source.detach_row(&mut row).unwrap();

    for (name, fixture) in [("wide.dbf", &wide), ("decimals.dbf", &decimals)] {
        let mut temp = TempTable::with_fixture(name, fixture).unwrap();
        let target = temp.open(TableOptions::default()).unwrap();
        assert!(matches!(
            target.attach_row(&mut row, 0),
            Err(XbaseError::State { .. })
        ));
    }
}

#[test]
fn test_create_then_open() {
    let mut temp = TempTable::new("created.dbf").unwrap();
    let definitions = vec![
        ColumnDefinition::character("name", 20),
        ColumnDefinition::numeric("amount", 10, 2),
        ColumnDefinition::date("born"),
        ColumnDefinition::logical("active"),
    ];
    let table = Table::create(&temp.path, &definitions, TableOptions::default()).unwrap();

    assert_eq!(table.record_count(), 0);
    assert_eq!(table.header().row_length, 1 + 20 + 10 + 8 + 1);
    assert_eq!(table.columns()[0].name, "NAME");
    assert_eq!(table.columns()[1].native_type, NativeType::Numeric);
    assert_eq!(table.encoding(), encoding_rs::WINDOWS_1252);
    assert!(table.memo_store().is_none());
    table.close().unwrap();

    let reopened = temp.open(TableOptions::default()).unwrap();
    assert_eq!(reopened.columns().len(), 4);
    assert!(reopened.find_column("Amount").is_some());
}

#[test]
fn test_create_with_memo_column_creates_memo_file() {
    let mut temp = TempTable::new("notes.dbf").unwrap();
    let definitions = vec![ColumnDefinition::character("title", 10), ColumnDefinition::memo("body")];
    let table = Table::create(
        &temp.path,
        &definitions,
        TableOptions::default().memo_type(MemoType::Dbt4),
    )
    .unwrap();

    assert_eq!(table.header().type_tag, 0x8B);
    let store = table.memo_store().unwrap();
    assert_eq!(store.memo_type(), MemoType::Dbt4);
    assert_eq!(store.block_size(), 512);
    assert!(temp.dir().join("notes.dbt").exists());
    table.close().unwrap();

    assert!(temp.open(TableOptions::default()).is_ok());
}

#[test]
fn test_create_with_memo_block_size() {
    let mut temp = TempTable::new("wide.dbf").unwrap();
    let definitions = vec![ColumnDefinition::memo("body")];
    assert!(matches!(
        Table::create_with_memo(&temp.path, &definitions, MemoType::Dbt4, 100, TableOptions::default()),
        Err(XbaseError::Format { .. })
    ));
    assert!(!temp.path.exists());

    let table = Table::create_with_memo(
        &temp.path,
        &definitions,
        MemoType::Dbt4,
        1024,
        TableOptions::default(),
    )
    .unwrap();
    assert_eq!(table.memo_store().unwrap().block_size(), 1024);
    assert_eq!(table.default_memo_type(), MemoType::Dbt4);
    table.close().unwrap();

    let reopened = temp.open(TableOptions::default()).unwrap();
    assert_eq!(reopened.memo_store().unwrap().memo_type(), MemoType::Dbt4);
}

#[test]
fn test_create_rejects_bad_definitions() {
    let temp = TempTable::new("bad.dbf").unwrap();
    assert!(matches!(
        Table::create(&temp.path, &[], TableOptions::default()),
        Err(XbaseError::Format { .. })
    ));
    assert!(matches!(
        Table::create(
            &temp.path,
            &[ColumnDefinition::character("a", 5), ColumnDefinition::character("A", 5)],
            TableOptions::default()
        ),
        Err(XbaseError::Format { .. })
    ));
    assert!(matches!(
        Table::create(
            &temp.path,
            &[ColumnDefinition::character("a", 5)],
            TableOptions::default().encoding(encoding_rs::UTF_8)
        ),
        Err(XbaseError::Configuration { .. })
    ));
}

#[test]
fn test_memo_column_reads_through_memo_file() {
    let memo = MemoFixture::v3().blob(b"first note").blob(b"second note");
    let blocks = memo.blocks();
    let fixture = TableFixture::new()
        .type_tag(0x83)
        .column("TITLE", b'C', 10, 0)
        .column("NOTES", b'M', 10, 0)
        .row(&["one", blocks[0].to_string().as_str()])
        .row(&["two", blocks[1].to_string().as_str()])
        .row(&["three", ""]);

    let mut temp = TempTable::with_fixture("memo.dbf", &fixture).unwrap();
    temp.write_file("MEMO.DBT", &memo.build()).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert_eq!(table.default_memo_type(), MemoType::Dbt3);
    let row = table.row(1).unwrap();
    assert_eq!(row.get_string("NOTES").unwrap(), Some("second note".to_string()));
    assert_eq!(table.row(0).unwrap().get_memo_bytes("NOTES").unwrap(), Some(b"first note".to_vec()));

    let blank = table.row(2).unwrap();
    assert!(blank.is_null("NOTES").unwrap());
    assert_eq!(blank.get_memo_bytes("NOTES").unwrap(), Some(Vec::new()));
}

#[test]
fn test_detached_row_keeps_memo_content() {
    let memo = MemoFixture::v3().blob(b"kept");
    let fixture = TableFixture::new()
        .type_tag(0x83)
        .column("NOTES", b'M', 10, 0)
        .row(&["1"]);

    let mut temp = TempTable::with_fixture("detach.dbf", &fixture).unwrap();
    temp.write_file("detach.dbt", &memo.build()).unwrap();
    let mut row = {
        let table = temp.open(TableOptions::default()).unwrap();
        let mut row = table.row(0).unwrap();
        table.detach_row(&mut row).unwrap();
        row
    };
    if let Some(table) = temp.table.take() {
        table.close().unwrap();
    }

    assert_eq!(row.get_string("NOTES").unwrap(), Some("kept".to_string()));
    assert!(!row.memo_cache_item("NOTES").unwrap().modified);
    row.set_null("NOTES").unwrap();
    assert!(row.is_null("NOTES").unwrap());
}

fn memo_table(name: &str, note: &[u8]) -> TempTable {
    let memo = MemoFixture::v3().blob(note);
    let fixture = TableFixture::new()
        .type_tag(0x83)
        .column("TITLE", b'C', 10, 0)
        .column("NOTES", b'M', 10, 0)
        .row(&["first", memo.blocks()[0].to_string().as_str()])
        .row(&["second", ""]);
    let temp = TempTable::with_fixture(&format!("{}.dbf", name), &fixture).unwrap();
    temp.write_file(&format!("{}.dbt", name), &memo.build()).unwrap();
    temp
}

#[test]
fn test_attach_without_detach_drops_memo_pointers() {
    let mut first = memo_table("donor", b"from donor");
    let mut second = memo_table("target", b"from target");
    let donor = first.open(TableOptions::default()).unwrap();
    let target = second.open(TableOptions::default()).unwrap();

    let mut row = donor.row(0).unwrap();
    target.attach_row(&mut row, 0).unwrap();
    assert_eq!(row.get_string("NOTES").unwrap(), Some("from donor".to_string()));
    assert!(row.memo_cache_item("NOTES").unwrap().modified);
    assert_eq!(row.get_raw_string("NOTES").unwrap(), " ".repeat(10));

    assert!(matches!(
        target.update_row(&mut row),
        Err(XbaseError::NotImplemented { .. })
    ));
    assert_eq!(
        target.row(0).unwrap().get_string("NOTES").unwrap(),
        Some("from target".to_string())
    );

    let mut blank = donor.row(1).unwrap();
    target.attach_row(&mut blank, 0).unwrap();
    target.update_row(&mut blank).unwrap();
    let written = target.row(0).unwrap();
    assert_eq!(written.get_string("TITLE").unwrap(), Some("second".to_string()));
    assert!(written.is_null("NOTES").unwrap());
}

#[test]
fn test_close_releases_memo_unless_kept_open() {
    let mut temp = memo_table("closing", b"note");
    let row = {
        let table = temp.open(TableOptions::default()).unwrap();
        table.row(0).unwrap()
    };
    if let Some(table) = temp.table.take() {
        table.close().unwrap();
    }
    assert!(matches!(row.get_string("NOTES"), Err(XbaseError::State { .. })));

    let row = {
        let table = temp.open(TableOptions::default().keep_memo_open(true)).unwrap();
        table.row(0).unwrap()
    };
    if let Some(table) = temp.table.take() {
        table.close().unwrap();
    }
    assert_eq!(row.get_string("NOTES").unwrap(), Some("note".to_string()));
}

#[test]
fn test_fixed_width_column_sizes() {
    let short_long = TableFixture::new()
        .column("COUNT", b'I', 2, 0)
        .row_bytes(false, &[&[1, 0]]);
    let short_double = TableFixture::new()
        .column("RATIO", b'O', 4, 0)
        .row_bytes(false, &[&[0xC0, 0, 0, 0]]);

    for (name, fixture) in [("long.dbf", &short_long), ("double.dbf", &short_double)] {
        let mut temp = TempTable::with_fixture(name, fixture).unwrap();
        assert!(matches!(
            temp.open(TableOptions::default()),
            Err(XbaseError::Format { .. })
        ));
    }
}

#[test]
fn test_missing_memo_file() {
    let fixture = TableFixture::new()
        .type_tag(0x83)
        .column("NOTES", b'M', 10, 0)
        .row(&["1"]);
    let mut temp = TempTable::with_fixture("nomemo.dbf", &fixture).unwrap();

    assert!(matches!(
        temp.open(TableOptions::default()),
        Err(XbaseError::Configuration { .. })
    ));

    let table = temp.open(TableOptions::default().open_memo(false)).unwrap();
    assert!(table.columns().is_empty());
    assert!(table.has_memo_column());
}

#[test]
fn test_memo_without_store() {
    let fixture = TableFixture::new()
        .type_tag(0x83)
        .column("NOTES", b'M', 10, 0)
        .row(&["1"]);
    let temp = TempTable::with_fixture("nostore.dbf", &fixture).unwrap();
    let file = std::fs::File::open(&temp.path).unwrap();

    let table = Table::open_file(file, TableOptions::default()).unwrap();
    let row = table.row(0).unwrap();
    assert!(matches!(
        row.get_string("NOTES"),
        Err(XbaseError::Configuration { .. })
    ));

    let file = std::fs::File::open(&temp.path).unwrap();
    let table = Table::open_file(file, TableOptions::default().error_if_no_memo_store(false)).unwrap();
    assert_eq!(table.row(0).unwrap().get_string("NOTES").unwrap(), None);
}

#[test]
fn test_oem_codepage_needs_encoding() {
    let fixture = three_column_fixture().codepage(0x00).row(&["A", "1", "T"]);
    let mut temp = TempTable::with_fixture("oem.dbf", &fixture).unwrap();

    assert!(matches!(
        temp.open(TableOptions::default()),
        Err(XbaseError::Configuration { .. })
    ));
    let table = temp
        .open(TableOptions::default().encoding(encoding_rs::IBM866))
        .unwrap();
    assert_eq!(table.encoding(), encoding_rs::IBM866);
}

#[test]
fn test_codepage_selects_encoding() {
    let fixture = TableFixture::new()
        .codepage(0xC9)
        .column("NAME", b'C', 4, 0)
        .row_bytes(false, &[&[0xC4, 0xE0]]);
    let mut temp = TempTable::with_fixture("cyrillic.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert_eq!(table.encoding(), encoding_rs::WINDOWS_1251);
    assert_eq!(table.row(0).unwrap().get_string("NAME").unwrap(), Some("Да".to_string()));
}

#[test]
fn test_extended_layout_table() {
    let fixture = TableFixture::new()
        .type_tag(0x04)
        .column("CUSTOMER_NAME", b'C', 8, 0)
        .row(&["ACME"]);
    let mut temp = TempTable::with_fixture("extended.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert!(table.header().is_extended());
    assert_eq!(table.columns()[0].name, "CUSTOMER_NAME");
    assert_eq!(
        table.row(0).unwrap().get_string("customer_name").unwrap(),
        Some("ACME".to_string())
    );
}

#[test]
fn test_refresh_header_keeps_layout() {
    let fixture = three_column_fixture().row(&["A", "1", "T"]);
    let mut temp = TempTable::with_fixture("refresh.dbf", &fixture).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();
    table.refresh_header().unwrap();
    assert_eq!(table.record_count(), 1);
}
