use std::fs;

use xbase::{
    storage::{
        index::IndexCursor,
        options::{IndexType, TableOptions, TableType},
    },
    types::{error::XbaseError, row::Row},
    utils::mock::{NdxFixture, NtxFixture, TableFixture, TempTable},
};

const SORTED: [&str; 5] = ["ALPHA", "BRAVO", "CHARLIE", "DELTA", "ECHO"];

fn people(deleted_bravo: bool) -> TableFixture {
    let fixture = TableFixture::new()
        .column("NAME", b'C', 10, 0)
        .row(&["DELTA"])
        .row(&["ALPHA"])
        .row(&["ECHO"]);
    let fixture = if deleted_bravo {
        fixture.deleted_row(&["BRAVO"])
    } else {
        fixture.row(&["BRAVO"])
    };
    fixture.row(&["CHARLIE"])
}

fn with_entries(ndx: NdxFixture) -> NdxFixture {
    ndx.entry(b"DELTA", 1)
        .entry(b"ALPHA", 2)
        .entry(b"ECHO", 3)
        .entry(b"BRAVO", 4)
        .entry(b"CHARLIE", 5)
}

fn ntx_entries(ntx: NtxFixture) -> NtxFixture {
    ntx.entry(b"DELTA", 1)
        .entry(b"ALPHA", 2)
        .entry(b"ECHO", 3)
        .entry(b"BRAVO", 4)
        .entry(b"CHARLIE", 5)
}

fn name_of(row: Option<&Row>) -> Option<String> {
    row.map(|r| r.get_string("NAME").unwrap().unwrap())
}

fn forward(cursor: &mut IndexCursor<'_>) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = name_of(cursor.top().unwrap());
    while let Some(name) = current {
        names.push(name);
        current = name_of(cursor.next(1).unwrap());
    }
    names
}

fn backward(cursor: &mut IndexCursor<'_>) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = name_of(cursor.bottom().unwrap());
    while let Some(name) = current {
        names.push(name);
        current = name_of(cursor.prev(1).unwrap());
    }
    names
}

fn open_with_index(
    table_name: &str,
    table: &TableFixture,
    index_name: &str,
    index_bytes: &[u8],
    options: TableOptions,
) -> (TempTable, usize) {
    let mut temp = TempTable::with_fixture(table_name, table).unwrap();
    let index_path = temp.write_file(index_name, index_bytes).unwrap();
    let handle = temp.open(options).unwrap().attach_index(&index_path, None).unwrap();
    (temp, handle)
}

#[test]
fn test_ndx_single_page_order() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert_eq!(cursor.index_type(), IndexType::Ndx);
    assert_eq!(cursor.key_expression(), "NAME");
    assert_eq!(cursor.key_length(), 7);
    assert!(!cursor.is_unique());
    assert_eq!(forward(&mut cursor), SORTED);
    assert!(cursor.is_at_end());
}

#[test]
fn test_ndx_two_level_order() {
    for cache in [0, 10] {
        let ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
        let (mut temp, handle) = open_with_index(
            "people.dbf",
            &people(false),
            "people.ndx",
            &ndx,
            TableOptions::default().index_page_cache(cache),
        );
        let table = temp.table().unwrap();
        let mut cursor = table.index(handle).unwrap();

        assert_eq!(forward(&mut cursor), SORTED);
        let mut reversed: Vec<String> = SORTED.iter().map(|s| s.to_string()).collect();
        reversed.reverse();
        assert_eq!(backward(&mut cursor), reversed);
    }
}

#[test]
fn test_ntx_order_and_keys() {
    let ntx = ntx_entries(NtxFixture::new("NAME", 7).unique(true).max_items(2)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ntx", &ntx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert_eq!(cursor.index_type(), IndexType::Ntx);
    assert!(cursor.is_unique());
    assert_eq!(forward(&mut cursor), SORTED);

    let mut keys = Vec::new();
    cursor.top().unwrap();
    while !cursor.is_at_end() {
        keys.push(cursor.current_key().unwrap().to_vec());
        cursor.next(1).unwrap();
    }
    assert_eq!(keys.len(), 5);
    assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(keys[0], b"ALPHA  ");
}

#[test]
fn test_ntx_single_page() {
    let ntx = ntx_entries(NtxFixture::new("NAME", 7)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ntx", &ntx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert_eq!(name_of(cursor.bottom().unwrap()), Some("ECHO".to_string()));
    assert_eq!(name_of(cursor.prev(2).unwrap()), Some("CHARLIE".to_string()));
    assert_eq!(name_of(cursor.next(1).unwrap()), Some("DELTA".to_string()));
}

#[test]
fn test_multi_step_moves() {
    let ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert!(cursor.next(1).unwrap().is_none());
    assert_eq!(name_of(cursor.top().unwrap()), Some("ALPHA".to_string()));
    assert_eq!(name_of(cursor.next(2).unwrap()), Some("CHARLIE".to_string()));
    assert_eq!(name_of(cursor.next(2).unwrap()), Some("ECHO".to_string()));
    assert!(cursor.next(1).unwrap().is_none());
    assert!(cursor.prev(1).unwrap().is_none());

    assert!(matches!(cursor.next(0), Err(XbaseError::Range { .. })));
}

#[test]
fn test_skip_deleted_rows() {
    let ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
    let (mut temp, handle) = open_with_index(
        "people.dbf",
        &people(true),
        "people.ndx",
        &ndx,
        TableOptions::default().skip_deleted(true),
    );
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert!(cursor.skip_deleted());
    assert_eq!(forward(&mut cursor), ["ALPHA", "CHARLIE", "DELTA", "ECHO"]);
    assert_eq!(backward(&mut cursor), ["ECHO", "DELTA", "CHARLIE", "ALPHA"]);

    cursor.set_skip_deleted(false);
    assert_eq!(forward(&mut cursor), SORTED);
}

#[test]
fn test_enabling_skip_on_deleted_row_leaves_cursor_at_end() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(true), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    cursor.top().unwrap();
    let row = cursor.next(1).unwrap().unwrap();
    assert!(row.is_deleted());

    cursor.set_skip_deleted(true);
    assert!(cursor.is_at_end());
    assert!(cursor.current_row().is_none());
}

#[test]
fn test_empty_table() {
    let fixture = TableFixture::new().column("NAME", b'C', 10, 0);
    let ndx = NdxFixture::new("NAME", 7).build();
    let (mut temp, handle) =
        open_with_index("empty.dbf", &fixture, "empty.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert!(cursor.top().unwrap().is_none());
    assert!(cursor.bottom().unwrap().is_none());
    assert!(cursor.is_at_end());
}

#[test]
fn test_entry_past_last_record_ends_traversal() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).entry(b"ZULU", 9).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert_eq!(forward(&mut cursor), SORTED);
}

#[test]
fn test_seek_checks_key_length() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert!(matches!(cursor.seek(b"TOOLONGKEY"), Err(XbaseError::Range { .. })));
    assert!(matches!(cursor.soft_seek(b"TOOLONGKEY"), Err(XbaseError::Range { .. })));
    assert!(matches!(cursor.seek(b"ALPHA"), Err(XbaseError::NotImplemented { .. })));
    assert!(matches!(cursor.soft_seek_str("BR"), Err(XbaseError::NotImplemented { .. })));
    assert!(matches!(cursor.seek_str("CHARLIE"), Err(XbaseError::NotImplemented { .. })));
}

#[test]
fn test_page_cache_statistics() {
    let ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
    let (mut temp, handle) = open_with_index(
        "people.dbf",
        &people(false),
        "people.ndx",
        &ndx,
        TableOptions::default().index_page_cache(10),
    );
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();
    assert_eq!(cursor.page_cache_size(), 10);

    forward(&mut cursor);
    assert_eq!(cursor.page_cache().created_count(), 4);
    assert_eq!(cursor.page_cache().read_count(), 0);

    forward(&mut cursor);
    assert_eq!(cursor.page_cache().created_count(), 4);
    assert_eq!(cursor.page_cache().read_count(), 4);
    assert_eq!(cursor.page_cache().len(), 4);

    cursor.set_page_cache_size(2);
    assert_eq!(cursor.page_cache().len(), 2);
    cursor.clear_page_cache();
    assert!(cursor.page_cache().is_empty());
    assert_eq!(forward(&mut cursor), SORTED);
}

#[test]
fn test_no_cache_keeps_nothing() {
    let ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    forward(&mut cursor);
    assert_eq!(cursor.page_cache().created_count(), 0);
    assert!(cursor.page_cache().is_empty());
}

#[test]
fn test_cyclic_tree_is_corruption() {
    let mut ndx = with_entries(NdxFixture::new("NAME", 7).keys_per_page(2)).build();
    // root is page 4; point its first child back at itself
    ndx[4 * 512 + 4..4 * 512 + 8].copy_from_slice(&4i32.to_le_bytes());
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let table = temp.table().unwrap();
    let mut cursor = table.index(handle).unwrap();

    assert!(matches!(cursor.top(), Err(XbaseError::Corruption { .. })));
}

#[test]
fn test_bad_index_headers() {
    let mut temp = TempTable::with_fixture("people.dbf", &people(false)).unwrap();
    let short = temp.write_file("short.ndx", &[0u8; 600]).unwrap();
    let mut ntx = ntx_entries(NtxFixture::new("NAME", 7)).build();
    ntx[0] = 0x05;
    let unsigned = temp.write_file("unsigned.ntx", &ntx).unwrap();
    let table = temp.open(TableOptions::default()).unwrap();

    assert!(matches!(table.attach_index(&short, None), Err(XbaseError::Format { .. })));
    assert!(matches!(table.attach_index(&unsigned, None), Err(XbaseError::Format { .. })));
    assert_eq!(table.index_count(), 0);
    assert!(matches!(table.index(0), Err(XbaseError::Range { .. })));
}

#[test]
fn test_index_type_from_options() {
    let mut temp = TempTable::with_fixture("people.dbf", &people(false)).unwrap();
    let ntx = ntx_entries(NtxFixture::new("NAME", 7)).build();
    let path = temp.write_file("people.idx", &ntx).unwrap();

    let table = temp.open(TableOptions::default()).unwrap();
    assert!(matches!(
        table.attach_index(&path, None),
        Err(XbaseError::Configuration { .. })
    ));

    let table = temp
        .open(TableOptions::default().table_type(TableType::Clipper))
        .unwrap();
    let handle = table.attach_index(&path, None).unwrap();
    assert_eq!(table.index(handle).unwrap().index_type(), IndexType::Ntx);
}

#[test]
fn test_attach_index_by_type_with_suffix() {
    let mut temp = TempTable::with_fixture("people.dbf", &people(false)).unwrap();
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    temp.write_file("PEOPLE_NAME.NDX", &ndx).unwrap();

    let table = temp.open(TableOptions::default()).unwrap();
    let handle = table
        .attach_index_by_type(IndexType::Ndx, Some("_name"))
        .unwrap();
    let mut cursor = table.index(handle).unwrap();
    assert!(cursor.path().unwrap().ends_with("PEOPLE_NAME.NDX"));
    assert_eq!(forward(&mut cursor), SORTED);

    assert!(matches!(
        table.attach_index_by_type(IndexType::Undefined, None),
        Err(XbaseError::Configuration { .. })
    ));
}

#[test]
fn test_revalidation_after_file_change() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    let (mut temp, handle) =
        open_with_index("people.dbf", &people(false), "people.ndx", &ndx, TableOptions::default());
    let index_path = temp.dir().join("people.ndx");
    let table = temp.table().unwrap();

    assert!(table.index(handle).unwrap().is_valid());
    fs::write(&index_path, [0u8; 100]).unwrap();
    let mut cursor = table.index(handle).unwrap();
    assert!(!cursor.is_valid());
    assert!(matches!(cursor.validate(), Err(XbaseError::Format { .. })));
}

#[test]
fn test_two_indexes_on_one_table() {
    let ndx = with_entries(NdxFixture::new("NAME", 7)).build();
    let ntx = ntx_entries(NtxFixture::new("NAME", 7).max_items(2)).build();
    let mut temp = TempTable::with_fixture("people.dbf", &people(false)).unwrap();
    let ndx_path = temp.write_file("people.ndx", &ndx).unwrap();
    let ntx_path = temp.write_file("people.ntx", &ntx).unwrap();

    let table = temp.open(TableOptions::default()).unwrap();
    let first = table.attach_index(&ndx_path, None).unwrap();
    let second = table.attach_index(&ntx_path, Some(true)).unwrap();
    assert_eq!(table.index_count(), 2);

    table.index(first).unwrap().top().unwrap();
    assert_eq!(forward(&mut table.index(second).unwrap()), SORTED);
    assert!(table.index(second).unwrap().skip_deleted());

    let current = name_of(table.index(first).unwrap().current_row());
    assert_eq!(current, Some("ALPHA".to_string()));
}
