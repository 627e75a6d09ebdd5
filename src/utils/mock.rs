//! Byte-level builders for table, memo and index files, plus a scratch
//! directory that owns an open table. Used by the integration tests and
//! benchmarks.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

use crate::{
    storage::{
        header::has_extended_layout,
        options::TableOptions,
        table::Table,
    },
    types::{
        BlockNo, DBT3_BLOCK_SIZE, DBT4_BLOCK_SIGNATURE, DELETED_FLAG, EOF_MARKER,
        EXTENDED_HEADER_SIZE, FIELD_TERMINATOR, KEY_EXPRESSION_SIZE, LIVE_FLAG,
        MEMO_BLOCK_SIZE_OFFSET, MEMO_VERSION_OFFSET, NDX_PAGE_SIZE, NTX_PAGE_SIZE, RecNo,
        SHORT_HEADER_SIZE, error::Result,
    },
};

#[derive(Debug, Clone)]
struct FixtureColumn {
    name: String,
    type_byte: u8,
    size: u8,
    decimals: u8,
}

/// Builds table files byte for byte, including malformed ones.
#[derive(Debug, Clone)]
pub struct TableFixture {
    type_tag: u8,
    codepage: u8,
    last_update: [u8; 3],
    columns: Vec<FixtureColumn>,
    rows: Vec<Vec<u8>>,
    eof_marker: bool,
    record_count: Option<i32>,
}

impl Default for TableFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TableFixture {
    pub fn new() -> Self {
        Self {
            type_tag: 0x03,
            codepage: 0x03,
            last_update: [124, 1, 15],
            columns: Vec::new(),
            rows: Vec::new(),
            eof_marker: true,
            record_count: None,
        }
    }

    pub fn type_tag(mut self, tag: u8) -> Self {
        self.type_tag = tag;
        self
    }

    pub fn codepage(mut self, byte: u8) -> Self {
        self.codepage = byte;
        self
    }

    pub fn last_update(mut self, year: u8, month: u8, day: u8) -> Self {
        self.last_update = [year, month, day];
        self
    }

    pub fn eof_marker(mut self, enabled: bool) -> Self {
        self.eof_marker = enabled;
        self
    }

    /// Override the declared record count.
    pub fn record_count(mut self, count: i32) -> Self {
        self.record_count = Some(count);
        self
    }

    pub fn column(mut self, name: &str, type_byte: u8, size: u8, decimals: u8) -> Self {
        self.columns.push(FixtureColumn {
            name: name.to_string(),
            type_byte,
            size,
            decimals,
        });
        self
    }

    pub fn row(self, fields: &[&str]) -> Self {
        let fields: Vec<&[u8]> = fields.iter().map(|f| f.as_bytes()).collect();
        self.row_bytes(false, &fields)
    }

    pub fn deleted_row(self, fields: &[&str]) -> Self {
        let fields: Vec<&[u8]> = fields.iter().map(|f| f.as_bytes()).collect();
        self.row_bytes(true, &fields)
    }

    /// Add a row from per-column bytes. Numeric and memo fields are
    /// right-justified, everything else left-justified, both space padded.
    pub fn row_bytes(mut self, deleted: bool, fields: &[&[u8]]) -> Self {
        let mut row = vec![if deleted { DELETED_FLAG } else { LIVE_FLAG }];
        for (i, column) in self.columns.iter().enumerate() {
            let size = column.size as usize;
            let value = fields.get(i).copied().unwrap_or_default();
            let value = &value[..value.len().min(size)];
            let padding = vec![b' '; size - value.len()];
            if matches!(column.type_byte, b'N' | b'F' | b'M') {
                row.extend_from_slice(&padding);
                row.extend_from_slice(value);
            } else {
                row.extend_from_slice(value);
                row.extend_from_slice(&padding);
            }
        }
        self.rows.push(row);
        self
    }

    /// Add a row exactly as given.
    pub fn raw_row(mut self, row: Vec<u8>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn row_length(&self) -> usize {
        1 + self.columns.iter().map(|c| c.size as usize).sum::<usize>()
    }

    pub fn first_data_offset(&self) -> usize {
        if has_extended_layout(self.type_tag) {
            EXTENDED_HEADER_SIZE + self.columns.len() * 48 + 1
        } else {
            SHORT_HEADER_SIZE + self.columns.len() * 32 + 1
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let extended = has_extended_layout(self.type_tag);
        let record_count = self.record_count.unwrap_or(self.rows.len() as i32);

        let mut bytes = vec![self.type_tag];
        bytes.extend_from_slice(&self.last_update);
        bytes.extend_from_slice(&record_count.to_le_bytes());
        bytes.extend_from_slice(&(self.first_data_offset() as i16).to_le_bytes());
        bytes.extend_from_slice(&(self.row_length() as i16).to_le_bytes());
        bytes.resize(SHORT_HEADER_SIZE, 0);
        bytes[29] = self.codepage;
        if extended {
            bytes.resize(EXTENDED_HEADER_SIZE, 0);
        }

        for column in &self.columns {
            let name = column.name.as_bytes();
            if extended {
                let mut record = [0u8; 48];
                record[..name.len().min(32)].copy_from_slice(&name[..name.len().min(32)]);
                record[32] = column.type_byte;
                record[33] = column.size;
                record[34] = column.decimals;
                bytes.extend_from_slice(&record);
            } else {
                let mut record = [0u8; 32];
                record[..name.len().min(10)].copy_from_slice(&name[..name.len().min(10)]);
                record[11] = column.type_byte;
                record[16] = column.size;
                record[17] = column.decimals;
                bytes.extend_from_slice(&record);
            }
        }
        bytes.push(FIELD_TERMINATOR);

        for row in &self.rows {
            bytes.extend_from_slice(row);
        }
        if self.eof_marker {
            bytes.push(EOF_MARKER);
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoLayout {
    V3,
    V4,
}

/// Builds memo files with one blob per `blob` call, each starting on a
/// fresh block.
#[derive(Debug, Clone)]
pub struct MemoFixture {
    layout: MemoLayout,
    block_size: usize,
    version: u8,
    blobs: Vec<Vec<u8>>,
}

impl MemoFixture {
    pub fn v3() -> Self {
        Self {
            layout: MemoLayout::V3,
            block_size: DBT3_BLOCK_SIZE,
            version: 0x03,
            blobs: Vec::new(),
        }
    }

    pub fn v4(block_size: usize) -> Self {
        Self {
            layout: MemoLayout::V4,
            block_size,
            version: 0x00,
            blobs: Vec::new(),
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn blob(mut self, data: &[u8]) -> Self {
        self.blobs.push(data.to_vec());
        self
    }

    fn encoded(&self, data: &[u8]) -> Vec<u8> {
        let mut block = Vec::new();
        match self.layout {
            MemoLayout::V3 => {
                block.extend_from_slice(data);
                block.extend_from_slice(&[EOF_MARKER, EOF_MARKER]);
            }
            MemoLayout::V4 => {
                block.extend_from_slice(&DBT4_BLOCK_SIGNATURE);
                block.extend_from_slice(&(data.len() as i32).to_le_bytes());
                block.extend_from_slice(data);
            }
        }
        let blocks = block.len().div_ceil(self.block_size).max(1);
        block.resize(blocks * self.block_size, 0);
        block
    }

    /// First block of each blob, in insertion order.
    pub fn blocks(&self) -> Vec<BlockNo> {
        let mut next = 1;
        self.blobs
            .iter()
            .map(|blob| {
                let block = next;
                next += (self.encoded(blob).len() / self.block_size) as BlockNo;
                block
            })
            .collect()
    }

    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for blob in &self.blobs {
            body.extend_from_slice(&self.encoded(blob));
        }

        let next_free = 1 + body.len() / self.block_size;
        let mut bytes = vec![0u8; self.block_size];
        bytes[0..4].copy_from_slice(&(next_free as i32).to_le_bytes());
        bytes[MEMO_VERSION_OFFSET] = self.version;
        bytes[MEMO_BLOCK_SIZE_OFFSET..MEMO_BLOCK_SIZE_OFFSET + 2]
            .copy_from_slice(&(self.block_size as i16).to_le_bytes());
        bytes.extend_from_slice(&body);
        bytes
    }
}

fn padded_key(key: &[u8], key_length: usize) -> Vec<u8> {
    let mut padded = key[..key.len().min(key_length)].to_vec();
    padded.resize(key_length, b' ');
    padded
}

/// Builds an NDX file: leaves holding the records, plus one interior root
/// page when they do not fit a single page.
#[derive(Debug, Clone)]
pub struct NdxFixture {
    expression: String,
    key_length: usize,
    unique: bool,
    keys_per_page: usize,
    entries: Vec<(Vec<u8>, RecNo)>,
}

impl NdxFixture {
    pub fn new(expression: &str, key_length: usize) -> Self {
        let record_size = Self::record_size_for(key_length);
        Self {
            expression: expression.to_string(),
            key_length,
            unique: false,
            keys_per_page: (NDX_PAGE_SIZE - 8) / record_size,
            entries: Vec::new(),
        }
    }

    fn record_size_for(key_length: usize) -> usize {
        8 + key_length.div_ceil(4) * 4
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Lower the page fill to force a two-level tree.
    pub fn keys_per_page(mut self, keys: usize) -> Self {
        self.keys_per_page = keys.max(1);
        self
    }

    /// `rec_no` is 1-based, as stored in index files.
    pub fn entry(mut self, key: &[u8], rec_no: RecNo) -> Self {
        self.entries.push((padded_key(key, self.key_length), rec_no));
        self
    }

    fn page(&self, entries: &[(PageRef, &[u8])], trailing: Option<u32>) -> Vec<u8> {
        let record_size = Self::record_size_for(self.key_length);
        let mut page = vec![0u8; NDX_PAGE_SIZE];
        page[0..4].copy_from_slice(&(entries.len() as i32).to_le_bytes());
        let mut position = 4;
        for (target, key) in entries {
            let (child, rec_no) = match target {
                PageRef::Child(page_no) => (*page_no, 0),
                PageRef::Record(rec_no) => (0, *rec_no),
            };
            page[position..position + 4].copy_from_slice(&(child as i32).to_le_bytes());
            page[position + 4..position + 8].copy_from_slice(&(rec_no as i32).to_le_bytes());
            page[position + 8..position + 8 + key.len()].copy_from_slice(key);
            position += record_size;
        }
        if let Some(child) = trailing {
            page[position..position + 4].copy_from_slice(&(child as i32).to_le_bytes());
        }
        page
    }

    pub fn build(&self) -> Vec<u8> {
        let mut entries = self.entries.clone();
        entries.sort();

        let leaves: Vec<&[(Vec<u8>, RecNo)]> = if entries.is_empty() {
            vec![&entries[..]]
        } else {
            entries.chunks(self.keys_per_page).collect()
        };

        let mut pages = Vec::new();
        for leaf in &leaves {
            let items: Vec<(PageRef, &[u8])> = leaf
                .iter()
                .map(|(key, rec_no)| (PageRef::Record(*rec_no), key.as_slice()))
                .collect();
            pages.push(self.page(&items, None));
        }

        let root = if leaves.len() == 1 {
            1
        } else {
            let separators: Vec<(PageRef, &[u8])> = leaves[..leaves.len() - 1]
                .iter()
                .enumerate()
                .map(|(i, leaf)| {
                    let last = leaf.last().map(|(key, _)| key.as_slice()).unwrap_or_default();
                    (PageRef::Child(i as u32 + 1), last)
                })
                .collect();
            pages.push(self.page(&separators, Some(leaves.len() as u32)));
            pages.len() as u32
        };

        let mut header = vec![0u8; NDX_PAGE_SIZE];
        header[0..4].copy_from_slice(&(root as i32).to_le_bytes());
        header[4..8].copy_from_slice(&(pages.len() as i32 + 1).to_le_bytes());
        header[12..14].copy_from_slice(&(self.key_length as u16).to_le_bytes());
        header[14..16].copy_from_slice(&(self.keys_per_page as u16).to_le_bytes());
        header[18..22].copy_from_slice(&(Self::record_size_for(self.key_length) as i32).to_le_bytes());
        header[23] = self.unique as u8;
        let expression = self.expression.as_bytes();
        let len = expression.len().min(KEY_EXPRESSION_SIZE - 1);
        header[24..24 + len].copy_from_slice(&expression[..len]);

        let mut bytes = header;
        for page in pages {
            bytes.extend_from_slice(&page);
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy)]
enum PageRef {
    Child(u32),
    Record(RecNo),
}

/// Builds an NTX file. Records overflowing one page are spread over leaves
/// with one record between neighbouring leaves kept in the root.
#[derive(Debug, Clone)]
pub struct NtxFixture {
    expression: String,
    key_size: usize,
    unique: bool,
    max_items: usize,
    entries: Vec<(Vec<u8>, RecNo)>,
}

impl NtxFixture {
    pub fn new(expression: &str, key_size: usize) -> Self {
        Self {
            expression: expression.to_string(),
            key_size,
            unique: false,
            max_items: (NTX_PAGE_SIZE - 2) / (key_size + 8 + 2) - 1,
            entries: Vec::new(),
        }
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    pub fn max_items(mut self, items: usize) -> Self {
        self.max_items = items.max(1);
        self
    }

    /// `rec_no` is 1-based, as stored in index files.
    pub fn entry(mut self, key: &[u8], rec_no: RecNo) -> Self {
        self.entries.push((padded_key(key, self.key_size), rec_no));
        self
    }

    fn page(&self, items: &[(u32, RecNo, &[u8])], trailing: u32) -> Vec<u8> {
        let item_size = self.key_size + 8;
        let table_end = 2 + (self.max_items + 1) * 2;
        let mut page = vec![0u8; NTX_PAGE_SIZE];
        page[0..2].copy_from_slice(&(items.len() as u16).to_le_bytes());

        for slot in 0..=self.max_items {
            let offset = table_end + slot * item_size;
            page[2 + slot * 2..4 + slot * 2].copy_from_slice(&(offset as u16).to_le_bytes());
        }
        for (i, (child, rec_no, key)) in items.iter().enumerate() {
            let offset = table_end + i * item_size;
            page[offset..offset + 4].copy_from_slice(&child.to_le_bytes());
            page[offset + 4..offset + 8].copy_from_slice(&rec_no.to_le_bytes());
            page[offset + 8..offset + 8 + key.len()].copy_from_slice(key);
        }
        let offset = table_end + items.len() * item_size;
        page[offset..offset + 4].copy_from_slice(&trailing.to_le_bytes());
        page
    }

    pub fn build(&self) -> Vec<u8> {
        let mut entries = self.entries.clone();
        entries.sort();

        let mut leaves: Vec<&[(Vec<u8>, RecNo)]> = Vec::new();
        let mut separators: Vec<&(Vec<u8>, RecNo)> = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let end = (i + self.max_items).min(entries.len());
            leaves.push(&entries[i..end]);
            i = end;
            if i < entries.len() {
                separators.push(&entries[i]);
                i += 1;
            }
        }

        let mut pages = Vec::new();
        if leaves.len() <= 1 {
            let items: Vec<(u32, RecNo, &[u8])> = leaves
                .first()
                .map(|leaf| leaf.iter().map(|(k, r)| (0, *r, k.as_slice())).collect())
                .unwrap_or_default();
            pages.push(self.page(&items, 0));
            // a lone separator can only follow a single leaf
            if let Some((key, rec_no)) = separators.first() {
                let root = vec![(NTX_PAGE_SIZE as u32, *rec_no, key.as_slice())];
                pages.push(self.page(&root, 0));
            }
        } else {
            for leaf in &leaves {
                let items: Vec<(u32, RecNo, &[u8])> =
                    leaf.iter().map(|(k, r)| (0, *r, k.as_slice())).collect();
                pages.push(self.page(&items, 0));
            }
            let children: Vec<u32> = (1..=leaves.len())
                .map(|page| (page * NTX_PAGE_SIZE) as u32)
                .collect();
            let items: Vec<(u32, RecNo, &[u8])> = separators
                .iter()
                .zip(children.iter())
                .map(|((key, rec_no), child)| (*child, *rec_no, key.as_slice()))
                .collect();
            let trailing = if separators.len() < leaves.len() {
                children[separators.len()]
            } else {
                0
            };
            pages.push(self.page(&items, trailing));
        }

        let root = (pages.len() * NTX_PAGE_SIZE) as u32;
        let item_size = self.key_size + 8;
        let mut header = vec![0u8; NTX_PAGE_SIZE];
        header[0..2].copy_from_slice(&[0x06, 0x00]);
        header[2..4].copy_from_slice(&1u16.to_le_bytes());
        header[4..8].copy_from_slice(&root.to_le_bytes());
        header[12..14].copy_from_slice(&(item_size as u16).to_le_bytes());
        header[14..16].copy_from_slice(&(self.key_size as u16).to_le_bytes());
        header[18..20].copy_from_slice(&(self.max_items as u16).to_le_bytes());
        header[20..22].copy_from_slice(&((self.max_items / 2) as u16).to_le_bytes());
        let expression = self.expression.as_bytes();
        let len = expression.len().min(KEY_EXPRESSION_SIZE - 1);
        header[22..22 + len].copy_from_slice(&expression[..len]);
        header[22 + KEY_EXPRESSION_SIZE] = self.unique as u8;

        let mut bytes = header;
        for page in pages {
            bytes.extend_from_slice(&page);
        }
        bytes
    }
}

/// A scratch directory holding one table and its companion files. The
/// table is closed and the directory removed on drop.
pub struct TempTable {
    pub table: Option<Table>,
    pub path: PathBuf,
    dir: TempDir,
}

impl TempTable {
    pub fn new(file_name: &str) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join(file_name);
        Ok(Self {
            table: None,
            path,
            dir,
        })
    }

    /// Write the table file from a fixture.
    pub fn with_fixture(file_name: &str, fixture: &TableFixture) -> io::Result<Self> {
        let temp = Self::new(file_name)?;
        fs::write(&temp.path, fixture.build())?;
        Ok(temp)
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Write a companion file next to the table.
    pub fn write_file(&self, file_name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.dir.path().join(file_name);
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn open(&mut self, options: TableOptions) -> Result<&mut Table> {
        let table = Table::open(&self.path, options)?;
        Ok(self.table.insert(table))
    }

    pub fn table(&mut self) -> Option<&mut Table> {
        self.table.as_mut()
    }
}

impl Drop for TempTable {
    fn drop(&mut self) {
        if let Some(table) = self.table.take() {
            let _ = table.close();
        }
    }
}
