use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Local;
use encoding_rs::Encoding;
use log::{debug, info, warn};

use crate::{
    storage::{
        header::{
            DbfHeader, TYPE_DBASE3, TYPE_DBASE3_MEMO, TYPE_DBASE4_MEMO, TYPE_DBASE4_SQL,
            TYPE_DBASE4_SQL_MEMO, TYPE_DBASE4_SQL_SYSTEM, codepage_byte_for,
        },
        index::{IndexCursor, IndexFile, index_type_for_path},
        memo::{MemoStore, is_valid_v4_block_size},
        options::{IndexType, MemoType, OpenMode, TableOptions, TableType},
        schema::{Column, ColumnDefinition, NativeType, columns_identical, read_columns},
    },
    types::{
        DBT3_BLOCK_SIZE, EOF_MARKER, FIELD_TERMINATOR, RecNo, SHORT_FIELD_RECORD_SIZE,
        SHORT_HEADER_SIZE,
        error::{Result, XbaseError},
        row::{NO_TABLE, Row, TableId},
    },
};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_table_id() -> TableId {
    NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Fixed-length record access for one open table file.
#[derive(Debug)]
pub struct RowStore {
    id: TableId,
    file: Mutex<File>,
    header: DbfHeader,
    columns: Arc<Vec<Column>>,
    encoding: &'static Encoding,
    memo: Option<Arc<MemoStore>>,
    error_if_no_memo_store: bool,
    read_only: bool,
}

impl RowStore {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn header(&self) -> &DbfHeader {
        &self.header
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    fn row_length(&self) -> usize {
        self.header.row_length as usize
    }

    fn row_offset(&self, rec_no: RecNo) -> u64 {
        self.header.first_data_offset as u64 + rec_no as u64 * self.header.row_length as u64
    }

    /// Read record `rec_no` (zero-based). Out of range is an error when
    /// `strict`, otherwise `None`.
    pub fn get_row(&self, rec_no: RecNo, strict: bool) -> Result<Option<Row>> {
        if rec_no >= self.header.record_count {
            if strict {
                return Err(XbaseError::range(
                    "record",
                    rec_no as i64,
                    self.header.record_count as i64 - 1,
                ));
            }
            return Ok(None);
        }

        let mut buffer = vec![0u8; self.row_length()];
        {
            let mut file = self.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
            file.seek(SeekFrom::Start(self.row_offset(rec_no)))?;
            file.read_exact(&mut buffer).map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    XbaseError::corruption(format!("record {} is cut short", rec_no))
                }
                _ => XbaseError::Io(e),
            })?;
        }

        let mut row = Row::with_buffer(
            Some(rec_no),
            self.id,
            buffer,
            Arc::clone(&self.columns),
            self.encoding,
        );
        row.memo_store = self.memo.clone();
        row.error_if_no_memo_store = self.error_if_no_memo_store;
        Ok(Some(row))
    }

    /// Write a row back over its record. `rehome` writes a row that is not
    /// ours (or has no record number) to the given record instead.
    pub fn update_row(&self, row: &mut Row, rehome: Option<RecNo>) -> Result<()> {
        if self.read_only {
            return Err(XbaseError::state("table is open read-only"));
        }

        let rec_no = match rehome {
            Some(rec_no) => {
                if !columns_identical(&row.columns, &self.columns) {
                    return Err(XbaseError::state("row columns differ from the table's"));
                }
                rec_no
            }
            None => {
                if row.table_id != self.id {
                    return Err(XbaseError::state("row belongs to another table"));
                }
                row.rec_no
                    .ok_or_else(|| XbaseError::state("row has no record number"))?
            }
        };

        if rec_no >= self.header.record_count {
            return Err(XbaseError::state(format!(
                "record {} is past the last record {}",
                rec_no,
                self.header.record_count as i64 - 1
            )));
        }
        if row.buffer.len() != self.row_length() {
            return Err(XbaseError::state(format!(
                "row buffer holds {} bytes, table rows hold {}",
                row.buffer.len(),
                self.row_length()
            )));
        }
        if row
            .memo_cache
            .values()
            .any(|item| item.modified && !item.data.is_empty())
        {
            return Err(XbaseError::not_implemented("memo write"));
        }

        {
            let mut file = self.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
            file.seek(SeekFrom::Start(self.row_offset(rec_no)))?;
            file.write_all(&row.buffer)?;
            file.flush()?;
        }
        debug!("Wrote record {}", rec_no);

        for item in row.memo_cache.values_mut() {
            item.modified = false;
        }
        row.modified = false;
        if rehome.is_some() {
            row.table_id = self.id;
            row.rec_no = Some(rec_no);
        }
        Ok(())
    }

    pub fn insert_row(&self, _row: &mut Row) -> Result<()> {
        Err(XbaseError::not_implemented("insert row"))
    }

    /// Update when the row is one of ours, insert otherwise.
    pub fn write_row(&self, row: &mut Row) -> Result<()> {
        if row.table_id == self.id && row.rec_no.is_some() {
            self.update_row(row, None)
        } else {
            self.insert_row(row)
        }
    }

    /// Turn a row of this table into an orphan, keeping its memo content.
    pub fn detach_row(&self, row: &mut Row) -> Result<()> {
        if row.table_id != self.id {
            return Err(XbaseError::state("row belongs to another table"));
        }
        row.cache_memos()?;
        row.table_id = NO_TABLE;
        row.rec_no = None;
        row.memo_store = None;
        Ok(())
    }

    /// Adopt a row with identical columns as record `rec_no`. Memo content is
    /// read from the row's previous memo store first. Block pointers are then
    /// blanked and any non-empty content is marked dirty.
    pub fn attach_row(&self, row: &mut Row, rec_no: RecNo) -> Result<()> {
        if !columns_identical(&row.columns, &self.columns) {
            return Err(XbaseError::state("row columns differ from the table's"));
        }
        if rec_no >= self.header.record_count {
            return Err(XbaseError::state(format!(
                "record {} is past the last record {}",
                rec_no,
                self.header.record_count as i64 - 1
            )));
        }

        if row.memo_store.is_some() {
            row.cache_memos()?;
        }

        row.table_id = self.id;
        row.rec_no = Some(rec_no);
        row.columns = Arc::clone(&self.columns);
        row.encoding = self.encoding;
        row.memo_store = self.memo.clone();
        row.error_if_no_memo_store = self.error_if_no_memo_store;

        for column in row.columns.iter().filter(|c| c.native_type == NativeType::Memo) {
            column.set_null(&mut row.buffer)?;
        }
        for item in row.memo_cache.values_mut() {
            item.modified = !item.data.is_empty();
        }
        row.modified = true;
        Ok(())
    }
}

/// An open table file with its optional memo store and indexes.
#[derive(Debug)]
pub struct Table {
    rows: RowStore,
    indexes: Vec<IndexFile>,
    options: TableOptions,
    path: Option<PathBuf>,
    has_memo_column: bool,
}

impl Table {
    /// Open a table file and, when its schema has memo columns, the `.dbt`
    /// file next to it.
    pub fn open<P: AsRef<Path>>(path: P, options: TableOptions) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening table {}", path.display());
        let file = OpenOptions::new()
            .read(true)
            .write(options.open_mode == OpenMode::ReadWrite)
            .open(path)?;

        let mut table = Self::open_file(file, options)?;
        table.path = Some(path.to_path_buf());

        if table.has_memo_column && table.options.open_memo {
            let memo_path = find_companion(path, "dbt").ok_or_else(|| {
                XbaseError::configuration(format!(
                    "memo file for {} not found",
                    path.display()
                ))
            })?;
            table.attach_memo(memo_path, table.options.memo_type)?;
        }
        Ok(table)
    }

    /// Open from an already opened stream. Memo and index files must be
    /// attached explicitly.
    pub fn open_file(mut file: File, options: TableOptions) -> Result<Self> {
        let header = DbfHeader::read_from(&mut file, options.only_dbase3)?;
        let schema = read_columns(&mut file, &header, options.open_memo)?;

        if header.row_length as usize != schema.data_width + 1 {
            return Err(XbaseError::format(format!(
                "row length {} does not match the column widths ({} + 1)",
                header.row_length, schema.data_width
            )));
        }

        let encoding = resolve_encoding(&header, &schema.columns, &options)?;
        debug!(
            "Table has {} columns, {} records, encoding {}",
            schema.columns.len(),
            header.record_count,
            encoding.name()
        );

        let rows = RowStore {
            id: next_table_id(),
            file: Mutex::new(file),
            header,
            columns: Arc::new(schema.columns),
            encoding,
            memo: None,
            error_if_no_memo_store: options.error_if_no_memo_store,
            read_only: options.open_mode == OpenMode::ReadOnly,
        };

        Ok(Self {
            rows,
            indexes: Vec::new(),
            options,
            path: None,
            has_memo_column: schema.has_memo,
        })
    }

    /// Create an empty table file (and an empty `.dbt` when a memo column
    /// is defined), then open it.
    pub fn create<P: AsRef<Path>>(
        path: P,
        definitions: &[ColumnDefinition],
        options: TableOptions,
    ) -> Result<Self> {
        let memo_type = options.memo_type;
        Self::create_with_memo(path, definitions, memo_type, DBT3_BLOCK_SIZE, options)
    }

    /// Like `create`, with an explicit memo dialect and block size. Anything
    /// but `Dbt4` creates a v3 memo file.
    pub fn create_with_memo<P: AsRef<Path>>(
        path: P,
        definitions: &[ColumnDefinition],
        memo_type: MemoType,
        block_size: usize,
        options: TableOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        if definitions.is_empty() {
            return Err(XbaseError::format("a table needs at least one column"));
        }
        for (i, definition) in definitions.iter().enumerate() {
            definition.validate()?;
            if definitions[..i]
                .iter()
                .any(|d| d.name.eq_ignore_ascii_case(&definition.name))
            {
                return Err(XbaseError::format(format!(
                    "duplicate column name {}",
                    definition.name
                )));
            }
        }

        let codepage_byte = match options.encoding {
            Some(encoding) => codepage_byte_for(encoding).ok_or_else(|| {
                XbaseError::configuration(format!(
                    "no codepage byte for encoding {}",
                    encoding.name()
                ))
            })?,
            None => 0x03,
        };

        let has_memo = definitions.iter().any(|d| d.native_type == NativeType::Memo);
        let memo_type = match memo_type {
            MemoType::Dbt4 => MemoType::Dbt4,
            _ => MemoType::Dbt3,
        };
        let type_tag = match (has_memo, memo_type) {
            (false, _) => TYPE_DBASE3,
            (true, MemoType::Dbt4) => TYPE_DBASE4_MEMO,
            (true, _) => TYPE_DBASE3_MEMO,
        };

        let row_length = 1 + definitions.iter().map(|d| d.size).sum::<usize>();
        let first_data_offset = SHORT_HEADER_SIZE + definitions.len() * SHORT_FIELD_RECORD_SIZE + 1;
        if row_length > i16::MAX as usize || first_data_offset > i16::MAX as usize {
            return Err(XbaseError::format(format!(
                "{} columns of {} bytes do not fit a table header",
                definitions.len(),
                row_length - 1
            )));
        }

        let header = DbfHeader {
            type_tag,
            last_update: Local::now().date_naive(),
            record_count: 0,
            first_data_offset: first_data_offset as u16,
            row_length: row_length as u16,
            codepage_byte,
        };

        let mut bytes = header.to_bytes();
        for definition in definitions {
            bytes.extend_from_slice(&definition.to_record());
        }
        bytes.push(FIELD_TERMINATOR);
        bytes.push(EOF_MARKER);

        if has_memo && options.open_memo {
            match memo_type {
                MemoType::Dbt4 if !is_valid_v4_block_size(block_size as i64) => {
                    return Err(XbaseError::format(format!("v4 memo block size {}", block_size)));
                }
                MemoType::Dbt3 if block_size != DBT3_BLOCK_SIZE => {
                    return Err(XbaseError::format(format!("v3 memo block size {}", block_size)));
                }
                _ => {}
            }
        }

        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.write_all(&bytes)?;
        file.flush()?;
        drop(file);
        info!(
            "Created table {} with {} columns",
            path.display(),
            definitions.len()
        );

        if has_memo && options.open_memo {
            MemoStore::create(path.with_extension("dbt"), memo_type, block_size)?;
        }

        let options = if has_memo { options.memo_type(memo_type) } else { options };
        Self::open(path, options)
    }

    pub fn id(&self) -> TableId {
        self.rows.id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub fn header(&self) -> &DbfHeader {
        &self.rows.header
    }

    pub fn columns(&self) -> &[Column] {
        &self.rows.columns
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.rows.columns.iter().find(|c| c.is_named(name))
    }

    pub fn record_count(&self) -> u32 {
        self.rows.header.record_count
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.rows.encoding
    }

    /// True when the schema declares memo columns, opened or not.
    pub fn has_memo_column(&self) -> bool {
        self.has_memo_column
    }

    pub fn rows(&self) -> &RowStore {
        &self.rows
    }

    /// Record `rec_no`, failing when it is out of range.
    pub fn row(&self, rec_no: RecNo) -> Result<Row> {
        self.rows
            .get_row(rec_no, true)?
            .ok_or_else(|| XbaseError::range("record", rec_no as i64, self.record_count() as i64 - 1))
    }

    pub fn get_row(&self, rec_no: RecNo, strict: bool) -> Result<Option<Row>> {
        self.rows.get_row(rec_no, strict)
    }

    pub fn update_row(&self, row: &mut Row) -> Result<()> {
        self.rows.update_row(row, None)
    }

    pub fn write_row(&self, row: &mut Row) -> Result<()> {
        self.rows.write_row(row)
    }

    pub fn insert_row(&self, row: &mut Row) -> Result<()> {
        self.rows.insert_row(row)
    }

    pub fn detach_row(&self, row: &mut Row) -> Result<()> {
        self.rows.detach_row(row)
    }

    pub fn attach_row(&self, row: &mut Row, rec_no: RecNo) -> Result<()> {
        self.rows.attach_row(row, rec_no)
    }

    /// Re-read the header, picking up records appended by another writer.
    pub fn refresh_header(&mut self) -> Result<()> {
        let header = {
            let mut file = self.rows.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
            DbfHeader::read_from(&mut *file, self.options.only_dbase3)?
        };
        if header.row_length != self.rows.header.row_length
            || header.first_data_offset != self.rows.header.first_data_offset
        {
            return Err(XbaseError::state("table layout changed since open"));
        }
        debug!(
            "Header refreshed: {} -> {} records",
            self.rows.header.record_count, header.record_count
        );
        self.rows.header = header;
        Ok(())
    }

    /// Memo dialect implied by the options, then the type tag.
    pub fn default_memo_type(&self) -> MemoType {
        if self.options.memo_type != MemoType::Undefined {
            return self.options.memo_type;
        }
        let tag = self.rows.header.type_tag;
        if self.rows.header.is_extended() && self.has_memo_column {
            return MemoType::Dbt4;
        }
        match tag {
            TYPE_DBASE3 if self.has_memo_column => MemoType::Dbt3,
            TYPE_DBASE4_SQL | TYPE_DBASE4_SQL_SYSTEM if self.has_memo_column => MemoType::Dbt4,
            TYPE_DBASE3_MEMO => MemoType::Dbt3,
            TYPE_DBASE4_MEMO | TYPE_DBASE4_SQL_MEMO => MemoType::Dbt4,
            _ => match self.options.table_type {
                TableType::DBaseIII | TableType::Clipper if self.has_memo_column => MemoType::Dbt3,
                _ => MemoType::Undefined,
            },
        }
    }

    pub fn memo_store(&self) -> Option<Arc<MemoStore>> {
        self.rows.memo.clone()
    }

    /// Attach a memo file; `Undefined` picks the table default, then detects
    /// from the file itself.
    pub fn attach_memo<P: AsRef<Path>>(&mut self, path: P, memo_type: MemoType) -> Result<()> {
        let memo_type = match memo_type {
            MemoType::Undefined => self.default_memo_type(),
            known => known,
        };
        let store = MemoStore::open(path, memo_type, &self.options)?;
        self.set_memo_store(store);
        Ok(())
    }

    pub fn attach_memo_file(&mut self, file: File, memo_type: MemoType) -> Result<()> {
        let memo_type = match memo_type {
            MemoType::Undefined => self.default_memo_type(),
            known => known,
        };
        let store = MemoStore::from_file(file, memo_type, &self.options)?;
        self.set_memo_store(store);
        Ok(())
    }

    fn set_memo_store(&mut self, store: MemoStore) {
        if !self.has_memo_column {
            warn!("Attaching a memo file to a table without memo columns");
        }
        debug!(
            "Memo store attached: {:?}, block size {}",
            store.memo_type(),
            store.block_size()
        );
        self.rows.memo = Some(Arc::new(store));
    }

    /// Attach an index file and return its handle. The dialect comes from
    /// the extension, else from the options.
    pub fn attach_index<P: AsRef<Path>>(
        &mut self,
        path: P,
        skip_deleted: Option<bool>,
    ) -> Result<usize> {
        let path = path.as_ref();
        let index_type = match index_type_for_path(path) {
            IndexType::Undefined => self.default_index_type()?,
            known => known,
        };
        let index = IndexFile::open(
            path,
            index_type,
            skip_deleted.unwrap_or(self.options.skip_deleted),
            self.options.index_page_cache,
        )?;
        info!(
            "Attached {:?} index {} on '{}'",
            index_type,
            path.display(),
            index.key_expression()
        );
        self.indexes.push(index);
        Ok(self.indexes.len() - 1)
    }

    /// Attach `<table name><suffix>.<ext>` from the table's directory.
    pub fn attach_index_by_type(
        &mut self,
        index_type: IndexType,
        suffix: Option<&str>,
    ) -> Result<usize> {
        let index_type = match index_type {
            IndexType::Undefined => self.default_index_type()?,
            known => known,
        };
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| XbaseError::configuration("table was not opened from a path"))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = index_type.extension().unwrap_or_default();
        let name = format!("{}{}.{}", stem, suffix.unwrap_or_default(), extension);
        let index_path = path.with_file_name(name);
        let index_path = find_companion(&index_path, extension).unwrap_or(index_path);
        self.attach_index(index_path, None)
    }

    fn default_index_type(&self) -> Result<IndexType> {
        match (self.options.index_type, self.options.table_type) {
            (IndexType::Undefined, TableType::Clipper) => Ok(IndexType::Ntx),
            (IndexType::Undefined, TableType::DBaseIII) => Ok(IndexType::Ndx),
            (IndexType::Undefined, TableType::Undefined) => Err(XbaseError::configuration(
                "index type is not set and cannot be derived",
            )),
            (known, _) => Ok(known),
        }
    }

    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Cursor over an attached index.
    pub fn index(&mut self, handle: usize) -> Result<IndexCursor<'_>> {
        let count = self.indexes.len();
        let index = self
            .indexes
            .get_mut(handle)
            .ok_or_else(|| XbaseError::range("index handle", handle as i64, count as i64 - 1))?;
        Ok(IndexCursor {
            index,
            rows: &self.rows,
        })
    }

    /// Flush and release the table, memo and index files. The memo file is
    /// closed for rows still holding it unless `keep_memo_open` is set.
    pub fn close(self) -> Result<()> {
        {
            let mut file = self.rows.file.lock().map_err(|_| XbaseError::LockPoisoned)?;
            if !self.rows.read_only {
                file.flush()?;
            }
        }
        if let Some(memo) = &self.rows.memo {
            if !self.options.keep_memo_open {
                memo.close()?;
            }
        }
        info!(
            "Closed table {} ({} indexes)",
            self.path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<stream>".to_string()),
            self.indexes.len()
        );
        Ok(())
    }
}

fn resolve_encoding(
    header: &DbfHeader,
    columns: &[Column],
    options: &TableOptions,
) -> Result<&'static Encoding> {
    if let Some(encoding) = options.encoding {
        return Ok(encoding);
    }
    if let Some(encoding) = header.codepage().and_then(|c| c.encoding()) {
        return Ok(encoding);
    }
    if columns.iter().any(|c| c.native_type.is_text()) {
        return Err(XbaseError::configuration(format!(
            "codepage byte 0x{:02X} has no known encoding; pass one in the options",
            header.codepage_byte
        )));
    }
    Ok(encoding_rs::WINDOWS_1252)
}

/// `path` with `extension`, matching the file name case-insensitively in
/// its directory when the exact name is missing.
fn find_companion(path: &Path, extension: &str) -> Option<PathBuf> {
    let wanted = path.with_extension(extension);
    if wanted.exists() {
        return Some(wanted);
    }

    let name = wanted.file_name()?.to_string_lossy().to_ascii_lowercase();
    let dir = match wanted.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|candidate| {
            candidate
                .file_name()
                .is_some_and(|n| n.to_string_lossy().to_ascii_lowercase() == name)
        })
}
