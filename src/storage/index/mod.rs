pub mod cache;
pub mod ndx;
pub mod ntx;

use std::{
    fs::{File, OpenOptions},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, trace, warn};

use crate::{
    storage::{
        index::{cache::IndexPageCache, ndx::NdxIndex, ntx::NtxIndex},
        options::IndexType,
        table::RowStore,
    },
    types::{
        PageNo,
        error::{Result, XbaseError},
        page::IndexPage,
        row::Row,
    },
};

/// Deepest descent accepted before the tree is treated as cyclic.
const MAX_TREE_DEPTH: usize = 64;

/// Page-level access to one index dialect. Traversal is shared and lives
/// in `IndexFile`.
pub trait IndexFormat: std::fmt::Debug + Send {
    fn index_type(&self) -> IndexType;
    fn key_expression(&self) -> &str;
    fn key_length(&self) -> usize;
    fn is_unique(&self) -> bool;
    fn root_page(&self) -> PageNo;
    fn read_page(&mut self, page_no: PageNo) -> Result<IndexPage>;
    /// Re-read and re-check the header.
    fn revalidate(&mut self) -> Result<()>;
}

/// Key expression text: up to the first NUL, letters, digits, spaces and
/// `+ - ( )` only.
pub fn parse_key_expression(bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = &bytes[..end];
    if !text
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b' ' | b'+' | b'-' | b'(' | b')'))
    {
        return None;
    }
    let expression = String::from_utf8_lossy(text).trim().to_string();
    if expression.is_empty() {
        None
    } else {
        Some(expression)
    }
}

/// Dialect implied by a file extension, `Undefined` when unknown.
pub fn index_type_for_path(path: &Path) -> IndexType {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("ndx") => IndexType::Ndx,
        Some("ntx") => IndexType::Ntx,
        _ => IndexType::Undefined,
    }
}

#[derive(Debug, Clone)]
struct Frame {
    page_no: PageNo,
    page: Arc<IndexPage>,
    slot: usize,
}

/// An attached index: its dialect reader, page cache and traversal position.
#[derive(Debug)]
pub struct IndexFile {
    format: Box<dyn IndexFormat>,
    path: Option<PathBuf>,
    cache: IndexPageCache,
    stack: Vec<Frame>,
    skip_deleted: bool,
    current: Option<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl IndexFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        index_type: IndexType,
        skip_deleted: bool,
        cache_size: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        let index_type = match index_type {
            IndexType::Undefined => index_type_for_path(path),
            other => other,
        };
        let file = OpenOptions::new().read(true).open(path)?;
        let mut index = Self::from_file(file, index_type, skip_deleted, cache_size)?;
        index.path = Some(path.to_path_buf());
        Ok(index)
    }

    pub fn from_file(
        file: File,
        index_type: IndexType,
        skip_deleted: bool,
        cache_size: usize,
    ) -> Result<Self> {
        let format: Box<dyn IndexFormat> = match index_type {
            IndexType::Ndx => Box::new(NdxIndex::new(file)?),
            IndexType::Ntx => Box::new(NtxIndex::new(file)?),
            IndexType::Undefined => {
                return Err(XbaseError::configuration(
                    "index type is undefined and cannot be derived",
                ));
            }
        };
        Ok(Self {
            format,
            path: None,
            cache: IndexPageCache::new(cache_size),
            stack: Vec::new(),
            skip_deleted,
            current: None,
        })
    }

    pub fn index_type(&self) -> IndexType {
        self.format.index_type()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn key_expression(&self) -> &str {
        self.format.key_expression()
    }

    /// Key width in bytes.
    pub fn key_length(&self) -> usize {
        self.format.key_length()
    }

    pub fn is_unique(&self) -> bool {
        self.format.is_unique()
    }

    pub fn is_at_end(&self) -> bool {
        self.current.is_none()
    }

    pub fn current_row(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    /// Key bytes of the entry under the cursor.
    pub fn current_key(&self) -> Option<&[u8]> {
        self.current.as_ref()?;
        let frame = self.stack.last()?;
        frame.page.entry_at_slot(frame.slot).map(|e| e.key.as_slice())
    }

    pub fn skip_deleted(&self) -> bool {
        self.skip_deleted
    }

    pub fn page_cache_size(&self) -> usize {
        self.cache.capacity()
    }

    pub fn set_page_cache_size(&mut self, pages: usize) {
        debug!("Index page cache resized to {} pages", pages);
        self.cache.resize(pages);
    }

    pub fn clear_page_cache(&mut self) {
        self.cache.clear();
    }

    pub fn page_cache(&self) -> &IndexPageCache {
        &self.cache
    }

    pub fn validate(&mut self) -> Result<()> {
        self.format.revalidate()
    }

    pub fn is_valid(&mut self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Index header no longer valid: {}", e);
                false
            }
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.current = None;
    }

    fn load_page(&mut self, page_no: PageNo) -> Result<Arc<IndexPage>> {
        if let Some(page) = self.cache.get(page_no) {
            return Ok(page);
        }
        let page = Arc::new(self.format.read_page(page_no)?);
        self.cache.insert(page_no, Arc::clone(&page));
        Ok(page)
    }

    fn push(&mut self, page_no: PageNo, direction: Direction) -> Result<()> {
        if self.stack.len() >= MAX_TREE_DEPTH {
            return Err(XbaseError::corruption(format!(
                "index tree deeper than {} pages at page {}",
                MAX_TREE_DEPTH, page_no
            )));
        }
        if self.stack.iter().any(|f| f.page_no == page_no) {
            return Err(XbaseError::corruption(format!(
                "index page {} is its own ancestor",
                page_no
            )));
        }
        let page = self.load_page(page_no)?;
        let slot = match direction {
            Direction::Forward => 0,
            Direction::Backward => page.slot_count() - 1,
        };
        trace!("Descending into index page {} at slot {}", page_no, slot);
        self.stack.push(Frame { page_no, page, slot });
        Ok(())
    }

    fn advance_slot(&mut self) -> bool {
        match self.stack.last_mut() {
            Some(frame) => {
                frame.slot += 1;
                true
            }
            None => false,
        }
    }

    /// Step one slot back, leaving finished pages. False once before the first slot.
    fn retreat_slot(&mut self) -> bool {
        while let Some(frame) = self.stack.last_mut() {
            if frame.slot > 0 {
                frame.slot -= 1;
                return true;
            }
            self.stack.pop();
        }
        false
    }

    /// Move from the current slot to the nearest record entry in `direction`.
    fn settle(&mut self, direction: Direction) -> Result<Option<u32>> {
        loop {
            let (slot, slot_count, child, entry_rec) = match self.stack.last() {
                Some(frame) => (
                    frame.slot,
                    frame.page.slot_count(),
                    frame.page.child_at_slot(frame.slot),
                    frame.page.entry_at_slot(frame.slot).map(|e| e.rec_no),
                ),
                None => return Ok(None),
            };

            if slot >= slot_count {
                self.stack.pop();
                if direction == Direction::Forward {
                    self.advance_slot();
                } else if !self.retreat_slot() {
                    return Ok(None);
                }
                continue;
            }

            match entry_rec {
                Some(rec_no) if rec_no > 0 => return Ok(Some(rec_no)),
                Some(_) => {}
                None if child != 0 => {
                    self.push(child, direction)?;
                    continue;
                }
                None => {}
            }

            match direction {
                Direction::Forward => {
                    self.advance_slot();
                }
                Direction::Backward => {
                    if !self.retreat_slot() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn step(&mut self, direction: Direction) -> bool {
        match direction {
            Direction::Forward => self.advance_slot(),
            Direction::Backward => self.retreat_slot(),
        }
    }

    /// Settle on a record, then materialize rows until one passes the
    /// delete filter.
    fn resolve(&mut self, rows: &RowStore, direction: Direction) -> Result<Option<&Row>> {
        loop {
            let rec_no = match self.settle(direction)? {
                Some(rec_no) => rec_no,
                None => {
                    self.reset();
                    return Ok(None);
                }
            };

            let row = match rows.get_row(rec_no - 1, false)? {
                Some(row) => row,
                None => {
                    debug!("Index entry points past the table at record {}", rec_no);
                    self.reset();
                    return Ok(None);
                }
            };

            if self.skip_deleted && row.is_deleted() {
                if !self.step(direction) {
                    self.reset();
                    return Ok(None);
                }
                continue;
            }

            self.current = Some(row);
            return Ok(self.current.as_ref());
        }
    }

    fn top(&mut self, rows: &RowStore) -> Result<Option<&Row>> {
        self.reset();
        if rows.record_count() < 1 {
            return Ok(None);
        }
        let root = self.format.root_page();
        self.push(root, Direction::Forward)?;
        self.resolve(rows, Direction::Forward)
    }

    fn bottom(&mut self, rows: &RowStore) -> Result<Option<&Row>> {
        self.reset();
        if rows.record_count() < 1 {
            return Ok(None);
        }
        let root = self.format.root_page();
        self.push(root, Direction::Backward)?;
        self.resolve(rows, Direction::Backward)
    }

    fn walk(&mut self, rows: &RowStore, step: usize, direction: Direction) -> Result<Option<&Row>> {
        if step == 0 {
            return Err(XbaseError::range("index step", 0, i64::MAX));
        }
        if self.current.is_none() {
            return Ok(None);
        }
        for _ in 0..step {
            self.current = None;
            if !self.step(direction) {
                self.reset();
                return Ok(None);
            }
            if self.resolve(rows, direction)?.is_none() {
                return Ok(None);
            }
        }
        Ok(self.current.as_ref())
    }

    fn set_skip_deleted(&mut self, enabled: bool) {
        self.skip_deleted = enabled;
        if enabled && self.current.as_ref().is_some_and(|row| row.is_deleted()) {
            self.reset();
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.key_length() {
            return Err(XbaseError::range(
                "index key length",
                key.len() as i64,
                self.key_length() as i64,
            ));
        }
        Ok(())
    }
}

/// An attached index paired with the rows it resolves to. Obtained from
/// `Table::index`.
pub struct IndexCursor<'a> {
    pub(crate) index: &'a mut IndexFile,
    pub(crate) rows: &'a RowStore,
}

impl<'a> IndexCursor<'a> {
    /// First row in key order, `None` for an empty index or table.
    pub fn top(&mut self) -> Result<Option<&Row>> {
        self.index.top(self.rows)
    }

    /// Last row in key order.
    pub fn bottom(&mut self) -> Result<Option<&Row>> {
        self.index.bottom(self.rows)
    }

    /// Move `step` rows forward. Once past the last key the cursor is at end
    /// and stays there until `top` or `bottom`.
    pub fn next(&mut self, step: usize) -> Result<Option<&Row>> {
        self.index.walk(self.rows, step, Direction::Forward)
    }

    pub fn prev(&mut self, step: usize) -> Result<Option<&Row>> {
        self.index.walk(self.rows, step, Direction::Backward)
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<Option<&Row>> {
        self.index.check_key(key)?;
        Err(XbaseError::not_implemented("index seek"))
    }

    pub fn soft_seek(&mut self, key: &[u8]) -> Result<Option<&Row>> {
        self.index.check_key(key)?;
        Err(XbaseError::not_implemented("index soft seek"))
    }

    pub fn seek_str(&mut self, key: &str) -> Result<Option<&Row>> {
        let (bytes, _, _) = self.rows.encoding().encode(key);
        self.seek(&bytes)
    }

    pub fn soft_seek_str(&mut self, key: &str) -> Result<Option<&Row>> {
        let (bytes, _, _) = self.rows.encoding().encode(key);
        self.soft_seek(&bytes)
    }

    pub fn set_skip_deleted(&mut self, enabled: bool) {
        self.index.set_skip_deleted(enabled);
    }
}

impl Deref for IndexCursor<'_> {
    type Target = IndexFile;

    fn deref(&self) -> &IndexFile {
        self.index
    }
}

impl DerefMut for IndexCursor<'_> {
    fn deref_mut(&mut self) -> &mut IndexFile {
        self.index
    }
}
