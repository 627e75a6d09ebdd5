use encoding_rs::Encoding;

use crate::types::{DBT3_BLOCK_SIZE, MAX_PAGE_CACHE_SIZE};

pub const DEFAULT_MAX_BLOB_SIZE: usize = 256 * 1024;
pub const MIN_BLOB_SIZE: usize = 64 * 1024;
pub const MAX_BLOB_SIZE: usize = 512 * 1024 * 1024;

/// How hard memo file headers are checked on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Strictness {
    None,
    Weak,
    Medium,
    Potent,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoType {
    Undefined,
    Dbt3,
    Dbt4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Undefined,
    Ndx,
    Ntx,
}

impl IndexType {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            IndexType::Ndx => Some("ndx"),
            IndexType::Ntx => Some("ntx"),
            IndexType::Undefined => None,
        }
    }
}

/// Writer family of a table; only used to pick default memo/index dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Undefined,
    DBaseIII,
    Clipper,
}

/// Byte(s) that end a v3 memo blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoTerminators {
    /// 0x1A
    Eof,
    /// 0x00
    Eos,
    Both,
}

impl MemoTerminators {
    pub fn matches(&self, byte: u8) -> bool {
        match self {
            MemoTerminators::Eof => byte == 0x1A,
            MemoTerminators::Eos => byte == 0x00,
            MemoTerminators::Both => byte == 0x1A || byte == 0x00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Settings threaded through table open/create and the stores they attach.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Text encoding for character and memo fields (default: derived from the codepage byte)
    pub encoding: Option<&'static Encoding>,

    /// Keep memo columns and attach the memo file (default: true)
    pub open_memo: bool,

    /// Memo dialect (default: derived from the table type tag)
    pub memo_type: MemoType,

    /// Index dialect used when a file name carries no extension (default: undefined)
    pub index_type: IndexType,

    pub table_type: TableType,

    /// Memo header validation level (default: medium)
    pub strictness: Strictness,

    /// Terminator bytes for v3 memo blobs (default: 0x1A)
    pub memo_terminators: MemoTerminators,

    /// Upper bound for a single memo blob (default: 256KB)
    pub max_blob_size: usize,

    /// Fail memo decode when no memo store is attached (default: true)
    pub error_if_no_memo_store: bool,

    /// Leave the memo file open after the table closes, for rows that still
    /// reference it (default: false)
    pub keep_memo_open: bool,

    /// Reject type tags outside the known set (default: false)
    pub only_dbase3: bool,

    /// Index cursors skip deleted rows (default: false)
    pub skip_deleted: bool,

    /// Page cache capacity for attached indexes, 0 disables it (default: 0)
    pub index_page_cache: usize,

    pub open_mode: OpenMode,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            encoding: None,
            open_memo: true,
            memo_type: MemoType::Undefined,
            index_type: IndexType::Undefined,
            table_type: TableType::Undefined,
            strictness: Strictness::Medium,
            memo_terminators: MemoTerminators::Eof,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            error_if_no_memo_store: true,
            keep_memo_open: false,
            only_dbase3: false,
            skip_deleted: false,
            index_page_cache: 0,
            open_mode: OpenMode::ReadWrite,
        }
    }
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the text encoding
    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn open_memo(mut self, enabled: bool) -> Self {
        self.open_memo = enabled;
        self
    }

    pub fn memo_type(mut self, memo_type: MemoType) -> Self {
        self.memo_type = memo_type;
        self
    }

    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn table_type(mut self, table_type: TableType) -> Self {
        self.table_type = table_type;
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn memo_terminators(mut self, terminators: MemoTerminators) -> Self {
        self.memo_terminators = terminators;
        self
    }

    /// Set the maximum memo blob size, clamped to 64KB..=512MB and rounded up to 512 bytes
    pub fn max_blob_size(mut self, size: usize) -> Self {
        self.max_blob_size = clamp_blob_size(size);
        self
    }

    pub fn error_if_no_memo_store(mut self, enabled: bool) -> Self {
        self.error_if_no_memo_store = enabled;
        self
    }

    pub fn keep_memo_open(mut self, enabled: bool) -> Self {
        self.keep_memo_open = enabled;
        self
    }

    pub fn only_dbase3(mut self, enabled: bool) -> Self {
        self.only_dbase3 = enabled;
        self
    }

    pub fn skip_deleted(mut self, enabled: bool) -> Self {
        self.skip_deleted = enabled;
        self
    }

    /// Set the default page cache capacity for indexes (capped at 100000 pages)
    pub fn index_page_cache(mut self, pages: usize) -> Self {
        self.index_page_cache = pages.min(MAX_PAGE_CACHE_SIZE);
        self
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }
}

pub fn clamp_blob_size(size: usize) -> usize {
    let size = size.clamp(MIN_BLOB_SIZE, MAX_BLOB_SIZE);
    size.div_ceil(DBT3_BLOCK_SIZE) * DBT3_BLOCK_SIZE
}
