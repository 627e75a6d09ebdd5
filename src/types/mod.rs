pub mod error;
pub mod page;
pub mod row;
pub mod value;

// Common type aliases
pub type RecNo = u32;
pub type BlockNo = u32;
pub type PageNo = u32;

// Table file layout
pub const SHORT_HEADER_SIZE: usize = 32;
pub const EXTENDED_HEADER_SIZE: usize = 68;
pub const SHORT_FIELD_RECORD_SIZE: usize = 32;
pub const EXTENDED_FIELD_RECORD_SIZE: usize = 48;
pub const MAX_COLUMN_COUNT: usize = 1024;
pub const FIELD_TERMINATOR: u8 = 0x0D;
pub const EOF_MARKER: u8 = 0x1A;
pub const CODEPAGE_OFFSET: usize = 29;

// Row delete flag values
pub const DELETED_FLAG: u8 = b'*';
pub const LIVE_FLAG: u8 = b' ';

// Memo file layout
pub const DBT3_BLOCK_SIZE: usize = 512;
pub const DBT4_MIN_BLOCK_SIZE: usize = 64;
pub const DBT4_MAX_BLOCK_SIZE: usize = 32768;
pub const DBT4_BLOCK_SIGNATURE: [u8; 4] = [0xFF, 0xFF, 0x08, 0x00];
pub const MEMO_VERSION_OFFSET: usize = 16;
pub const MEMO_BLOCK_SIZE_OFFSET: usize = 20;
pub const MEMO_FILENAME_OFFSET: usize = 8;

// Index file layout
pub const NDX_PAGE_SIZE: usize = 512;
pub const NTX_PAGE_SIZE: usize = 1024;
pub const MAX_NDX_PAGE_NO: PageNo = 0x7F_FFFF;
pub const KEY_EXPRESSION_SIZE: usize = 256;
pub const MAX_PAGE_CACHE_SIZE: usize = 100_000;
