use std::io::{Read, Seek, SeekFrom};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::{
    storage::header::DbfHeader,
    types::{
        EXTENDED_FIELD_RECORD_SIZE, EXTENDED_HEADER_SIZE, FIELD_TERMINATOR, MAX_COLUMN_COUNT,
        SHORT_FIELD_RECORD_SIZE, SHORT_HEADER_SIZE,
        error::{Result, XbaseError},
    },
};

pub const MAX_SHORT_NAME_LEN: usize = 10;
const SHORT_NAME_FIELD: usize = 11;
const EXTENDED_NAME_FIELD: usize = 32;

/// Native column type tag as stored in the field record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeType {
    Character,
    Memo,
    Date,
    Long,
    Logical,
    Numeric,
    Float,
    Double,
}

impl NativeType {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'C' => Ok(NativeType::Character),
            b'M' => Ok(NativeType::Memo),
            b'D' => Ok(NativeType::Date),
            b'I' | b'+' => Ok(NativeType::Long),
            b'L' => Ok(NativeType::Logical),
            b'N' => Ok(NativeType::Numeric),
            b'F' => Ok(NativeType::Float),
            b'O' => Ok(NativeType::Double),
            _ => Err(XbaseError::NotSupported {
                what: format!("column type '{}' (0x{:02X})", byte as char, byte),
            }),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            NativeType::Character => b'C',
            NativeType::Memo => b'M',
            NativeType::Date => b'D',
            NativeType::Long => b'I',
            NativeType::Logical => b'L',
            NativeType::Numeric => b'N',
            NativeType::Float => b'F',
            NativeType::Double => b'O',
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, NativeType::Character | NativeType::Memo)
    }

    /// Binary types whose stored width is fixed by the format.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            NativeType::Long => Some(4),
            NativeType::Double => Some(8),
            _ => None,
        }
    }
}

/// A column of the table schema. `offset` indexes the row buffer, whose first
/// byte is the delete flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub native_type: NativeType,
    pub offset: usize,
    pub size: usize,
    pub decimals: u8,
}

impl Column {
    pub fn new(name: &str, native_type: NativeType, offset: usize, size: usize, decimals: u8) -> Self {
        Self {
            name: name.to_string(),
            native_type,
            offset,
            size,
            decimals,
        }
    }

    /// Case-insensitive name match.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim())
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Column list read from the field records, plus the summed width of every
/// record, including memo columns left out of `columns`.
#[derive(Debug, Clone)]
pub struct Schema {
    pub columns: Vec<Column>,
    pub data_width: usize,
    pub has_memo: bool,
}

pub fn read_columns<R: Read + Seek>(
    reader: &mut R,
    header: &DbfHeader,
    open_memo: bool,
) -> Result<Schema> {
    let (start, record_size) = if header.is_extended() {
        (EXTENDED_HEADER_SIZE, EXTENDED_FIELD_RECORD_SIZE)
    } else {
        (SHORT_HEADER_SIZE, SHORT_FIELD_RECORD_SIZE)
    };

    reader.seek(SeekFrom::Start(start as u64))?;

    let mut columns = Vec::new();
    let mut offset = 1usize;
    let mut has_memo = false;
    let mut position = start;
    let mut record = vec![0u8; record_size];

    for _ in 0..MAX_COLUMN_COUNT {
        let mut first = [0u8; 1];
        reader.read_exact(&mut first)?;
        if first[0] == FIELD_TERMINATOR {
            break;
        }
        if position + record_size > header.first_data_offset as usize {
            return Err(XbaseError::format(format!(
                "field records run past first data offset {}",
                header.first_data_offset
            )));
        }

        record[0] = first[0];
        reader.read_exact(&mut record[1..])?;
        position += record_size;

        let column = if header.is_extended() {
            parse_extended_record(&record, offset)?
        } else {
            parse_short_record(&record, offset)?
        };
        trace!(
            "Column {} type={:?} offset={} size={} dec={}",
            column.name, column.native_type, column.offset, column.size, column.decimals
        );

        offset += column.size;
        if column.native_type == NativeType::Memo {
            has_memo = true;
            if !open_memo {
                continue;
            }
        }
        columns.push(column);
    }

    if offset == 1 {
        return Err(XbaseError::format("table has no columns"));
    }

    debug!("Read {} columns, data width {}", columns.len(), offset - 1);
    Ok(Schema {
        columns,
        data_width: offset - 1,
        has_memo,
    })
}

fn parse_short_record(record: &[u8], offset: usize) -> Result<Column> {
    let name = parse_name(&record[..SHORT_NAME_FIELD])?;
    let native_type = NativeType::from_byte(record[11])?;
    // bytes 12..16 hold a writer-specific offset that is never trusted
    let size = record[16] as usize;
    let decimals = record[17];
    checked_column(&name, native_type, offset, size, decimals)
}

fn parse_extended_record(record: &[u8], offset: usize) -> Result<Column> {
    let name = parse_name(&record[..EXTENDED_NAME_FIELD])?;
    let native_type = NativeType::from_byte(record[EXTENDED_NAME_FIELD])?;
    let size = record[EXTENDED_NAME_FIELD + 1] as usize;
    let decimals = record[EXTENDED_NAME_FIELD + 2];
    checked_column(&name, native_type, offset, size, decimals)
}

fn checked_column(
    name: &str,
    native_type: NativeType,
    offset: usize,
    size: usize,
    decimals: u8,
) -> Result<Column> {
    if let Some(expected) = native_type.fixed_size() {
        if size != expected {
            return Err(XbaseError::format(format!(
                "{:?} column {} declares size {}, expected {}",
                native_type, name, size, expected
            )));
        }
    }
    Ok(Column::new(name, native_type, offset, size, decimals))
}

/// Name ends at the first NUL or space; anything after it is ignored.
fn parse_name(bytes: &[u8]) -> Result<String> {
    let end = bytes
        .iter()
        .position(|&b| b == 0x00 || b == b' ')
        .unwrap_or(bytes.len());
    if end == 0 {
        return Err(XbaseError::format("empty column name"));
    }
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Structural equality of two column lists, ignoring their order.
pub fn columns_identical(left: &[Column], right: &[Column]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let sorted = |columns: &[Column]| {
        let mut columns: Vec<Column> = columns.to_vec();
        columns.sort_by_key(|c| c.name.to_ascii_uppercase());
        columns
    };

    sorted(left).iter().zip(sorted(right).iter()).all(|(a, b)| {
        a.name.eq_ignore_ascii_case(&b.name)
            && a.native_type == b.native_type
            && a.size == b.size
            && a.decimals == b.decimals
            && a.offset == b.offset
    })
}

/// Column description used when creating a table file.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub native_type: NativeType,
    pub size: usize,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn new(name: &str, native_type: NativeType, size: usize, decimals: u8) -> Self {
        Self {
            name: name.to_string(),
            native_type,
            size,
            decimals,
        }
    }

    pub fn character(name: &str, size: usize) -> Self {
        Self::new(name, NativeType::Character, size, 0)
    }

    pub fn numeric(name: &str, size: usize, decimals: u8) -> Self {
        Self::new(name, NativeType::Numeric, size, decimals)
    }

    pub fn float(name: &str, size: usize, decimals: u8) -> Self {
        Self::new(name, NativeType::Float, size, decimals)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, NativeType::Date, 8, 0)
    }

    pub fn logical(name: &str) -> Self {
        Self::new(name, NativeType::Logical, 1, 0)
    }

    pub fn memo(name: &str) -> Self {
        Self::new(name, NativeType::Memo, 10, 0)
    }

    pub fn long(name: &str) -> Self {
        Self::new(name, NativeType::Long, 4, 0)
    }

    pub fn double(name: &str) -> Self {
        Self::new(name, NativeType::Double, 8, 0)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_bytes();
        if name.is_empty() || name.len() > MAX_SHORT_NAME_LEN {
            return Err(XbaseError::format(format!(
                "column name '{}' must be 1..={} bytes",
                self.name, MAX_SHORT_NAME_LEN
            )));
        }
        if !name.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_') {
            return Err(XbaseError::format(format!(
                "column name '{}' has invalid characters",
                self.name
            )));
        }

        let size_ok = match self.native_type {
            NativeType::Character => (1..=254).contains(&self.size) && self.decimals == 0,
            NativeType::Numeric | NativeType::Float => {
                (1..=20).contains(&self.size)
                    && (self.decimals == 0 || (self.decimals as usize) + 2 <= self.size)
            }
            NativeType::Date => self.size == 8,
            NativeType::Logical => self.size == 1,
            NativeType::Memo => self.size == 10,
            NativeType::Long | NativeType::Double => {
                Some(self.size) == self.native_type.fixed_size() && self.decimals == 0
            }
        };
        if !size_ok {
            return Err(XbaseError::format(format!(
                "invalid size {}.{} for {:?} column '{}'",
                self.size, self.decimals, self.native_type, self.name
            )));
        }
        Ok(())
    }

    /// 32-byte short-dialect field record.
    pub fn to_record(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(SHORT_FIELD_RECORD_SIZE);
        let mut name = [0u8; SHORT_NAME_FIELD];
        let upper = self.name.to_ascii_uppercase();
        let len = upper.len().min(MAX_SHORT_NAME_LEN);
        name[..len].copy_from_slice(&upper.as_bytes()[..len]);

        record.extend_from_slice(&name);
        record.push(self.native_type.as_byte());
        record.extend_from_slice(&0i32.to_le_bytes());
        record.push(self.size as u8);
        record.push(self.decimals);
        record.extend_from_slice(&[0u8; 14]);
        record
    }
}
