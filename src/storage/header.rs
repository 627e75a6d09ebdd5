use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{Datelike, Local, NaiveDate};
use encoding_rs::Encoding;
use log::{debug, warn};

use crate::types::{
    CODEPAGE_OFFSET, EOF_MARKER, EXTENDED_FIELD_RECORD_SIZE, EXTENDED_HEADER_SIZE,
    MAX_COLUMN_COUNT, SHORT_FIELD_RECORD_SIZE, SHORT_HEADER_SIZE,
    error::{Result, XbaseError},
};

/// Smallest short-dialect file: header + one field record + terminator.
pub const MIN_SHORT_FILE_LENGTH: u64 = (SHORT_HEADER_SIZE + SHORT_FIELD_RECORD_SIZE + 1) as u64;
pub const MIN_EXTENDED_FILE_LENGTH: u64 =
    (EXTENDED_HEADER_SIZE + EXTENDED_FIELD_RECORD_SIZE + 1) as u64;

const MAX_SHORT_FIRST_DATA_OFFSET: u64 =
    (SHORT_HEADER_SIZE + SHORT_FIELD_RECORD_SIZE * MAX_COLUMN_COUNT + 1 + 2 + 264) as u64;
const MAX_EXTENDED_FIRST_DATA_OFFSET: u64 =
    (EXTENDED_HEADER_SIZE + EXTENDED_FIELD_RECORD_SIZE * MAX_COLUMN_COUNT + 1 + 64 * 1024) as u64;

/// Type tags written by the dBASE III family and its relatives.
pub const KNOWN_TYPE_TAGS: [u8; 15] = [
    0x02, 0x03, 0x04, 0x30, 0x31, 0x32, 0x43, 0x63, 0x83, 0x84, 0x8B, 0xCB, 0xF5, 0xE5, 0xFB,
];

pub const TYPE_DBASE3: u8 = 0x03;
pub const TYPE_DBASE3_MEMO: u8 = 0x83;
pub const TYPE_DBASE4_MEMO: u8 = 0x8B;
pub const TYPE_DBASE4_SQL_MEMO: u8 = 0xCB;
pub const TYPE_DBASE4_SQL: u8 = 0x43;
pub const TYPE_DBASE4_SQL_SYSTEM: u8 = 0x63;

/// Codepage named by the header's codepage byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codepage {
    Oem,
    Ansi,
    Number(u16),
}

const CODEPAGES: &[(u8, Codepage)] = &[
    (0x00, Codepage::Oem),
    (0x01, Codepage::Number(437)),
    (0x02, Codepage::Number(850)),
    (0x03, Codepage::Number(1252)),
    (0x04, Codepage::Number(10000)),
    (0x08, Codepage::Number(865)),
    (0x09, Codepage::Number(437)),
    (0x0A, Codepage::Number(850)),
    (0x0B, Codepage::Number(437)),
    (0x0D, Codepage::Number(437)),
    (0x0E, Codepage::Number(850)),
    (0x0F, Codepage::Number(437)),
    (0x10, Codepage::Number(850)),
    (0x11, Codepage::Number(437)),
    (0x12, Codepage::Number(850)),
    (0x13, Codepage::Number(932)),
    (0x14, Codepage::Number(850)),
    (0x15, Codepage::Number(437)),
    (0x16, Codepage::Number(850)),
    (0x17, Codepage::Number(865)),
    (0x18, Codepage::Number(437)),
    (0x19, Codepage::Number(437)),
    (0x1A, Codepage::Number(850)),
    (0x1B, Codepage::Number(437)),
    (0x1C, Codepage::Number(863)),
    (0x1D, Codepage::Number(850)),
    (0x1F, Codepage::Number(852)),
    (0x22, Codepage::Number(852)),
    (0x23, Codepage::Number(852)),
    (0x24, Codepage::Number(860)),
    (0x25, Codepage::Number(850)),
    (0x26, Codepage::Number(866)),
    (0x37, Codepage::Number(850)),
    (0x40, Codepage::Number(852)),
    (0x4D, Codepage::Number(936)),
    (0x4E, Codepage::Number(949)),
    (0x4F, Codepage::Number(950)),
    (0x50, Codepage::Number(874)),
    (0x57, Codepage::Ansi),
    (0x58, Codepage::Number(1252)),
    (0x59, Codepage::Number(1252)),
    (0x64, Codepage::Number(852)),
    (0x65, Codepage::Number(866)),
    (0x66, Codepage::Number(865)),
    (0x67, Codepage::Number(861)),
    (0x68, Codepage::Number(895)),
    (0x69, Codepage::Number(620)),
    (0x6A, Codepage::Number(737)),
    (0x6B, Codepage::Number(857)),
    (0x6C, Codepage::Number(863)),
    (0x78, Codepage::Number(950)),
    (0x79, Codepage::Number(949)),
    (0x7A, Codepage::Number(936)),
    (0x7B, Codepage::Number(932)),
    (0x7C, Codepage::Number(874)),
    (0x7D, Codepage::Number(1255)),
    (0x7E, Codepage::Number(1256)),
    (0x86, Codepage::Number(737)),
    (0x87, Codepage::Number(852)),
    (0x88, Codepage::Number(857)),
    (0x96, Codepage::Number(10007)),
    (0x97, Codepage::Number(10029)),
    (0x98, Codepage::Number(10006)),
    (0xC8, Codepage::Number(1250)),
    (0xC9, Codepage::Number(1251)),
    (0xCA, Codepage::Number(1254)),
    (0xCB, Codepage::Number(1253)),
    (0xCC, Codepage::Number(1257)),
];

impl Codepage {
    pub fn from_byte(byte: u8) -> Option<Codepage> {
        CODEPAGES
            .iter()
            .find(|(code, _)| *code == byte)
            .map(|(_, codepage)| *codepage)
    }

    /// Codepage byte for a codepage number, first match wins.
    pub fn to_byte(&self) -> Option<u8> {
        CODEPAGES
            .iter()
            .find(|(_, codepage)| codepage == self)
            .map(|(code, _)| *code)
    }

    /// Decoder for this codepage, if one is available.
    pub fn encoding(&self) -> Option<&'static Encoding> {
        match self {
            Codepage::Oem => None,
            Codepage::Ansi => Some(encoding_rs::WINDOWS_1252),
            Codepage::Number(number) => match number {
                866 => Some(encoding_rs::IBM866),
                874 => Some(encoding_rs::WINDOWS_874),
                932 => Some(encoding_rs::SHIFT_JIS),
                936 => Some(encoding_rs::GBK),
                949 => Some(encoding_rs::EUC_KR),
                950 => Some(encoding_rs::BIG5),
                1250 => Some(encoding_rs::WINDOWS_1250),
                1251 => Some(encoding_rs::WINDOWS_1251),
                1252 => Some(encoding_rs::WINDOWS_1252),
                1253 => Some(encoding_rs::WINDOWS_1253),
                1254 => Some(encoding_rs::WINDOWS_1254),
                1255 => Some(encoding_rs::WINDOWS_1255),
                1256 => Some(encoding_rs::WINDOWS_1256),
                1257 => Some(encoding_rs::WINDOWS_1257),
                10000 => Some(encoding_rs::MACINTOSH),
                10007 => Some(encoding_rs::X_MAC_CYRILLIC),
                _ => None,
            },
        }
    }
}

/// Codepage byte whose decoder is `encoding`, first match wins.
pub fn codepage_byte_for(encoding: &'static Encoding) -> Option<u8> {
    CODEPAGES
        .iter()
        .find(|(_, codepage)| codepage.encoding() == Some(encoding))
        .map(|(code, _)| *code)
}

/// Fixed-position table header.
#[derive(Debug, Clone, PartialEq)]
pub struct DbfHeader {
    pub type_tag: u8,
    pub last_update: NaiveDate,
    pub record_count: u32,
    pub first_data_offset: u16,
    pub row_length: u16,
    pub codepage_byte: u8,
}

impl DbfHeader {
    /// True for dialects with the 68-byte header and 48-byte field records.
    pub fn is_extended(&self) -> bool {
        has_extended_layout(self.type_tag)
    }

    pub fn codepage(&self) -> Option<Codepage> {
        Codepage::from_byte(self.codepage_byte)
    }

    pub fn has_memo_tag(&self) -> bool {
        self.type_tag & 0x80 != 0
    }

    /// Byte length the table file should have for the declared records, without an EOF marker.
    pub fn expected_data_end(&self) -> u64 {
        self.first_data_offset as u64 + self.record_count as u64 * self.row_length as u64
    }

    pub fn read_from<R: Read + Seek>(reader: &mut R, only_dbase3: bool) -> Result<Self> {
        let stream_len = reader.seek(SeekFrom::End(0))?;
        if stream_len < MIN_SHORT_FILE_LENGTH {
            return Err(XbaseError::format(format!(
                "table file too short ({} < {})",
                stream_len, MIN_SHORT_FILE_LENGTH
            )));
        }
        let mut buffer = vec![0u8; SHORT_HEADER_SIZE];
        reader.seek(SeekFrom::Start(0))?;
        reader.read_exact(&mut buffer)?;
        Self::from_bytes(&buffer, stream_len, only_dbase3)
    }

    pub fn from_bytes(bytes: &[u8], stream_len: u64, only_dbase3: bool) -> Result<Self> {
        if bytes.len() < SHORT_HEADER_SIZE {
            return Err(XbaseError::format("header too short"));
        }

        let mut cursor = Cursor::new(bytes);
        let type_tag = cursor.read_u8()?;
        let extended = has_extended_layout(type_tag);

        if !extended && !KNOWN_TYPE_TAGS.contains(&type_tag) {
            if only_dbase3 {
                return Err(XbaseError::format(format!(
                    "unknown table type tag 0x{:02X}",
                    type_tag
                )));
            }
            warn!("Tolerating unknown table type tag 0x{:02X}", type_tag);
        }

        let min_len = if extended {
            MIN_EXTENDED_FILE_LENGTH
        } else {
            MIN_SHORT_FILE_LENGTH
        };
        if stream_len < min_len {
            return Err(XbaseError::format(format!(
                "table file too short ({} < {})",
                stream_len, min_len
            )));
        }

        let year = cursor.read_u8()?;
        let month = cursor.read_u8()?;
        let day = cursor.read_u8()?;
        let last_update = decode_last_update(year, month, day, Local::now().year())?;

        let record_count = cursor.read_i32::<LittleEndian>()?;
        let first_data_offset = cursor.read_i16::<LittleEndian>()?;
        let row_length = cursor.read_i16::<LittleEndian>()?;

        if record_count < 0 {
            return Err(XbaseError::format(format!(
                "negative record count {}",
                record_count
            )));
        }

        let (min_offset, max_offset) = if extended {
            (MIN_EXTENDED_FILE_LENGTH, MAX_EXTENDED_FIRST_DATA_OFFSET)
        } else {
            (MIN_SHORT_FILE_LENGTH, MAX_SHORT_FIRST_DATA_OFFSET)
        };
        let offset = first_data_offset as i64;
        if offset < min_offset as i64 || offset > max_offset as i64 || offset as u64 > stream_len {
            return Err(XbaseError::format(format!(
                "first data offset {} outside {}..={}",
                first_data_offset,
                min_offset,
                max_offset.min(stream_len)
            )));
        }

        if row_length < 2 {
            return Err(XbaseError::format(format!("invalid row length {}", row_length)));
        }

        let codepage_byte = bytes[CODEPAGE_OFFSET];
        if Codepage::from_byte(codepage_byte).is_none() {
            return Err(XbaseError::format(format!(
                "unknown codepage byte 0x{:02X}",
                codepage_byte
            )));
        }

        let header = DbfHeader {
            type_tag,
            last_update,
            record_count: record_count as u32,
            first_data_offset: first_data_offset as u16,
            row_length: row_length as u16,
            codepage_byte,
        };

        let expected = header.expected_data_end();
        if stream_len != expected && stream_len != expected + 1 {
            return Err(XbaseError::format(format!(
                "file length {} does not match {} records of {} bytes from offset {}",
                stream_len, header.record_count, header.row_length, header.first_data_offset
            )));
        }

        debug!(
            "Parsed header: type=0x{:02X} records={} row_length={} first_data={}",
            header.type_tag, header.record_count, header.row_length, header.first_data_offset
        );
        Ok(header)
    }

    /// Serialize as a 32-byte short header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(SHORT_HEADER_SIZE);

        buffer.push(self.type_tag);
        buffer.push(encode_year(self.last_update.year()));
        buffer.push(self.last_update.month() as u8);
        buffer.push(self.last_update.day() as u8);
        buffer.extend_from_slice(&(self.record_count as i32).to_le_bytes());
        buffer.extend_from_slice(&(self.first_data_offset as i16).to_le_bytes());
        buffer.extend_from_slice(&(self.row_length as i16).to_le_bytes());
        buffer.extend_from_slice(&[0u8; 16]);
        buffer.push(0); // table flags
        buffer.push(self.codepage_byte);
        buffer.extend_from_slice(&[0u8; 2]);

        debug_assert_eq!(buffer.len(), SHORT_HEADER_SIZE);
        buffer
    }
}

pub fn has_extended_layout(type_tag: u8) -> bool {
    type_tag & 0x07 == 0x04
}

/// Legacy writers store only two digits for years after 1999; values of 100
/// and above are offsets from 1900.
pub fn decode_last_update(year: u8, month: u8, day: u8, current_year: i32) -> Result<NaiveDate> {
    let max_year = current_year - 2000 + 1;
    let year = year as i32;

    let full_year = if year >= 100 {
        if year > max_year + 100 {
            return Err(XbaseError::format(format!("last update year {} in the future", year)));
        }
        1900 + year
    } else if year <= max_year {
        2000 + year
    } else {
        1900 + year
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(XbaseError::format(format!(
            "invalid last update date {:02}/{:02}",
            month, day
        )));
    }

    NaiveDate::from_ymd_opt(full_year, month as u32, day as u32).ok_or_else(|| {
        XbaseError::format(format!(
            "invalid last update date {}-{:02}-{:02}",
            full_year, month, day
        ))
    })
}

fn encode_year(year: i32) -> u8 {
    (year - 2000).clamp(0, 255) as u8
}

/// True when the byte after the last record is the optional EOF marker.
pub fn has_eof_marker<R: Read + Seek>(reader: &mut R, header: &DbfHeader) -> Result<bool> {
    let end = header.expected_data_end();
    let stream_len = reader.seek(SeekFrom::End(0))?;
    if stream_len <= end {
        return Ok(false);
    }
    reader.seek(SeekFrom::Start(end))?;
    Ok(reader.read_u8()? == EOF_MARKER)
}
