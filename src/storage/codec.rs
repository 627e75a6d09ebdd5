//! Per-type field decoding and null handling.
//!
//! Every function works on the full row buffer and reads only the column's
//! byte window.

use byteorder::{ByteOrder, LittleEndian};
use chrono::NaiveDate;
use encoding_rs::Encoding;
use rust_decimal::Decimal;

use crate::{
    storage::schema::{Column, NativeType},
    types::{
        BlockNo,
        error::{Result, XbaseError},
        value::Value,
    },
};

impl Column {
    fn field<'a>(&self, row: &'a [u8]) -> Result<&'a [u8]> {
        row.get(self.range()).ok_or_else(|| {
            XbaseError::corruption(format!(
                "row buffer of {} bytes too short for column {}",
                row.len(),
                self.name
            ))
        })
    }

    pub fn is_null(&self, row: &[u8]) -> Result<bool> {
        let field = self.field(row)?;
        Ok(match self.native_type {
            NativeType::Character => field.first() == Some(&0x00) || is_blank(field),
            NativeType::Logical => matches!(field.first(), None | Some(b' ' | b'?' | 0x00)),
            NativeType::Date | NativeType::Numeric | NativeType::Float => is_blank_or_unknown(field),
            NativeType::Long => false,
            NativeType::Double => field.iter().all(|&b| b == 0x00),
            NativeType::Memo => field.iter().all(|&b| b == 0x00 || b == b' '),
        })
    }

    /// Blank out the field so that `is_null` reports true.
    pub fn set_null(&self, row: &mut [u8]) -> Result<()> {
        let len = row.len();
        let fill = match self.native_type {
            NativeType::Long | NativeType::Double => 0x00,
            _ => b' ',
        };
        let field = row.get_mut(self.range()).ok_or_else(|| {
            XbaseError::corruption(format!(
                "row buffer of {} bytes too short for column {}",
                len, self.name
            ))
        })?;
        field.fill(fill);
        Ok(())
    }

    /// Decode every type except memo, which needs a memo store.
    pub fn decode(&self, row: &[u8], encoding: &'static Encoding) -> Result<Value> {
        if self.is_null(row)? {
            return Ok(Value::Null);
        }
        let field = self.field(row)?;

        match self.native_type {
            NativeType::Character => Ok(Value::Text(decode_text(field, encoding))),
            NativeType::Logical => decode_logical(field[0])
                .map(|v| v.map_or(Value::Null, Value::Logical))
                .ok_or_else(|| self.invalid(field)),
            NativeType::Date => {
                let text = std::str::from_utf8(field).map_err(|_| self.invalid(field))?;
                NaiveDate::parse_from_str(text.trim(), "%Y%m%d")
                    .map(Value::Date)
                    .map_err(|_| self.invalid(field))
            }
            NativeType::Long => {
                if field.len() != 4 {
                    return Err(self.wrong_size(4));
                }
                Ok(Value::Integer(LittleEndian::read_i32(field)))
            }
            NativeType::Numeric | NativeType::Float => {
                let text = ascii_until_nul(field);
                parse_decimal(text.trim())
                    .map(Value::Numeric)
                    .ok_or_else(|| self.invalid(field))
            }
            NativeType::Double => {
                let bytes: [u8; 8] = field.try_into().map_err(|_| self.wrong_size(8))?;
                Ok(Value::Double(decode_sortable_double(bytes)))
            }
            NativeType::Memo => Err(XbaseError::state(format!(
                "memo column {} needs a memo store",
                self.name
            ))),
        }
    }

    /// Block number referenced by a memo field; `None` for a blank field or block 0.
    pub fn memo_block(&self, row: &[u8]) -> Result<Option<BlockNo>> {
        if self.native_type != NativeType::Memo {
            return Err(XbaseError::state(format!("column {} is not a memo", self.name)));
        }
        if self.is_null(row)? {
            return Ok(None);
        }
        let field = self.field(row)?;
        let text = ascii_until_nul(field);
        let block: BlockNo = text.trim().parse().map_err(|_| self.invalid(field))?;
        Ok(if block == 0 { None } else { Some(block) })
    }

    /// Field text decoded without trimming.
    pub fn raw_string(&self, row: &[u8], encoding: &'static Encoding) -> Result<String> {
        let field = self.field(row)?;
        let (text, _, _) = encoding.decode(field);
        Ok(text.into_owned())
    }

    fn wrong_size(&self, expected: usize) -> XbaseError {
        XbaseError::format(format!(
            "{:?} column {} is {} bytes wide, expected {}",
            self.native_type, self.name, self.size, expected
        ))
    }

    fn invalid(&self, field: &[u8]) -> XbaseError {
        XbaseError::Range {
            what: format!(
                "{:?} value {:?} in column {}",
                self.native_type,
                String::from_utf8_lossy(field),
                self.name
            ),
            index: 0,
            max: 0,
        }
    }
}

/// `T/t/Y/y` and `F/f/N/n`, `Some(None)` for the unknown markers.
pub fn decode_logical(byte: u8) -> Option<Option<bool>> {
    match byte {
        b'T' | b't' | b'Y' | b'y' => Some(Some(true)),
        b'F' | b'f' | b'N' | b'n' => Some(Some(false)),
        b' ' | b'?' | 0x00 => Some(None),
        _ => None,
    }
}

pub fn decode_text(field: &[u8], encoding: &'static Encoding) -> String {
    let end = field.iter().position(|&b| b == 0x00).unwrap_or(field.len());
    let (text, _, _) = encoding.decode(&field[..end]);
    text.trim_end_matches(' ').to_string()
}

/// Scans left to right: NUL or `?` before any other non-blank byte means null,
/// as does an all-blank field.
pub fn is_blank_or_unknown(field: &[u8]) -> bool {
    for &b in field {
        match b {
            b' ' => continue,
            0x00 | b'?' => return true,
            _ => return false,
        }
    }
    true
}

fn is_blank(field: &[u8]) -> bool {
    field.iter().all(|&b| b == b' ')
}

/// Plain decimal text, or exponent notation as some writers store floats.
pub fn parse_decimal(text: &str) -> Option<Decimal> {
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn ascii_until_nul(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0x00).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Doubles are stored big-endian with the sign bit flipped for positive values
/// and every bit inverted for negative ones, which keeps byte order equal to
/// numeric order.
pub fn decode_sortable_double(bytes: [u8; 8]) -> f64 {
    let raw = u64::from_be_bytes(bytes);
    let raw = if raw & (1 << 63) != 0 {
        raw & !(1 << 63)
    } else {
        !raw
    };
    f64::from_bits(raw)
}

pub fn encode_sortable_double(value: f64) -> [u8; 8] {
    let raw = value.to_bits();
    let raw = if raw & (1 << 63) == 0 {
        raw | (1 << 63)
    } else {
        !raw
    };
    raw.to_be_bytes()
}
