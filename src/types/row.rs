use std::{collections::BTreeMap, sync::Arc};

use chrono::NaiveDate;
use encoding_rs::Encoding;
use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};
use serde::{Deserialize, Serialize};

use crate::{
    storage::{
        memo::MemoStore,
        schema::{Column, NativeType},
    },
    types::{
        DELETED_FLAG, LIVE_FLAG, RecNo,
        error::{Result, XbaseError},
        value::Value,
    },
};

/// Identity of the table a row was read from. `NO_TABLE` marks an orphan.
pub type TableId = u64;
pub const NO_TABLE: TableId = 0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoCacheItem {
    pub data: Vec<u8>,
    /// Content differs from what the attached memo store holds.
    pub modified: bool,
}

/// One fixed-length record: delete flag followed by every column's bytes.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) rec_no: Option<RecNo>,
    pub(crate) table_id: TableId,
    pub(crate) buffer: Vec<u8>,
    pub(crate) columns: Arc<Vec<Column>>,
    pub(crate) encoding: &'static Encoding,
    pub(crate) memo_store: Option<Arc<MemoStore>>,
    pub(crate) memo_cache: BTreeMap<usize, MemoCacheItem>,
    pub(crate) modified: bool,
    pub(crate) error_if_no_memo_store: bool,
}

#[derive(Serialize, Deserialize)]
struct RowSnapshot {
    buffer: Vec<u8>,
    columns: Vec<Column>,
    encoding: String,
    memo_cache: Vec<(usize, Vec<u8>)>,
    modified: bool,
}

impl Row {
    /// Orphan row with every column null and the record not deleted.
    pub fn new(columns: Arc<Vec<Column>>, encoding: &'static Encoding) -> Result<Self> {
        let row_length = columns.iter().map(|c| c.range().end).max().unwrap_or(1).max(1);
        let mut buffer = vec![LIVE_FLAG; row_length];
        for column in columns.iter() {
            column.set_null(&mut buffer)?;
        }
        Ok(Self::with_buffer(None, NO_TABLE, buffer, columns, encoding))
    }

    pub(crate) fn with_buffer(
        rec_no: Option<RecNo>,
        table_id: TableId,
        buffer: Vec<u8>,
        columns: Arc<Vec<Column>>,
        encoding: &'static Encoding,
    ) -> Self {
        Self {
            rec_no,
            table_id,
            buffer,
            columns,
            encoding,
            memo_store: None,
            memo_cache: BTreeMap::new(),
            modified: false,
            error_if_no_memo_store: true,
        }
    }

    /// Zero-based record number, `None` for an orphan.
    pub fn rec_no(&self) -> Option<RecNo> {
        self.rec_no
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn is_orphan(&self) -> bool {
        self.table_id == NO_TABLE
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn is_deleted(&self) -> bool {
        self.buffer.first() == Some(&DELETED_FLAG)
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        let flag = if deleted { DELETED_FLAG } else { LIVE_FLAG };
        if let Some(first) = self.buffer.first_mut() {
            if *first != flag {
                *first = flag;
                self.modified = true;
            }
        }
    }

    /// Get column by name
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.is_named(name))
    }

    fn column(&self, name: &str) -> Result<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.is_named(name))
            .ok_or_else(|| XbaseError::ColumnNotFound {
                name: name.to_string(),
            })
    }

    pub fn is_null(&self, name: &str) -> Result<bool> {
        let (index, column) = self.column(name)?;
        if column.native_type == NativeType::Memo {
            if let Some(item) = self.memo_cache.get(&index) {
                return Ok(item.data.is_empty());
            }
        }
        column.is_null(&self.buffer)
    }

    pub fn get_value(&self, name: &str) -> Result<Value> {
        let (index, column) = self.column(name)?;
        self.value_at(index, column)
    }

    /// Values of every column in schema order.
    pub fn values(&self) -> Result<Vec<Value>> {
        self.columns
            .iter()
            .enumerate()
            .map(|(index, column)| self.value_at(index, column))
            .collect()
    }

    fn value_at(&self, index: usize, column: &Column) -> Result<Value> {
        if column.native_type != NativeType::Memo {
            return column.decode(&self.buffer, self.encoding);
        }
        Ok(match self.memo_bytes_at(index, column)? {
            Some(bytes) if !bytes.is_empty() => {
                let (text, _, _) = self.encoding.decode(&bytes);
                Value::Memo(text.into_owned())
            }
            _ => Value::Null,
        })
    }

    pub fn get_string(&self, name: &str) -> Result<Option<String>> {
        Ok(match self.get_value(name)? {
            Value::Null => None,
            Value::Text(s) | Value::Memo(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    pub fn get_decimal(&self, name: &str) -> Result<Option<Decimal>> {
        match self.get_value(name)? {
            Value::Null => Ok(None),
            Value::Numeric(n) => Ok(Some(n)),
            Value::Integer(i) => Ok(Some(Decimal::from(i))),
            Value::Double(d) => Decimal::from_f64(d).map(Some).ok_or_else(|| XbaseError::Range {
                what: format!("double {} in column {}", d, name),
                index: 0,
                max: 0,
            }),
            other => Err(type_mismatch("number", &other)),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        match self.get_value(name)? {
            Value::Null => Ok(None),
            Value::Double(d) => Ok(Some(d)),
            other => other
                .coerce_to_number()
                .filter(|_| !matches!(other, Value::Text(_)))
                .map(Some)
                .ok_or_else(|| type_mismatch("number", &other)),
        }
    }

    pub fn get_date(&self, name: &str) -> Result<Option<NaiveDate>> {
        match self.get_value(name)? {
            Value::Null => Ok(None),
            Value::Date(d) => Ok(Some(d)),
            other => Err(type_mismatch("date", &other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get_value(name)? {
            Value::Null => Ok(None),
            Value::Logical(b) => Ok(Some(b)),
            other => Err(type_mismatch("logical", &other)),
        }
    }

    pub fn get_i32(&self, name: &str) -> Result<Option<i32>> {
        match self.get_value(name)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(i)),
            Value::Numeric(n) if n.fract().is_zero() && n.to_i32().is_some() => Ok(n.to_i32()),
            other => Err(type_mismatch("integer", &other)),
        }
    }

    /// Field bytes decoded as text, untrimmed.
    pub fn get_raw_string(&self, name: &str) -> Result<String> {
        let (_, column) = self.column(name)?;
        column.raw_string(&self.buffer, self.encoding)
    }

    /// Memo content; empty for a blank field or block 0.
    pub fn get_memo_bytes(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let (index, column) = self.column(name)?;
        if column.native_type != NativeType::Memo {
            return Err(XbaseError::TypeMismatch {
                expected: "memo".to_string(),
                actual: format!("{:?}", column.native_type),
            });
        }
        self.memo_bytes_at(index, column)
    }

    fn memo_bytes_at(&self, index: usize, column: &Column) -> Result<Option<Vec<u8>>> {
        if let Some(item) = self.memo_cache.get(&index) {
            return Ok(Some(item.data.clone()));
        }
        let block = match column.memo_block(&self.buffer)? {
            Some(block) => block,
            None => return Ok(Some(Vec::new())),
        };
        match &self.memo_store {
            Some(store) => store.read(block).map(Some),
            None if self.error_if_no_memo_store => Err(XbaseError::configuration(format!(
                "no memo store attached for column {}",
                column.name
            ))),
            None => Ok(None),
        }
    }

    /// Pull all memo content into the row so it outlives the memo store.
    pub fn cache_memos(&mut self) -> Result<()> {
        let memo_columns: Vec<(usize, Column)> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.native_type == NativeType::Memo)
            .map(|(i, c)| (i, c.clone()))
            .collect();

        for (index, column) in memo_columns {
            if self.memo_cache.contains_key(&index) {
                continue;
            }
            if let Some(data) = self.memo_bytes_at(index, &column)? {
                self.memo_cache.insert(index, MemoCacheItem { data, modified: false });
            }
        }
        Ok(())
    }

    pub fn memo_cache_item(&self, name: &str) -> Option<&MemoCacheItem> {
        let (index, _) = self.column(name).ok()?;
        self.memo_cache.get(&index)
    }

    pub fn set_null(&mut self, name: &str) -> Result<()> {
        let (index, column) = self.column(name)?;
        let column = column.clone();
        column.set_null(&mut self.buffer)?;
        if column.native_type == NativeType::Memo {
            self.memo_cache.insert(
                index,
                MemoCacheItem {
                    data: Vec::new(),
                    modified: true,
                },
            );
        }
        self.modified = true;
        Ok(())
    }

    /// Serialize a detached copy of the row, memo cache included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let snapshot = RowSnapshot {
            buffer: self.buffer.clone(),
            columns: self.columns.as_ref().clone(),
            encoding: self.encoding.name().to_string(),
            memo_cache: self
                .memo_cache
                .iter()
                .map(|(index, item)| (*index, item.data.clone()))
                .collect(),
            modified: self.modified,
        };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard()).map_err(|e| {
            XbaseError::Serialization {
                details: e.to_string(),
            }
        })
    }

    /// Rebuild an orphan row from `to_bytes` output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (snapshot, _): (RowSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map_err(|e| {
                XbaseError::Serialization {
                    details: e.to_string(),
                }
            })?;

        let encoding = Encoding::for_label(snapshot.encoding.as_bytes()).ok_or_else(|| {
            XbaseError::Serialization {
                details: format!("unknown encoding '{}'", snapshot.encoding),
            }
        })?;

        let mut row = Self::with_buffer(
            None,
            NO_TABLE,
            snapshot.buffer,
            Arc::new(snapshot.columns),
            encoding,
        );
        row.modified = snapshot.modified;
        row.memo_cache = snapshot
            .memo_cache
            .into_iter()
            .map(|(index, data)| (index, MemoCacheItem { data, modified: false }))
            .collect();
        Ok(row)
    }
}

fn type_mismatch(expected: &str, actual: &Value) -> XbaseError {
    XbaseError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}
