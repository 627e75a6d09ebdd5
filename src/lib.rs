//! Readers and writers for dBASE/Clipper tables (`.dbf`), their memo files
//! (`.dbt`) and their NDX/NTX indexes.

pub mod storage;
pub mod types;
pub mod utils;

pub use storage::{
    options::{IndexType, MemoType, Strictness, TableOptions},
    schema::{Column, ColumnDefinition, NativeType},
    table::Table,
};
pub use types::{error::XbaseError, row::Row, value::Value};
