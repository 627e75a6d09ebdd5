use std::{cmp::Ordering, fmt};

use chrono::NaiveDate;
use rust_decimal::{Decimal, prelude::ToPrimitive};

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Memo(String),
    Date(NaiveDate),
    Integer(i32),
    Logical(bool),
    /// Numeric and float fields, parsed from their decimal text without rounding.
    Numeric(Decimal),
    Double(f64),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Text(_) => "character",
            Value::Memo(_) => "memo",
            Value::Date(_) => "date",
            Value::Integer(_) => "long",
            Value::Logical(_) => "logical",
            Value::Numeric(_) => "numeric",
            Value::Double(_) => "double",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Memo(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Logical(b) => Some(*b),
            _ => None,
        }
    }

    pub fn coerce_to_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Numeric(n) => n.to_f64(),
            Value::Double(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Text(a), Value::Text(b)) | (Value::Memo(a), Value::Memo(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            (Value::Logical(a), Value::Logical(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Numeric(a), Value::Numeric(b)) => a.partial_cmp(b),
            (Value::Numeric(a), Value::Integer(b)) => a.partial_cmp(&Decimal::from(*b)),
            (Value::Integer(a), Value::Numeric(b)) => Decimal::from(*a).partial_cmp(b),
            (a, b) => match (a.coerce_to_number(), b.coerce_to_number()) {
                (Some(x), Some(y)) if !matches!(a, Value::Text(_)) && !matches!(b, Value::Text(_)) => {
                    x.partial_cmp(&y)
                }
                _ => None, // Mixed types
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) | Value::Memo(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Logical(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            Value::Numeric(n) => write!(f, "{}", n.normalize()),
            Value::Double(n) => write!(f, "{}", n),
        }
    }
}
