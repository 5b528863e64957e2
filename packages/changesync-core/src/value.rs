//! Value cells and primary-key encoding.
//!
//! A [`Value`] is one column of a stored row or of a change record. Stored
//! rows never contain [`Value::Absent`]; change records use it for columns
//! that carry no value (unchanged UPDATE columns, patchset old rows).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A full-width row, one cell per column.
pub type Row = Vec<Value>;

/// Tagged column value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// No value recorded for this column
    Absent,
    /// SQL NULL
    Null,
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit IEEE-754 float
    Float(f64),
    /// UTF-8 text, may contain embedded zero bytes
    Text(String),
    /// Binary data
    Blob(Vec<u8>),
}

/// Type discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Absent,
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl Value {
    /// Returns the value's type.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Absent => ValueType::Absent,
            Value::Null => ValueType::Null,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Payload size in bytes (0 for Absent and Null, 8 for numbers).
    pub fn byte_size(&self) -> usize {
        match self {
            Value::Absent | Value::Null => 0,
            Value::Integer(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len(),
            Value::Blob(b) => b.len(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

// Floats compare by bit pattern so that a value always equals itself,
// including NaN payloads read back from a changeset.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Absent, Value::Absent) | (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Absent => write!(f, "-"),
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                write!(f, "X'")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Order-preserving byte encoding of a primary key.
///
/// Used to index rows in the store and to match change records for the
/// same row. Integers sort numerically; other types sort by type first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey(Vec<u8>);

impl RowKey {
    /// Builds a key from the primary-key cells, in column order.
    pub fn from_values<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut out = Vec::new();
        for value in values {
            match value {
                Value::Absent => out.push(0),
                Value::Null => out.push(1),
                Value::Integer(v) => {
                    out.push(2);
                    out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
                }
                Value::Float(v) => {
                    out.push(3);
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                Value::Text(s) => {
                    out.push(4);
                    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                Value::Blob(b) => {
                    out.push(5);
                    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        RowKey(out)
    }

    /// Builds a key from a full-width row using a primary-key mask.
    pub fn from_row(primary_key: &[bool], row: &[Value]) -> Self {
        Self::from_values(
            row.iter()
                .zip(primary_key)
                .filter_map(|(value, &pk)| pk.then_some(value)),
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
