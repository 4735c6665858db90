use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// A single scalar value carried inside a queued row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Text(String),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            Datum::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Value used to pick a shard slot.
    ///
    /// Integers map to themselves (negative values wrap to their two's
    /// complement `u64`), text and bytes are hashed with xxHash3. NULL and
    /// floating point values have no shard key value.
    pub fn shard_key_value(&self) -> Option<u64> {
        match self {
            Datum::Null | Datum::Float64(_) => None,
            Datum::Boolean(b) => Some(*b as u64),
            Datum::Int32(v) => Some(*v as i64 as u64),
            Datum::Int64(v) => Some(*v as u64),
            Datum::UInt64(v) => Some(*v),
            Datum::Text(s) => Some(xxh3_64(s.as_bytes())),
            Datum::Bytea(b) => Some(xxh3_64(b)),
        }
    }

    /// Rough in-memory footprint, used for queue byte accounting.
    pub fn approx_size(&self) -> usize {
        match self {
            Datum::Text(s) => 8 + s.len(),
            Datum::Bytea(b) => 8 + b.len(),
            _ => 9,
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::UInt64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Bytea(bytes) => {
                write!(f, "\\x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// An owned row: one `Datum` per column of the distributed table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn approx_size(&self) -> usize {
        self.values.iter().map(Datum::approx_size).sum()
    }
}

impl From<Vec<Datum>> for OwnedRow {
    fn from(values: Vec<Datum>) -> Self {
        Self::new(values)
    }
}
