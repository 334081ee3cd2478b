//! Typed attribute values, columns and blocks.
//!
//! The value set is closed: fixed-width integers, floats, bool, variable and
//! fixed-length strings, decimals and UUIDs. A column is a positional list of
//! values, a block is a list of columns with a uniform row count.

use uuid::Uuid;

use crate::error::CacheError;

/// Underlying type of a dictionary attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
    /// Variable-length string.
    String,
    /// Fixed-length byte string of the given width.
    FixedString(usize),
    /// Decimal with the given scale, stored as a 128-bit integer.
    Decimal(u8),
    /// UUID.
    Uuid,
}

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Unsigned 8-bit integer.
    UInt8(u8),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// Boolean.
    Bool(bool),
    /// Variable-length string.
    String(String),
    /// Fixed-length byte string.
    FixedString(Box<[u8]>),
    /// Decimal value with its scale.
    Decimal {
        /// Unscaled 128-bit value.
        value: i128,
        /// Number of fractional digits.
        scale: u8,
    },
    /// UUID.
    Uuid(Uuid),
}

impl AttributeValue {
    /// Check whether this value inhabits the given attribute type.
    pub fn matches_type(&self, attribute_type: &AttributeType) -> bool {
        match (self, attribute_type) {
            (AttributeValue::UInt8(_), AttributeType::UInt8)
            | (AttributeValue::UInt16(_), AttributeType::UInt16)
            | (AttributeValue::UInt32(_), AttributeType::UInt32)
            | (AttributeValue::UInt64(_), AttributeType::UInt64)
            | (AttributeValue::Int8(_), AttributeType::Int8)
            | (AttributeValue::Int16(_), AttributeType::Int16)
            | (AttributeValue::Int32(_), AttributeType::Int32)
            | (AttributeValue::Int64(_), AttributeType::Int64)
            | (AttributeValue::Float32(_), AttributeType::Float32)
            | (AttributeValue::Float64(_), AttributeType::Float64)
            | (AttributeValue::Bool(_), AttributeType::Bool)
            | (AttributeValue::String(_), AttributeType::String)
            | (AttributeValue::Uuid(_), AttributeType::Uuid) => true,
            (AttributeValue::FixedString(bytes), AttributeType::FixedString(width)) => {
                bytes.len() == *width
            }
            (AttributeValue::Decimal { scale, .. }, AttributeType::Decimal(type_scale)) => {
                scale == type_scale
            }
            _ => false,
        }
    }

    /// Interpret this value as an unsigned 64-bit integer, if it is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttributeValue::UInt64(value) => Some(*value),
            _ => None,
        }
    }

    /// Approximate heap + inline footprint of the value in bytes.
    pub fn approximate_bytes(&self) -> usize {
        let inline = std::mem::size_of::<AttributeValue>();
        match self {
            AttributeValue::String(s) => inline + s.len(),
            AttributeValue::FixedString(bytes) => inline + bytes.len(),
            _ => inline,
        }
    }
}

/// A positional list of attribute values.
pub type Column = Vec<AttributeValue>;

/// A set of columns with a uniform row count.
///
/// Blocks produced by a dictionary source carry the schema's key columns
/// first, followed by the attribute columns in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    columns: Vec<Column>,
}

impl Block {
    /// Create a block, validating that all columns have the same row count.
    pub fn new(columns: Vec<Column>) -> Result<Self, CacheError> {
        if let Some(first) = columns.first() {
            let rows = first.len();
            if columns.iter().any(|column| column.len() != rows) {
                return Err(CacheError::TypeMismatch(
                    "block columns have differing row counts".into(),
                ));
            }
        }
        Ok(Self { columns })
    }

    /// Number of rows in the block.
    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Number of columns in the block.
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Borrow the columns.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Consume the block and return its columns.
    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }
}
