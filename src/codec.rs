//! Deterministic binary encoding of attribute values.
//!
//! The encoding is used for complex key bytes (equality and hashing are over
//! the encoded representation) and for row serialisation in the file-backed
//! storage. Integers and floats are fixed-width little-endian, strings are
//! length-prefixed, fixed strings are raw bytes of their declared width.
//! The hash must be deterministic across runs, so `DefaultHasher` is out.

use uuid::Uuid;

use crate::column::{AttributeType, AttributeValue};
use crate::error::CacheError;

/// Hash bytes into a 64-bit value (deterministic across runs).
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// Append the encoding of a single value to `buf`.
pub fn encode_value(buf: &mut Vec<u8>, value: &AttributeValue) {
    match value {
        AttributeValue::UInt8(v) => buf.push(*v),
        AttributeValue::UInt16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::UInt32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::UInt64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Int8(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Int16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Float32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Float64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        AttributeValue::Bool(v) => buf.push(u8::from(*v)),
        AttributeValue::String(v) => {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
        AttributeValue::FixedString(bytes) => buf.extend_from_slice(bytes),
        AttributeValue::Decimal { value, scale } => {
            buf.extend_from_slice(&value.to_le_bytes());
            buf.push(*scale);
        }
        AttributeValue::Uuid(v) => buf.extend_from_slice(v.as_bytes()),
    }
}

/// Append the encoding of a full row to `buf`.
pub fn encode_row(buf: &mut Vec<u8>, row: &[AttributeValue]) {
    for value in row {
        encode_value(buf, value);
    }
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], CacheError> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| CacheError::Io("truncated value encoding".into()))?;
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Decode one value of the given type from `bytes`, advancing `pos`.
pub fn decode_value(
    bytes: &[u8],
    pos: &mut usize,
    attribute_type: &AttributeType,
) -> Result<AttributeValue, CacheError> {
    let value = match attribute_type {
        AttributeType::UInt8 => AttributeValue::UInt8(take(bytes, pos, 1)?[0]),
        AttributeType::UInt16 => {
            AttributeValue::UInt16(u16::from_le_bytes(take(bytes, pos, 2)?.try_into().unwrap()))
        }
        AttributeType::UInt32 => {
            AttributeValue::UInt32(u32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()))
        }
        AttributeType::UInt64 => {
            AttributeValue::UInt64(u64::from_le_bytes(take(bytes, pos, 8)?.try_into().unwrap()))
        }
        AttributeType::Int8 => {
            AttributeValue::Int8(i8::from_le_bytes(take(bytes, pos, 1)?.try_into().unwrap()))
        }
        AttributeType::Int16 => {
            AttributeValue::Int16(i16::from_le_bytes(take(bytes, pos, 2)?.try_into().unwrap()))
        }
        AttributeType::Int32 => {
            AttributeValue::Int32(i32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()))
        }
        AttributeType::Int64 => {
            AttributeValue::Int64(i64::from_le_bytes(take(bytes, pos, 8)?.try_into().unwrap()))
        }
        AttributeType::Float32 => {
            AttributeValue::Float32(f32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()))
        }
        AttributeType::Float64 => {
            AttributeValue::Float64(f64::from_le_bytes(take(bytes, pos, 8)?.try_into().unwrap()))
        }
        AttributeType::Bool => AttributeValue::Bool(take(bytes, pos, 1)?[0] != 0),
        AttributeType::String => {
            let len = u32::from_le_bytes(take(bytes, pos, 4)?.try_into().unwrap()) as usize;
            let raw = take(bytes, pos, len)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| CacheError::Io("invalid utf-8 in string encoding".into()))?;
            AttributeValue::String(text.to_owned())
        }
        AttributeType::FixedString(width) => {
            AttributeValue::FixedString(take(bytes, pos, *width)?.into())
        }
        AttributeType::Decimal(scale) => {
            let value = i128::from_le_bytes(take(bytes, pos, 16)?.try_into().unwrap());
            let stored_scale = take(bytes, pos, 1)?[0];
            if stored_scale != *scale {
                return Err(CacheError::Io("decimal scale mismatch in encoding".into()));
            }
            AttributeValue::Decimal {
                value,
                scale: stored_scale,
            }
        }
        AttributeType::Uuid => {
            AttributeValue::Uuid(Uuid::from_bytes(take(bytes, pos, 16)?.try_into().unwrap()))
        }
    };

    Ok(value)
}

/// Decode one row of the given attribute types from `bytes`, advancing `pos`.
pub fn decode_row(
    bytes: &[u8],
    pos: &mut usize,
    attribute_types: &[AttributeType],
) -> Result<Vec<AttributeValue>, CacheError> {
    attribute_types
        .iter()
        .map(|attribute_type| decode_value(bytes, pos, attribute_type))
        .collect()
}
