//! Dictionary keys and key extraction.
//!
//! A dictionary is keyed either by a single unsigned 64-bit integer (simple)
//! or by an opaque byte string formed by serialising the tuple of typed key
//! column values (complex). The choice is made at construction through the
//! type parameter of the dictionary; the two layouts are never unified at
//! run time.

use std::hash::Hash;

use crate::codec;
use crate::column::{AttributeValue, Column};
use crate::error::CacheError;
use crate::schema::{DictionarySchema, KeyLayout};

/// A key type usable by the cache dictionary.
pub trait DictionaryKey:
    Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static
{
    /// Whether this is the simple (integer) key layout.
    const IS_SIMPLE: bool;

    /// Materialise the flat key sequence from input key columns.
    ///
    /// When `rows` is given, only those row indices are extracted, in order.
    fn extract(key_columns: &[Column], rows: Option<&[usize]>) -> Result<Vec<Self>, CacheError>;

    /// View the key as a simple integer, when the layout allows it.
    fn as_simple(&self) -> Option<u64>;

    /// Deterministic 64-bit hash of the key's byte representation.
    fn stable_hash(&self) -> u64;

    /// Rebuild key columns from a sequence of keys, using the schema's key
    /// layout. Used by the scan stream over cached keys.
    fn key_columns(keys: &[Self], schema: &DictionarySchema) -> Result<Vec<Column>, CacheError>;
}

impl DictionaryKey for u64 {
    const IS_SIMPLE: bool = true;

    fn extract(key_columns: &[Column], rows: Option<&[usize]>) -> Result<Vec<Self>, CacheError> {
        let [column] = key_columns else {
            return Err(CacheError::TypeMismatch(format!(
                "simple key layout expects 1 key column, got {}",
                key_columns.len()
            )));
        };

        let value_at = |row: usize| -> Result<u64, CacheError> {
            column
                .get(row)
                .and_then(AttributeValue::as_u64)
                .ok_or_else(|| {
                    CacheError::TypeMismatch("simple key column must contain UInt64 values".into())
                })
        };

        match rows {
            Some(rows) => rows.iter().map(|row| value_at(*row)).collect(),
            None => (0..column.len()).map(value_at).collect(),
        }
    }

    fn as_simple(&self) -> Option<u64> {
        Some(*self)
    }

    fn stable_hash(&self) -> u64 {
        codec::hash64(&self.to_le_bytes())
    }

    fn key_columns(keys: &[Self], _schema: &DictionarySchema) -> Result<Vec<Column>, CacheError> {
        Ok(vec![keys.iter().map(|key| AttributeValue::UInt64(*key)).collect()])
    }
}

/// An opaque complex key: the serialised tuple of key column values.
///
/// Equality and hash are over the encoded bytes. Keys are owned by whoever
/// extracted them; an update unit owns the keys it was built for, and
/// dropping the unit frees them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComplexKey {
    bytes: Box<[u8]>,
}

impl ComplexKey {
    /// Wrap already-encoded key bytes.
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The encoded key bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl DictionaryKey for ComplexKey {
    const IS_SIMPLE: bool = false;

    fn extract(key_columns: &[Column], rows: Option<&[usize]>) -> Result<Vec<Self>, CacheError> {
        if key_columns.is_empty() {
            return Err(CacheError::TypeMismatch(
                "complex key layout expects at least 1 key column".into(),
            ));
        }
        let num_rows = key_columns[0].len();
        if key_columns.iter().any(|column| column.len() != num_rows) {
            return Err(CacheError::TypeMismatch(
                "key columns have differing row counts".into(),
            ));
        }

        let encode_at = |row: usize| -> Result<ComplexKey, CacheError> {
            let mut buf = Vec::new();
            for column in key_columns {
                let value = column.get(row).ok_or_else(|| {
                    CacheError::TypeMismatch(format!("key row index {row} is out of range"))
                })?;
                codec::encode_value(&mut buf, value);
            }
            Ok(ComplexKey::from_bytes(buf))
        };

        match rows {
            Some(rows) => rows.iter().map(|row| encode_at(*row)).collect(),
            None => (0..num_rows).map(encode_at).collect(),
        }
    }

    fn as_simple(&self) -> Option<u64> {
        None
    }

    fn stable_hash(&self) -> u64 {
        codec::hash64(&self.bytes)
    }

    fn key_columns(keys: &[Self], schema: &DictionarySchema) -> Result<Vec<Column>, CacheError> {
        let KeyLayout::Complex { key_attributes } = schema.key_layout() else {
            return Err(CacheError::Unsupported(
                "schema does not declare a complex key layout".into(),
            ));
        };

        let mut columns: Vec<Column> = vec![Vec::with_capacity(keys.len()); key_attributes.len()];
        for key in keys {
            let mut pos = 0;
            for (column, (_, attribute_type)) in columns.iter_mut().zip(key_attributes) {
                column.push(codec::decode_value(key.bytes(), &mut pos, attribute_type)?);
            }
            if pos != key.bytes().len() {
                return Err(CacheError::TypeMismatch(
                    "complex key bytes do not match the schema key layout".into(),
                ));
            }
        }
        Ok(columns)
    }
}

/// Materialises the flat key sequence for one dictionary call.
#[derive(Debug)]
pub struct KeysExtractor<K> {
    keys: Vec<K>,
}

impl<K: DictionaryKey> KeysExtractor<K> {
    /// Extract all rows of the given key columns.
    pub fn new(key_columns: &[Column]) -> Result<Self, CacheError> {
        Ok(Self {
            keys: K::extract(key_columns, None)?,
        })
    }

    /// Extract only the given row indices of the key columns.
    pub fn for_rows(key_columns: &[Column], rows: &[usize]) -> Result<Self, CacheError> {
        Ok(Self {
            keys: K::extract(key_columns, Some(rows))?,
        })
    }

    /// The extracted keys, in input order.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Consume the extractor and return the keys.
    pub fn into_keys(self) -> Vec<K> {
        self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::AttributeType;
    use crate::schema::AttributeDef;

    #[test]
    fn test_simple_extraction() {
        let column: Column = vec![
            AttributeValue::UInt64(5),
            AttributeValue::UInt64(7),
            AttributeValue::UInt64(5),
        ];
        let extractor = KeysExtractor::<u64>::new(std::slice::from_ref(&column)).unwrap();
        assert_eq!(extractor.keys(), &[5, 7, 5]);

        let subset = KeysExtractor::<u64>::for_rows(&[column], &[2, 0]).unwrap();
        assert_eq!(subset.keys(), &[5, 5]);
    }

    #[test]
    fn test_simple_extraction_rejects_wrong_types() {
        let column: Column = vec![AttributeValue::String("nope".into())];
        let result = KeysExtractor::<u64>::new(&[column]);
        assert!(matches!(result, Err(CacheError::TypeMismatch(_))));

        let result = KeysExtractor::<u64>::new(&[]);
        assert!(matches!(result, Err(CacheError::TypeMismatch(_))));
    }

    #[test]
    fn test_complex_keys_compare_by_bytes() {
        let columns: Vec<Column> = vec![
            vec![AttributeValue::UInt64(1), AttributeValue::UInt64(1)],
            vec![
                AttributeValue::String("a".into()),
                AttributeValue::String("a".into()),
            ],
        ];
        let keys = ComplexKey::extract(&columns, None).unwrap();
        assert_eq!(keys[0], keys[1]);
        assert_eq!(keys[0].stable_hash(), keys[1].stable_hash());
    }

    #[test]
    fn test_complex_key_columns_roundtrip() {
        let schema = DictionarySchema::new(
            KeyLayout::Complex {
                key_attributes: vec![
                    ("region".into(), AttributeType::String),
                    ("id".into(), AttributeType::UInt64),
                ],
            },
            vec![AttributeDef::new(
                "name",
                AttributeType::String,
                AttributeValue::String("".into()),
            )],
        )
        .unwrap();

        let columns: Vec<Column> = vec![
            vec![
                AttributeValue::String("eu".into()),
                AttributeValue::String("us".into()),
            ],
            vec![AttributeValue::UInt64(1), AttributeValue::UInt64(2)],
        ];
        let keys = ComplexKey::extract(&columns, None).unwrap();
        let rebuilt = ComplexKey::key_columns(&keys, &schema).unwrap();
        assert_eq!(rebuilt, columns);
    }

    #[test]
    fn test_row_selection_for_complex_keys() {
        let columns: Vec<Column> = vec![vec![
            AttributeValue::UInt64(10),
            AttributeValue::UInt64(20),
            AttributeValue::UInt64(30),
        ]];
        let keys = ComplexKey::extract(&columns, Some(&[2, 0])).unwrap();
        let all = ComplexKey::extract(&columns, None).unwrap();
        assert_eq!(keys, vec![all[2].clone(), all[0].clone()]);
    }
}
