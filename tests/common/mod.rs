//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use cachedict::prelude::*;

/// Schema with a single `name: String` attribute over a simple key.
pub fn simple_schema() -> Arc<DictionarySchema> {
    Arc::new(
        DictionarySchema::new(
            KeyLayout::Simple { name: "id".into() },
            vec![AttributeDef::new(
                "name",
                AttributeType::String,
                AttributeValue::String("".into()),
            )],
        )
        .unwrap(),
    )
}

/// Schema with `parent: UInt64 (hierarchical)` and `name: String`.
pub fn hierarchy_schema() -> Arc<DictionarySchema> {
    Arc::new(
        DictionarySchema::new(
            KeyLayout::Simple { name: "id".into() },
            vec![
                AttributeDef::new("parent", AttributeType::UInt64, AttributeValue::UInt64(0))
                    .hierarchical(),
                AttributeDef::new(
                    "name",
                    AttributeType::String,
                    AttributeValue::String("".into()),
                ),
            ],
        )
        .unwrap(),
    )
}

/// Schema over a complex `(region: String, id: UInt64)` key.
pub fn complex_schema() -> Arc<DictionarySchema> {
    Arc::new(
        DictionarySchema::new(
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
        .unwrap(),
    )
}

/// In-memory source of simple-key rows with a call counter and failure and
/// delay switches.
pub struct MockSource {
    schema: Arc<DictionarySchema>,
    rows: Mutex<HashMap<u64, Vec<AttributeValue>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MockSource {
    pub fn new(schema: Arc<DictionarySchema>) -> Self {
        Self {
            schema,
            rows: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(None),
        }
    }

    pub fn set_row(&self, id: u64, row: Vec<AttributeValue>) {
        self.rows.lock().insert(id, row);
    }

    pub fn remove_row(&self, id: u64) {
        self.rows.lock().remove(&id);
    }

    /// Number of load calls issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent load fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent load before it returns its stream.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }
}

impl DictionarySource for MockSource {
    fn supports_selective_load(&self) -> bool {
        true
    }

    fn load_ids(&self, ids: &[u64]) -> Result<BlockStream, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = *self.delay.lock() {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Io("mock source failure".into()));
        }

        let rows = self.rows.lock();
        let mut key_column: Column = Vec::new();
        let mut attribute_columns: Vec<Column> =
            vec![Vec::new(); self.schema.attributes().len()];
        for id in ids {
            if let Some(row) = rows.get(id) {
                key_column.push(AttributeValue::UInt64(*id));
                for (index, value) in row.iter().enumerate() {
                    attribute_columns[index].push(value.clone());
                }
            }
        }

        let mut columns = vec![key_column];
        columns.extend(attribute_columns);
        Ok(Box::new(std::iter::once(Block::new(columns))))
    }

    fn load_keys(
        &self,
        _key_columns: &[Column],
        _rows: &[usize],
    ) -> Result<BlockStream, CacheError> {
        Err(CacheError::Unsupported(
            "mock simple source cannot load complex keys".into(),
        ))
    }
}

/// In-memory source of complex-key rows, keyed by the encoded key tuple.
pub struct ComplexMockSource {
    schema: Arc<DictionarySchema>,
    rows: Mutex<HashMap<Vec<u8>, Vec<AttributeValue>>>,
    calls: AtomicUsize,
}

impl ComplexMockSource {
    pub fn new(schema: Arc<DictionarySchema>) -> Self {
        Self {
            schema,
            rows: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a row under the given key tuple.
    pub fn set_row(&self, key_tuple: &[AttributeValue], row: Vec<AttributeValue>) {
        let mut bytes = Vec::new();
        for value in key_tuple {
            cachedict::codec::encode_value(&mut bytes, value);
        }
        self.rows.lock().insert(bytes, row);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DictionarySource for ComplexMockSource {
    fn supports_selective_load(&self) -> bool {
        true
    }

    fn load_ids(&self, _ids: &[u64]) -> Result<BlockStream, CacheError> {
        Err(CacheError::Unsupported(
            "mock complex source cannot load simple ids".into(),
        ))
    }

    fn load_keys(&self, key_columns: &[Column], rows: &[usize]) -> Result<BlockStream, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let keys = ComplexKey::extract(key_columns, Some(rows))?;
        let stored = self.rows.lock();

        let mut out_key_columns: Vec<Column> = vec![Vec::new(); key_columns.len()];
        let mut attribute_columns: Vec<Column> =
            vec![Vec::new(); self.schema.attributes().len()];
        for (key, row) in keys.iter().zip(rows) {
            if let Some(values) = stored.get(key.bytes()) {
                for (column_index, out_column) in out_key_columns.iter_mut().enumerate() {
                    out_column.push(key_columns[column_index][*row].clone());
                }
                for (index, value) in values.iter().enumerate() {
                    attribute_columns[index].push(value.clone());
                }
            }
        }

        let mut columns = out_key_columns;
        columns.extend(attribute_columns);
        Ok(Box::new(std::iter::once(Block::new(columns))))
    }
}

/// A source that refuses selective load; dictionaries over it must fail.
pub struct FullScanOnlySource;

impl DictionarySource for FullScanOnlySource {
    fn supports_selective_load(&self) -> bool {
        false
    }

    fn load_ids(&self, _ids: &[u64]) -> Result<BlockStream, CacheError> {
        Err(CacheError::Unsupported("selective load unsupported".into()))
    }

    fn load_keys(
        &self,
        _key_columns: &[Column],
        _rows: &[usize],
    ) -> Result<BlockStream, CacheError> {
        Err(CacheError::Unsupported("selective load unsupported".into()))
    }
}

/// Memory storage with the given cell count and lifetime band.
pub fn memory_storage<K: DictionaryKey>(
    schema: &Arc<DictionarySchema>,
    size_in_cells: usize,
    lifetime_min: Duration,
    lifetime_max: Duration,
    strict_max_lifetime: Duration,
) -> Box<MemoryCacheStorage<K>> {
    let config = CacheStorageConfig::new(
        size_in_cells,
        strict_max_lifetime,
        DictionaryLifetime::new(lifetime_min, lifetime_max).unwrap(),
    )
    .unwrap();
    Box::new(MemoryCacheStorage::new(config, schema.clone()).unwrap())
}

/// Queue configuration with short, test-friendly timeouts.
pub fn queue_config() -> UpdateQueueConfig {
    UpdateQueueConfig {
        max_update_queue_size: 16,
        max_threads_for_updates: 2,
        push_timeout: Duration::from_millis(100),
        query_wait_timeout: Duration::from_secs(10),
    }
}

/// Build a key column from simple ids.
pub fn id_column(ids: &[u64]) -> Column {
    ids.iter().map(|id| AttributeValue::UInt64(*id)).collect()
}

/// Build a string column.
pub fn string_column(values: &[&str]) -> Column {
    values
        .iter()
        .map(|value| AttributeValue::String((*value).into()))
        .collect()
}

/// Extract the strings of a column, for assertions.
pub fn strings(column: &Column) -> Vec<String> {
    column
        .iter()
        .map(|value| match value {
            AttributeValue::String(text) => text.clone(),
            other => panic!("expected a string value, got {other:?}"),
        })
        .collect()
}
