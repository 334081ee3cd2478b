//! In-memory cell-table storage.
//!
//! A fixed array of cells addressed by key hash with bounded quadratic
//! probing. Attribute rows live in columnar containers parallel to the cell
//! table, one slot per cell. An existing cell for the same key is
//! overwritten in place; when the probe window holds neither an empty cell
//! nor the key, the probed cell with the earliest deadline is evicted, which
//! keeps eviction deterministic given the trace of operations.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::column::Column;
use crate::config::CacheStorageConfig;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::key::DictionaryKey;
use crate::schema::DictionarySchema;
use crate::storage::{CacheStorage, EntryState, KeysFetchResult, classify_entry};

/// Cells inspected per key before eviction kicks in.
const PROBE_WINDOW: usize = 16;

#[derive(Debug, Clone)]
struct Cell<K> {
    key: K,
    deadline: Instant,
    is_default: bool,
}

/// Fixed-size in-memory storage with probabilistic expiration.
///
/// `size_in_cells` is rounded up to the next power of two; the rounded value
/// is the capacity reported by [`CacheStorage::max_size`].
pub struct MemoryCacheStorage<K> {
    config: CacheStorageConfig,
    schema: Arc<DictionarySchema>,
    cells: Vec<Option<Cell<K>>>,
    /// `attributes[attribute_index][cell_slot]`, parallel to `cells`.
    attributes: Vec<Column>,
    mask: u64,
    occupied: usize,
    rng: StdRng,
}

impl<K: DictionaryKey> MemoryCacheStorage<K> {
    /// Create a storage for the given schema.
    pub fn new(
        config: CacheStorageConfig,
        schema: Arc<DictionarySchema>,
    ) -> Result<Self, CacheError> {
        if config.size_in_cells == 0 {
            return Err(CacheError::InvalidConfig(
                "cache.size_in_cells must be greater than zero".into(),
            ));
        }
        let capacity = config.size_in_cells.next_power_of_two();
        let attributes = schema.null_columns(capacity);

        Ok(Self {
            config,
            schema,
            cells: (0..capacity).map(|_| None).collect(),
            attributes,
            mask: capacity as u64 - 1,
            occupied: 0,
            rng: StdRng::from_entropy(),
        })
    }

    fn probe_slot(&self, hash: u64, step: usize) -> usize {
        let step = step as u64;
        ((hash.wrapping_add(step * step)) & self.mask) as usize
    }

    /// Find the slot holding `key` within the probe window.
    fn find_slot(&self, key: &K) -> Option<usize> {
        let hash = key.stable_hash();
        (0..PROBE_WINDOW.min(self.cells.len()))
            .map(|step| self.probe_slot(hash, step))
            .find(|slot| {
                self.cells[*slot]
                    .as_ref()
                    .is_some_and(|cell| cell.key == *key)
            })
    }

    /// Find the slot to write `key` into: the key's own cell, the first
    /// empty cell, or the probed cell with the earliest deadline.
    fn upsert_slot(&mut self, key: &K) -> usize {
        let hash = key.stable_hash();
        let window = PROBE_WINDOW.min(self.cells.len());

        let mut first_empty = None;
        let mut victim = self.probe_slot(hash, 0);
        let mut victim_deadline = None;

        for step in 0..window {
            let slot = self.probe_slot(hash, step);
            match &self.cells[slot] {
                Some(cell) if cell.key == *key => return slot,
                Some(cell) => {
                    if victim_deadline.is_none_or(|deadline| cell.deadline < deadline) {
                        victim = slot;
                        victim_deadline = Some(cell.deadline);
                    }
                }
                None => {
                    if first_empty.is_none() {
                        first_empty = Some(slot);
                    }
                }
            }
        }

        first_empty.unwrap_or(victim)
    }

    fn next_deadline(&mut self, now: Instant) -> Instant {
        let min = self.config.lifetime.min.as_nanos() as u64;
        let max = self.config.lifetime.max.as_nanos() as u64;
        let lifetime = if min == max {
            min
        } else {
            self.rng.gen_range(min..=max)
        };
        now + std::time::Duration::from_nanos(lifetime)
    }

    fn write_cell(&mut self, key: &K, row: Option<(&[Column], usize)>, now: Instant) {
        let slot = self.upsert_slot(key);
        if self.cells[slot].is_none() {
            self.occupied += 1;
        }
        let deadline = self.next_deadline(now);
        self.cells[slot] = Some(Cell {
            key: key.clone(),
            deadline,
            is_default: row.is_none(),
        });

        match row {
            Some((columns, row_index)) => {
                for (attribute_index, column) in columns.iter().enumerate() {
                    self.attributes[attribute_index][slot] = column[row_index].clone();
                }
            }
            None => {
                for (attribute_index, attribute) in self.schema.attributes().iter().enumerate() {
                    self.attributes[attribute_index][slot] = attribute.null_value.clone();
                }
            }
        }
    }

    fn validate_columns(&self, keys: &[K], columns: &[Column]) -> Result<(), CacheError> {
        if columns.len() != self.schema.attributes().len() {
            return Err(CacheError::TypeMismatch(format!(
                "insert expects {} attribute columns, got {}",
                self.schema.attributes().len(),
                columns.len()
            )));
        }
        if columns.iter().any(|column| column.len() != keys.len()) {
            return Err(CacheError::TypeMismatch(
                "attribute column row count does not match key count".into(),
            ));
        }
        Ok(())
    }
}

impl<K: DictionaryKey> CacheStorage<K> for MemoryCacheStorage<K> {
    fn fetch(
        &mut self,
        keys: &[K],
        request: &FetchRequest,
    ) -> Result<KeysFetchResult<K>, CacheError> {
        let now = Instant::now();
        let mut result = KeysFetchResult::new(request);
        let mut next_offset = 0usize;

        for (row, key) in keys.iter().enumerate() {
            if result.found_keys_index.contains_key(key)
                || result.expired_keys_index.contains_key(key)
                || result
                    .not_found_or_expired_keys
                    .iter()
                    .any(|seen| seen == key)
            {
                continue;
            }

            let Some(slot) = self.find_slot(key) else {
                result.not_found_or_expired_keys.push(key.clone());
                result.not_found_or_expired_rows.push(row);
                continue;
            };

            let cell = self.cells[slot].as_ref().expect("probed occupied cell");
            let state = classify_entry(now, cell.deadline, self.config.strict_max_lifetime);
            if state == EntryState::Invalid {
                result.not_found_or_expired_keys.push(key.clone());
                result.not_found_or_expired_rows.push(row);
                continue;
            }

            let is_default = cell.is_default;
            let offset = next_offset;
            next_offset += 1;

            for attribute_index in 0..self.schema.attributes().len() {
                if !request.should_fill(attribute_index) {
                    continue;
                }
                let value = if is_default {
                    request.provider(attribute_index).value_at(row)
                } else {
                    self.attributes[attribute_index][slot].clone()
                };
                result.fetched_columns[attribute_index].push(value);
            }

            if is_default {
                result.default_keys.insert(key.clone());
            }

            match state {
                EntryState::Fresh => {
                    result.found_keys_index.insert(key.clone(), offset);
                }
                EntryState::Expired => {
                    result.expired_keys_index.insert(key.clone(), offset);
                    result.not_found_or_expired_keys.push(key.clone());
                    result.not_found_or_expired_rows.push(row);
                }
                EntryState::Invalid => unreachable!("invalid entries are handled above"),
            }
        }

        Ok(result)
    }

    fn insert(&mut self, keys: &[K], attribute_columns: &[Column]) -> Result<(), CacheError> {
        self.validate_columns(keys, attribute_columns)?;
        let now = Instant::now();
        for (row, key) in keys.iter().enumerate() {
            self.write_cell(key, Some((attribute_columns, row)), now);
        }
        Ok(())
    }

    fn insert_defaults(&mut self, keys: &[K]) -> Result<(), CacheError> {
        let now = Instant::now();
        for key in keys {
            self.write_cell(key, None, now);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.occupied
    }

    fn max_size(&self) -> usize {
        self.cells.len()
    }

    fn bytes_allocated(&self) -> usize {
        let cells = self.cells.len() * std::mem::size_of::<Option<Cell<K>>>();
        let values: usize = self
            .attributes
            .iter()
            .flat_map(|column| column.iter())
            .map(|value| value.approximate_bytes())
            .sum();
        cells + values
    }

    fn cached_keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.cells
            .iter()
            .flatten()
            .filter(|cell| {
                !cell.is_default
                    && classify_entry(now, cell.deadline, self.config.strict_max_lifetime)
                        != EntryState::Invalid
            })
            .map(|cell| cell.key.clone())
            .collect()
    }

    fn returns_keys_in_order(&self) -> bool {
        false
    }
}
