//! The cache dictionary core.
//!
//! Coordinates the storage, the update queue and the external source: the
//! batched lookup pipeline partitions a key set into fresh, usable-expired
//! and missing, serves what it can from storage, and schedules synchronous
//! or asynchronous updates for the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::column::Column;
use crate::config::UpdateQueueConfig;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::key::{DictionaryKey, KeysExtractor};
use crate::schema::{DictionarySchema, KeyLayout};
use crate::source::DictionarySource;
use crate::stats::{DictionaryStats, StatsSnapshot};
use crate::storage::{CacheStorage, KeysFetchResult};
use crate::update::{UpdateCallback, UpdateQueue, UpdateUnit};

const BACKOFF_INITIAL_SECS: u64 = 1;
const BACKOFF_DOUBLING_CAP: u64 = 10;
const BACKOFF_JITTER_MILLIS: u64 = 500;

/// Bounded exponential backoff with jitter; monotone non-decreasing in
/// `error_count` up to the doubling cap.
fn backoff_duration(error_count: u64, rng: &mut StdRng) -> Duration {
    let exponent = error_count.saturating_sub(1).min(BACKOFF_DOUBLING_CAP) as u32;
    Duration::from_secs(BACKOFF_INITIAL_SECS << exponent)
        + Duration::from_millis(rng.gen_range(0..=BACKOFF_JITTER_MILLIS))
}

/// Source error bookkeeping, mutated only under the storage write lock.
#[derive(Debug, Default)]
struct BackoffState {
    error_count: u64,
    backoff_end_time: Option<SystemTime>,
    last_error: Option<Arc<CacheError>>,
}

impl BackoffState {
    fn clear(&mut self) {
        self.error_count = 0;
        self.backoff_end_time = None;
        self.last_error = None;
    }
}

/// Everything the dictionary's reader-writer lock guards.
struct GuardedState<K: DictionaryKey> {
    storage: Box<dyn CacheStorage<K>>,
    backoff: BackoffState,
}

struct DictionaryInner<K: DictionaryKey> {
    name: String,
    schema: Arc<DictionarySchema>,
    /// Serialises access to the source handle.
    source: Mutex<Arc<dyn DictionarySource>>,
    guarded: RwLock<GuardedState<K>>,
    stats: DictionaryStats,
    allow_read_expired_keys: bool,
    rng: Mutex<StdRng>,
}

/// A read-through caching dictionary over an external key→attributes source.
///
/// The key layout is chosen at construction through the type parameter:
/// `CacheDictionary<u64>` for simple keys, `CacheDictionary<ComplexKey>` for
/// tuple keys.
pub struct CacheDictionary<K: DictionaryKey> {
    inner: Arc<DictionaryInner<K>>,
    update_queue: UpdateQueue<K>,
}

impl<K: DictionaryKey> CacheDictionary<K> {
    /// Create a dictionary over the given source and storage.
    ///
    /// Fails with [`CacheError::Unsupported`] when the source cannot load a
    /// selected set of keys, and with [`CacheError::TypeMismatch`] when the
    /// schema's key layout does not match the key type parameter.
    pub fn new(
        name: impl Into<String>,
        schema: Arc<DictionarySchema>,
        source: Arc<dyn DictionarySource>,
        storage: Box<dyn CacheStorage<K>>,
        update_queue_config: UpdateQueueConfig,
        allow_read_expired_keys: bool,
    ) -> Result<Self, CacheError> {
        let name = name.into();

        if !source.supports_selective_load() {
            return Err(CacheError::Unsupported(format!(
                "dictionary '{name}': source cannot be used with a cache dictionary"
            )));
        }
        let layout_matches = match schema.key_layout() {
            KeyLayout::Simple { .. } => K::IS_SIMPLE,
            KeyLayout::Complex { .. } => !K::IS_SIMPLE,
        };
        if !layout_matches {
            return Err(CacheError::TypeMismatch(format!(
                "dictionary '{name}': schema key layout does not match the key type"
            )));
        }

        let inner = Arc::new(DictionaryInner {
            name,
            schema,
            source: Mutex::new(source),
            guarded: RwLock::new(GuardedState {
                storage,
                backoff: BackoffState::default(),
            }),
            stats: DictionaryStats::new(),
            allow_read_expired_keys,
            rng: Mutex::new(StdRng::from_entropy()),
        });

        let callback: UpdateCallback<K> = {
            let inner = Arc::clone(&inner);
            Arc::new(move |unit| DictionaryInner::update(&inner, unit))
        };
        let update_queue = UpdateQueue::new(update_queue_config, callback)?;

        Ok(Self {
            inner,
            update_queue,
        })
    }

    /// The dictionary name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The dictionary schema.
    pub fn schema(&self) -> &DictionarySchema {
        &self.inner.schema
    }

    /// Fetch the named attributes for a batch of keys.
    ///
    /// `key_columns` supplies the key values; the output columns align 1:1
    /// with the input key rows, in caller attribute order. `default_columns`
    /// is aligned with `attribute_names`; when the source omits a key, its
    /// row takes the caller default (or the schema null value for `None`).
    pub fn get_columns(
        &self,
        attribute_names: &[&str],
        key_columns: &[Column],
        default_columns: &[Option<Column>],
    ) -> Result<Vec<Column>, CacheError> {
        let request = FetchRequest::new(&self.inner.schema, attribute_names, default_columns)?;
        let keys = KeysExtractor::<K>::new(key_columns)?.into_keys();
        self.get_columns_impl(&request, key_columns, &keys)
    }

    /// Fetch a single attribute for a batch of keys.
    pub fn get_column(
        &self,
        attribute_name: &str,
        key_columns: &[Column],
        default_column: Option<Column>,
    ) -> Result<Column, CacheError> {
        let mut columns =
            self.get_columns(&[attribute_name], key_columns, &[default_column])?;
        Ok(columns.pop().expect("one requested attribute"))
    }

    fn get_columns_impl(
        &self,
        request: &FetchRequest,
        key_columns: &[Column],
        keys: &[K],
    ) -> Result<Vec<Column>, CacheError> {
        let inner = &self.inner;

        let (fetch_result, in_key_order) = {
            let mut guarded = inner.stats.profiled_write(&inner.guarded);
            let result = guarded.storage.fetch(keys, request)?;
            (result, guarded.storage.returns_keys_in_order())
        };

        let expired_size = fetch_result.expired_keys_index.len();
        let found_size = fetch_result.found_keys_index.len();
        // The indexes are deduplicated, so the missing count comes from the
        // deduplicated refetch set (missing ∪ expired), not from `keys`.
        let not_found_size = fetch_result
            .not_found_or_expired_keys
            .len()
            .saturating_sub(expired_size);
        inner
            .stats
            .record_fetch(keys.len(), found_size, expired_size, not_found_size);

        if not_found_size == 0 && expired_size == 0 {
            // All keys fresh in storage.
            let columns = if in_key_order {
                fetch_result.fetched_columns
            } else {
                aggregate_columns_in_order_of_keys(keys, request, &fetch_result)
            };
            return Ok(request.filter_requested(columns));
        }

        if not_found_size == 0 && expired_size > 0 && inner.allow_read_expired_keys {
            // Serve stale and refresh in the background; the caller does not
            // wait on the unit.
            let unit = self.make_update_unit(&fetch_result, key_columns, request.clone());
            self.update_queue.try_push(unit)?;

            let columns = if in_key_order {
                fetch_result.fetched_columns
            } else {
                aggregate_columns_in_order_of_keys(keys, request, &fetch_result)
            };
            return Ok(request.filter_requested(columns));
        }

        // Synchronous update for the union of missing and expired keys.
        let unit = self.make_update_unit(&fetch_result, key_columns, request.clone());
        self.update_queue.try_push(Arc::clone(&unit))?;
        self.update_queue.wait_for_finish(&unit)?;

        let (columns_during_update, found_during_update) = unit.take_outputs();
        let aggregated = aggregate_columns(
            keys,
            request,
            &fetch_result.fetched_columns,
            &fetch_result.found_keys_index,
            &columns_during_update,
            &found_during_update,
        );
        Ok(request.filter_requested(aggregated))
    }

    /// Check which keys exist, either fresh in storage or in the source.
    ///
    /// Negative entries report `false`: the source said no, and that answer
    /// is cached until expiration.
    pub fn has_keys(&self, key_columns: &[Column]) -> Result<Vec<bool>, CacheError> {
        let inner = &self.inner;
        let request = FetchRequest::empty(&inner.schema);
        let keys = KeysExtractor::<K>::new(key_columns)?.into_keys();

        let fetch_result = {
            let mut guarded = inner.stats.profiled_write(&inner.guarded);
            guarded.storage.fetch(&keys, &request)?
        };

        let expired_size = fetch_result.expired_keys_index.len();
        let found_size = fetch_result.found_keys_index.len();
        // Same deduplicated missing count as the get path; `keys` may hold
        // duplicates of a single cached entry.
        let not_found_size = fetch_result
            .not_found_or_expired_keys
            .len()
            .saturating_sub(expired_size);
        inner
            .stats
            .record_fetch(keys.len(), found_size, expired_size, not_found_size);

        if not_found_size == 0 && (expired_size == 0 || inner.allow_read_expired_keys) {
            if expired_size > 0 {
                let unit = self.make_update_unit(&fetch_result, key_columns, request);
                self.update_queue.try_push(unit)?;
            }
            if fetch_result.default_keys.is_empty() {
                return Ok(vec![true; keys.len()]);
            }
            return Ok(keys
                .iter()
                .map(|key| !fetch_result.default_keys.contains(key))
                .collect());
        }

        let unit = self.make_update_unit(&fetch_result, key_columns, request);
        self.update_queue.try_push(Arc::clone(&unit))?;
        self.update_queue.wait_for_finish(&unit)?;

        let (_, found_during_update) = unit.take_outputs();
        Ok(keys
            .iter()
            .map(|key| {
                let fresh = fetch_result.found_keys_index.contains_key(key)
                    && !fetch_result.default_keys.contains(key);
                fresh || found_during_update.contains_key(key)
            })
            .collect())
    }

    fn make_update_unit(
        &self,
        fetch_result: &KeysFetchResult<K>,
        key_columns: &[Column],
        request: FetchRequest,
    ) -> Arc<UpdateUnit<K>> {
        if K::IS_SIMPLE {
            Arc::new(UpdateUnit::for_simple_keys(
                fetch_result.not_found_or_expired_keys.clone(),
                request,
            ))
        } else {
            Arc::new(UpdateUnit::for_complex_keys(
                fetch_result.not_found_or_expired_keys.clone(),
                key_columns.to_vec(),
                fetch_result.not_found_or_expired_rows.clone(),
                request,
            ))
        }
    }

    /// Number of entries currently stored.
    pub fn element_count(&self) -> usize {
        self.inner.stats.profiled_read(&self.inner.guarded).storage.len()
    }

    /// Approximate memory footprint of the storage in bytes.
    pub fn bytes_allocated(&self) -> usize {
        self.inner
            .stats
            .profiled_read(&self.inner.guarded)
            .storage
            .bytes_allocated()
    }

    /// Fill ratio of the storage, in `[0, 1]`.
    pub fn load_factor(&self) -> f64 {
        let guarded = self.inner.stats.profiled_read(&self.inner.guarded);
        guarded.storage.len() as f64 / guarded.storage.max_size() as f64
    }

    /// The last source error observed by an update, if any.
    pub fn last_error(&self) -> Option<Arc<CacheError>> {
        self.inner
            .stats
            .profiled_read(&self.inner.guarded)
            .backoff
            .last_error
            .clone()
    }

    /// Fraction of queried keys answered fresh from storage.
    pub fn hit_rate(&self) -> f64 {
        self.inner.stats.hit_rate()
    }

    /// Point-in-time snapshot of the dictionary counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// The current source handle.
    pub fn source(&self) -> Arc<dyn DictionarySource> {
        self.inner.source.lock().clone()
    }

    /// Stop the update queue and join its workers. Idempotent; also runs on
    /// drop.
    pub fn stop_and_wait(&self) {
        self.update_queue.stop_and_wait();
    }

    pub(crate) fn cached_keys(&self) -> Vec<K> {
        self.inner
            .stats
            .profiled_read(&self.inner.guarded)
            .storage
            .cached_keys()
    }
}

impl<K: DictionaryKey> DictionaryInner<K> {
    /// The update worker body: resolve a unit's keys against the source and
    /// insert the results into storage.
    fn update(inner: &Arc<Self>, unit: &Arc<UpdateUnit<K>>) -> Result<(), CacheError> {
        let requested_size = unit.requested_keys().len();
        inner.stats.record_keys_requested(requested_size);

        let now = SystemTime::now();
        let backoff_end = inner
            .stats
            .profiled_read(&inner.guarded)
            .backoff
            .backoff_end_time;
        if let Some(retry_at) = backoff_end {
            if now <= retry_at {
                return Err(CacheError::Backoff { retry_at });
            }
        }

        match Self::update_from_source(inner, unit) {
            Ok(found) => {
                inner.stats.record_update_result(requested_size, found);
                Ok(())
            }
            Err(error) => {
                inner.stats.record_update_failure();
                let error = Arc::new(error);
                let retry_at = {
                    let mut guarded = inner.stats.profiled_write(&inner.guarded);
                    guarded.backoff.error_count += 1;
                    let backoff =
                        backoff_duration(guarded.backoff.error_count, &mut inner.rng.lock());
                    let retry_at = now + backoff;
                    guarded.backoff.backoff_end_time = Some(retry_at);
                    guarded.backoff.last_error = Some(Arc::clone(&error));
                    retry_at
                };
                tracing::warn!(
                    dictionary = %inner.name,
                    error = %error,
                    retry_at = ?retry_at,
                    "could not update cache dictionary"
                );
                Err(CacheError::UpdateFailed {
                    message: error.to_string(),
                })
            }
        }
    }

    fn update_from_source(
        inner: &Arc<Self>,
        unit: &Arc<UpdateUnit<K>>,
    ) -> Result<usize, CacheError> {
        // Source mutex strictly before the storage write lock.
        let source = inner.source.lock().clone();

        let stream = if K::IS_SIMPLE {
            let ids: Vec<u64> = unit
                .requested_keys()
                .iter()
                .map(|key| key.as_simple().expect("simple key layout"))
                .collect();
            source.load_ids(&ids)?
        } else {
            source.load_keys(unit.key_columns(), unit.requested_rows())?
        };

        let request = unit.request();
        let key_arity = inner.schema.key_arity();
        let attributes_len = inner.schema.attributes().len();

        let started = Instant::now();
        // Held across the stream read: concurrent readers wait until the
        // update has fully landed in storage.
        let mut guarded = inner.stats.profiled_write(&inner.guarded);

        let mut found = 0usize;
        let mut fetched_columns = request.make_result_columns();
        let mut found_keys_index: HashMap<K, usize> = HashMap::new();

        for block in stream {
            let block = block?;
            if block.num_columns() != key_arity + attributes_len {
                return Err(CacheError::TypeMismatch(format!(
                    "source block has {} columns, expected {key_arity} key and {attributes_len} attribute columns",
                    block.num_columns()
                )));
            }
            let columns = block.into_columns();
            let (key_columns, attribute_columns) = columns.split_at(key_arity);
            let keys = K::extract(key_columns, None)?;

            guarded.storage.insert(&keys, attribute_columns)?;

            for (attribute_index, column) in attribute_columns.iter().enumerate() {
                if request.should_fill(attribute_index) {
                    fetched_columns[attribute_index].extend_from_slice(column);
                }
            }
            for (block_row, key) in keys.iter().enumerate() {
                found_keys_index.insert(key.clone(), found + block_row);
            }
            found += keys.len();
        }

        // Negative entries for keys the source omitted, so repeated misses
        // are answered from cache until expiration.
        let missing: Vec<K> = unit
            .requested_keys()
            .iter()
            .filter(|key| !found_keys_index.contains_key(*key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            guarded.storage.insert_defaults(&missing)?;
        }

        guarded.backoff.clear();
        drop(guarded);

        inner.stats.record_request_time(started.elapsed());
        unit.set_outputs(fetched_columns, found_keys_index);
        Ok(found)
    }
}

impl<K: DictionaryKey> Drop for CacheDictionary<K> {
    fn drop(&mut self) {
        self.update_queue.stop_and_wait();
    }
}

/// Reorder storage rows into input-key order. Fresh rows win over expired
/// rows for keys present in both indexes.
fn aggregate_columns_in_order_of_keys<K: DictionaryKey>(
    keys: &[K],
    request: &FetchRequest,
    fetch_result: &KeysFetchResult<K>,
) -> Vec<Column> {
    let mut aggregated = request.make_result_columns();

    for attribute_index in 0..request.attributes_len() {
        if !request.should_fill(attribute_index) {
            continue;
        }
        let fetched_column = &fetch_result.fetched_columns[attribute_index];
        let aggregated_column = &mut aggregated[attribute_index];

        for key in keys {
            let offset = fetch_result
                .found_keys_index
                .get(key)
                .or_else(|| fetch_result.expired_keys_index.get(key));
            if let Some(offset) = offset {
                aggregated_column.push(fetched_column[*offset].clone());
            }
        }
    }

    aggregated
}

/// Merge storage rows, update rows and defaults into input-key order.
///
/// Fresh storage rows win over update rows; defaults apply only to keys in
/// neither index.
fn aggregate_columns<K: DictionaryKey>(
    keys: &[K],
    request: &FetchRequest,
    columns_from_storage: &[Column],
    found_in_storage: &HashMap<K, usize>,
    columns_during_update: &[Column],
    found_during_update: &HashMap<K, usize>,
) -> Vec<Column> {
    let mut aggregated = request.make_result_columns();

    for attribute_index in 0..request.attributes_len() {
        if !request.should_fill(attribute_index) {
            continue;
        }
        let aggregated_column = &mut aggregated[attribute_index];

        for (key_index, key) in keys.iter().enumerate() {
            let value = if let Some(offset) = found_in_storage.get(key) {
                columns_from_storage[attribute_index][*offset].clone()
            } else if let Some(offset) = found_during_update.get(key) {
                columns_during_update[attribute_index][*offset].clone()
            } else {
                request.provider(attribute_index).value_at(key_index)
            };
            aggregated_column.push(value);
        }
    }

    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{AttributeType, AttributeValue};
    use crate::schema::AttributeDef;

    fn schema() -> DictionarySchema {
        DictionarySchema::new(
            KeyLayout::Simple { name: "id".into() },
            vec![AttributeDef::new(
                "name",
                AttributeType::String,
                AttributeValue::String("".into()),
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        let jitter = Duration::from_millis(BACKOFF_JITTER_MILLIS);

        for error_count in 1..=14u64 {
            let base = Duration::from_secs(
                BACKOFF_INITIAL_SECS << error_count.saturating_sub(1).min(BACKOFF_DOUBLING_CAP),
            );
            let duration = backoff_duration(error_count, &mut rng);
            assert!(duration >= base, "error_count {error_count}");
            assert!(duration <= base + jitter, "error_count {error_count}");
        }

        // The base is capped.
        let capped = backoff_duration(100, &mut rng);
        assert!(capped <= Duration::from_secs(BACKOFF_INITIAL_SECS << BACKOFF_DOUBLING_CAP) + jitter);
    }

    #[test]
    fn test_aggregate_fresh_wins_over_expired() {
        let schema = schema();
        let request = FetchRequest::new(&schema, &["name"], &[None]).unwrap();

        let mut fetch_result: KeysFetchResult<u64> = KeysFetchResult::new(&request);
        fetch_result.fetched_columns[0] = vec![
            AttributeValue::String("fresh".into()),
            AttributeValue::String("stale".into()),
        ];
        fetch_result.found_keys_index.insert(1, 0);
        fetch_result.expired_keys_index.insert(1, 1);

        let aggregated = aggregate_columns_in_order_of_keys(&[1], &request, &fetch_result);
        assert_eq!(aggregated[0], vec![AttributeValue::String("fresh".into())]);
    }

    #[test]
    fn test_aggregate_storage_wins_over_update() {
        let schema = schema();
        let request = FetchRequest::new(&schema, &["name"], &[None]).unwrap();

        let storage_columns = vec![vec![AttributeValue::String("storage".into())]];
        let update_columns = vec![vec![AttributeValue::String("update".into())]];
        let found_in_storage = HashMap::from([(1u64, 0usize)]);
        let found_during_update = HashMap::from([(1u64, 0usize), (2u64, 0usize)]);

        let aggregated = aggregate_columns(
            &[1, 2, 3],
            &request,
            &storage_columns,
            &found_in_storage,
            &update_columns,
            &found_during_update,
        );

        assert_eq!(
            aggregated[0],
            vec![
                AttributeValue::String("storage".into()),
                AttributeValue::String("update".into()),
                // Key 3 is in neither index and falls back to the default.
                AttributeValue::String("".into()),
            ]
        );
    }

    #[test]
    fn test_aggregate_uses_caller_default_rows() {
        let schema = schema();
        let defaults = vec![Some(vec![
            AttributeValue::String("d0".into()),
            AttributeValue::String("d1".into()),
        ])];
        let request = FetchRequest::new(&schema, &["name"], &defaults).unwrap();

        let aggregated = aggregate_columns::<u64>(
            &[10, 11],
            &request,
            &[Vec::new()],
            &HashMap::new(),
            &[Vec::new()],
            &HashMap::new(),
        );

        assert_eq!(
            aggregated[0],
            vec![
                AttributeValue::String("d0".into()),
                AttributeValue::String("d1".into()),
            ]
        );
    }
}
