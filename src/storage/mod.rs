//! The cache storage contract and its implementations.
//!
//! A storage is a bounded, TTL-indexed key→attribute-row store. It is not
//! internally synchronised: the owning dictionary serialises access through
//! its reader-writer lock, and `fetch` runs under the write lock because it
//! may touch per-entry bookkeeping.

mod memory;
mod ssd;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

pub use memory::MemoryCacheStorage;
pub use ssd::SsdCacheStorage;

use crate::column::Column;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::key::DictionaryKey;

/// Result of one batched storage fetch.
///
/// Rows for fresh and usable-expired keys are materialised into
/// `fetched_columns` (full schema arity; columns the request does not ask
/// for are left empty), and the per-key indexes map each key to its row
/// offset in those columns.
#[derive(Debug)]
pub struct KeysFetchResult<K> {
    /// Materialised attribute columns for the keys found in storage.
    pub fetched_columns: Vec<Column>,
    /// Key → row offset for fresh entries.
    pub found_keys_index: HashMap<K, usize>,
    /// Key → row offset for usable-expired entries.
    pub expired_keys_index: HashMap<K, usize>,
    /// Keys whose entry is a negative (default) entry.
    pub default_keys: HashSet<K>,
    /// Keys that must be refetched: missing plus usable-expired.
    pub not_found_or_expired_keys: Vec<K>,
    /// Input row indices of `not_found_or_expired_keys`, aligned 1:1.
    pub not_found_or_expired_rows: Vec<usize>,
}

impl<K> KeysFetchResult<K> {
    /// An empty result with columns prepared for the given request.
    pub fn new(request: &FetchRequest) -> Self {
        Self {
            fetched_columns: request.make_result_columns(),
            found_keys_index: HashMap::new(),
            expired_keys_index: HashMap::new(),
            default_keys: HashSet::new(),
            not_found_or_expired_keys: Vec::new(),
            not_found_or_expired_rows: Vec::new(),
        }
    }
}

/// Freshness of one stored entry relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// `now ≤ deadline`.
    Fresh,
    /// `deadline < now ≤ deadline + strict_max_lifetime`.
    Expired,
    /// Beyond the strict bound; must be treated as missing.
    Invalid,
}

pub(crate) fn classify_entry(
    now: Instant,
    deadline: Instant,
    strict_max_lifetime: Duration,
) -> EntryState {
    if now <= deadline {
        EntryState::Fresh
    } else if now <= deadline + strict_max_lifetime {
        EntryState::Expired
    } else {
        EntryState::Invalid
    }
}

/// Atomic batched lookup and insert of key→attribute-row entries.
pub trait CacheStorage<K: DictionaryKey>: Send + Sync {
    /// Look up a batch of keys and partition them into fresh, usable-expired
    /// and missing.
    fn fetch(
        &mut self,
        keys: &[K],
        request: &FetchRequest,
    ) -> Result<KeysFetchResult<K>, CacheError>;

    /// Insert a batch of keys with their attribute rows.
    ///
    /// `attribute_columns` covers the full schema arity. Every entry is
    /// assigned a fresh random deadline within the configured band; eviction
    /// keeps the size within capacity.
    fn insert(&mut self, keys: &[K], attribute_columns: &[Column]) -> Result<(), CacheError>;

    /// Insert negative entries for keys the source did not return, so
    /// repeated misses are answered from cache until expiration.
    fn insert_defaults(&mut self, keys: &[K]) -> Result<(), CacheError>;

    /// Number of entries currently stored.
    fn len(&self) -> usize;

    /// Whether the storage holds no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity bound enforced by eviction.
    fn max_size(&self) -> usize;

    /// Approximate memory footprint in bytes.
    fn bytes_allocated(&self) -> usize;

    /// Keys of all currently usable non-default entries.
    fn cached_keys(&self) -> Vec<K>;

    /// Whether `fetch` materialises rows in the order of the requested keys.
    ///
    /// When true, callers may skip reordering on the fast path.
    fn returns_keys_in_order(&self) -> bool;
}
