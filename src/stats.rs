//! Dictionary counters and profiled lock guards.
//!
//! All counters are lock-free atomics; a consistent-enough view is taken
//! with [`DictionaryStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Counters kept by a cache dictionary over its lifetime.
#[derive(Debug, Default)]
pub struct DictionaryStats {
    /// Keys asked for across all calls.
    query_count: AtomicU64,
    /// Keys answered fresh from storage.
    hit_count: AtomicU64,
    /// Keys found expired but still usable.
    keys_expired: AtomicU64,
    /// Keys absent from storage.
    keys_not_found: AtomicU64,
    /// Keys handed to the update queue.
    keys_requested: AtomicU64,
    /// Requested keys the source returned.
    keys_requested_found: AtomicU64,
    /// Requested keys the source omitted.
    keys_requested_miss: AtomicU64,
    /// Update attempts against the source.
    requests: AtomicU64,
    /// Wall time spent reading source streams, in nanoseconds.
    request_time_ns: AtomicU64,
    /// Time spent acquiring the storage lock for reading, in nanoseconds.
    lock_read_ns: AtomicU64,
    /// Time spent acquiring the storage lock for writing, in nanoseconds.
    lock_write_ns: AtomicU64,
}

impl DictionaryStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fetch partition: queried, hit, expired and missing sizes.
    pub fn record_fetch(&self, queried: usize, hits: usize, expired: usize, not_found: usize) {
        self.query_count.fetch_add(queried as u64, Ordering::Relaxed);
        self.hit_count.fetch_add(hits as u64, Ordering::Relaxed);
        self.keys_expired.fetch_add(expired as u64, Ordering::Relaxed);
        self.keys_not_found
            .fetch_add(not_found as u64, Ordering::Relaxed);
    }

    /// Record keys handed to the update queue.
    pub fn record_keys_requested(&self, keys: usize) {
        self.keys_requested.fetch_add(keys as u64, Ordering::Relaxed);
    }

    /// Record one finished update attempt with its found/miss split.
    pub fn record_update_result(&self, requested: usize, found: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.keys_requested_found
            .fetch_add(found as u64, Ordering::Relaxed);
        self.keys_requested_miss
            .fetch_add(requested.saturating_sub(found) as u64, Ordering::Relaxed);
    }

    /// Record one failed update attempt.
    pub fn record_update_failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record wall time spent reading a source stream.
    pub fn record_request_time(&self, elapsed: Duration) {
        self.request_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Fraction of queried keys answered fresh from storage, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let queries = self.query_count.load(Ordering::Relaxed);
        if queries == 0 {
            return 0.0;
        }
        self.hit_count.load(Ordering::Relaxed) as f64 / queries as f64
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            query_count: self.query_count.load(Ordering::Relaxed),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            keys_expired: self.keys_expired.load(Ordering::Relaxed),
            keys_not_found: self.keys_not_found.load(Ordering::Relaxed),
            keys_requested: self.keys_requested.load(Ordering::Relaxed),
            keys_requested_found: self.keys_requested_found.load(Ordering::Relaxed),
            keys_requested_miss: self.keys_requested_miss.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            request_time: Duration::from_nanos(self.request_time_ns.load(Ordering::Relaxed)),
            lock_read_time: Duration::from_nanos(self.lock_read_ns.load(Ordering::Relaxed)),
            lock_write_time: Duration::from_nanos(self.lock_write_ns.load(Ordering::Relaxed)),
            hit_rate: self.hit_rate(),
        }
    }

    /// Acquire a read guard, charging the acquisition time to `lock_read_ns`.
    pub(crate) fn profiled_read<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockReadGuard<'a, T> {
        let started = Instant::now();
        let guard = lock.read();
        self.lock_read_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        guard
    }

    /// Acquire a write guard, charging the acquisition time to `lock_write_ns`.
    pub(crate) fn profiled_write<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockWriteGuard<'a, T> {
        let started = Instant::now();
        let guard = lock.write();
        self.lock_write_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        guard
    }
}

/// Point-in-time view of the dictionary counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Keys asked for across all calls.
    pub query_count: u64,
    /// Keys answered fresh from storage.
    pub hit_count: u64,
    /// Keys found expired but still usable.
    pub keys_expired: u64,
    /// Keys absent from storage.
    pub keys_not_found: u64,
    /// Keys handed to the update queue.
    pub keys_requested: u64,
    /// Requested keys the source returned.
    pub keys_requested_found: u64,
    /// Requested keys the source omitted.
    pub keys_requested_miss: u64,
    /// Update attempts against the source.
    pub requests: u64,
    /// Wall time spent reading source streams.
    pub request_time: Duration,
    /// Time spent acquiring the storage lock for reading.
    pub lock_read_time: Duration,
    /// Time spent acquiring the storage lock for writing.
    pub lock_write_time: Duration,
    /// Fraction of queried keys answered fresh from storage.
    pub hit_rate: f64,
}
