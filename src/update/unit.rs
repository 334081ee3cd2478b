//! One in-flight fetch request against the external source.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::column::Column;
use crate::error::CacheError;
use crate::fetch::FetchRequest;
use crate::key::DictionaryKey;

/// Lifecycle of an update unit.
///
/// Transitions are one-way:
/// `Created → Enqueued → (InProgress → {Done | Failed}) | Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Built by a caller, not yet handed to the queue.
    Created,
    /// Accepted by the queue, waiting for a worker.
    Enqueued,
    /// A worker is running the update callback.
    InProgress,
    /// The callback finished and the outputs are readable.
    Done,
    /// The callback failed; the error is stored on the unit.
    Failed,
    /// The queue was stopped before a worker finished the unit.
    Cancelled,
}

impl UpdateState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateState::Done | UpdateState::Failed | UpdateState::Cancelled
        )
    }
}

#[derive(Debug)]
struct UnitInner<K> {
    state: UpdateState,
    error: Option<CacheError>,
    fetched_columns: Vec<Column>,
    found_keys_index: HashMap<K, usize>,
}

/// One outstanding request to the update queue.
///
/// The descriptor (keys, request) is immutable; the output slots live behind
/// the unit's mutex and become readable once the completion signal is
/// raised, which is the happens-before edge between the worker and the
/// waiting caller. A unit is signalled exactly once and never re-enqueued.
#[derive(Debug)]
pub struct UpdateUnit<K> {
    requested_keys: Vec<K>,
    /// Complex-key layout only: the caller's key columns.
    key_columns: Vec<Column>,
    /// Complex-key layout only: row indices into `key_columns`.
    requested_rows: Vec<usize>,
    request: FetchRequest,
    inner: Mutex<UnitInner<K>>,
    finished: Condvar,
}

impl<K: DictionaryKey> UpdateUnit<K> {
    /// Build a unit for simple keys.
    pub fn for_simple_keys(requested_keys: Vec<K>, request: FetchRequest) -> Self {
        Self::new(requested_keys, Vec::new(), Vec::new(), request)
    }

    /// Build a unit for complex keys.
    ///
    /// The unit owns its extracted keys; dropping it frees them.
    pub fn for_complex_keys(
        requested_keys: Vec<K>,
        key_columns: Vec<Column>,
        requested_rows: Vec<usize>,
        request: FetchRequest,
    ) -> Self {
        Self::new(requested_keys, key_columns, requested_rows, request)
    }

    fn new(
        requested_keys: Vec<K>,
        key_columns: Vec<Column>,
        requested_rows: Vec<usize>,
        request: FetchRequest,
    ) -> Self {
        Self {
            requested_keys,
            key_columns,
            requested_rows,
            request,
            inner: Mutex::new(UnitInner {
                state: UpdateState::Created,
                error: None,
                fetched_columns: Vec::new(),
                found_keys_index: HashMap::new(),
            }),
            finished: Condvar::new(),
        }
    }

    /// The keys this unit must resolve.
    pub fn requested_keys(&self) -> &[K] {
        &self.requested_keys
    }

    /// The caller's key columns (complex layout only).
    pub fn key_columns(&self) -> &[Column] {
        &self.key_columns
    }

    /// Row indices into the key columns (complex layout only).
    pub fn requested_rows(&self) -> &[usize] {
        &self.requested_rows
    }

    /// The fetch request the unit was built for.
    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UpdateState {
        self.inner.lock().state
    }

    /// `Created → Enqueued`, when accepted by the queue.
    pub(crate) fn mark_enqueued(&self) {
        let mut inner = self.inner.lock();
        if inner.state == UpdateState::Created {
            inner.state = UpdateState::Enqueued;
        }
    }

    /// `Enqueued → InProgress`, when a worker picks the unit up.
    pub(crate) fn mark_in_progress(&self) {
        let mut inner = self.inner.lock();
        if inner.state == UpdateState::Enqueued {
            inner.state = UpdateState::InProgress;
        }
    }

    /// Store the worker's outputs. Must happen before the unit is signalled.
    pub(crate) fn set_outputs(
        &self,
        fetched_columns: Vec<Column>,
        found_keys_index: HashMap<K, usize>,
    ) {
        let mut inner = self.inner.lock();
        inner.fetched_columns = fetched_columns;
        inner.found_keys_index = found_keys_index;
    }

    /// Signal successful completion.
    pub(crate) fn complete(&self) {
        self.finish(UpdateState::Done, None);
    }

    /// Signal failure, storing the error for `wait_finished` to rethrow.
    pub(crate) fn fail(&self, error: CacheError) {
        self.finish(UpdateState::Failed, Some(error));
    }

    /// Signal cancellation.
    pub(crate) fn cancel(&self) {
        self.finish(UpdateState::Cancelled, None);
    }

    fn finish(&self, state: UpdateState, error: Option<CacheError>) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = state;
        inner.error = error;
        drop(inner);
        self.finished.notify_all();
    }

    /// Block until the unit reaches a terminal state, up to `timeout`.
    pub(crate) fn wait_finished(&self, timeout: std::time::Duration) -> Result<(), CacheError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                UpdateState::Done => return Ok(()),
                UpdateState::Failed => {
                    return Err(inner.error.clone().unwrap_or(CacheError::UpdateFailed {
                        message: "update failed".into(),
                    }));
                }
                UpdateState::Cancelled => return Err(CacheError::Cancelled),
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(CacheError::UpdateTimeout { timeout });
            }
            self.finished.wait_until(&mut inner, deadline);
        }
    }

    /// Take the worker's outputs after successful completion.
    pub(crate) fn take_outputs(&self) -> (Vec<Column>, HashMap<K, usize>) {
        let mut inner = self.inner.lock();
        (
            std::mem::take(&mut inner.fetched_columns),
            std::mem::take(&mut inner.found_keys_index),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{AttributeType, AttributeValue};
    use crate::schema::{AttributeDef, DictionarySchema, KeyLayout};
    use std::sync::Arc;
    use std::time::Duration;

    fn request() -> FetchRequest {
        let schema = DictionarySchema::new(
            KeyLayout::Simple { name: "id".into() },
            vec![AttributeDef::new(
                "name",
                AttributeType::String,
                AttributeValue::String("".into()),
            )],
        )
        .unwrap();
        FetchRequest::empty(&schema)
    }

    #[test]
    fn test_state_transitions_are_one_way() {
        let unit: UpdateUnit<u64> = UpdateUnit::for_simple_keys(vec![1], request());
        assert_eq!(unit.state(), UpdateState::Created);

        unit.mark_enqueued();
        assert_eq!(unit.state(), UpdateState::Enqueued);

        unit.mark_in_progress();
        assert_eq!(unit.state(), UpdateState::InProgress);

        unit.complete();
        assert_eq!(unit.state(), UpdateState::Done);

        // A terminal unit is never re-signalled.
        unit.fail(CacheError::Cancelled);
        assert_eq!(unit.state(), UpdateState::Done);
        unit.cancel();
        assert_eq!(unit.state(), UpdateState::Done);
    }

    #[test]
    fn test_wait_resolves_on_done() {
        let unit: Arc<UpdateUnit<u64>> = Arc::new(UpdateUnit::for_simple_keys(vec![1], request()));

        let waiter = {
            let unit = Arc::clone(&unit);
            std::thread::spawn(move || unit.wait_finished(Duration::from_secs(5)))
        };

        unit.set_outputs(vec![vec![AttributeValue::UInt64(9)]], HashMap::from([(1, 0)]));
        unit.complete();

        waiter.join().unwrap().unwrap();
        let (columns, index) = unit.take_outputs();
        assert_eq!(columns[0], vec![AttributeValue::UInt64(9)]);
        assert_eq!(index[&1], 0);
    }

    #[test]
    fn test_wait_rethrows_stored_error() {
        let unit: UpdateUnit<u64> = UpdateUnit::for_simple_keys(vec![1], request());
        unit.fail(CacheError::UpdateFailed {
            message: "boom".into(),
        });

        let err = unit.wait_finished(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CacheError::UpdateFailed { message } if message == "boom"));
    }

    #[test]
    fn test_wait_times_out() {
        let unit: UpdateUnit<u64> = UpdateUnit::for_simple_keys(vec![1], request());
        let err = unit.wait_finished(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CacheError::UpdateTimeout { .. }));
    }

    #[test]
    fn test_cancelled_wait() {
        let unit: UpdateUnit<u64> = UpdateUnit::for_simple_keys(vec![1], request());
        unit.cancel();
        let err = unit.wait_finished(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }
}
