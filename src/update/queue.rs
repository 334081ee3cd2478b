//! Bounded FIFO of update units served by a worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam::channel::{Receiver, SendTimeoutError, Sender, bounded};
use parking_lot::Mutex;

use crate::config::UpdateQueueConfig;
use crate::error::CacheError;
use crate::key::DictionaryKey;
use crate::update::UpdateUnit;

/// The user-supplied update callback run by workers.
///
/// The callback resolves the unit's keys against the external source and
/// stores the outputs on the unit. Its errors are captured on the unit and
/// never propagate into the worker loop.
pub type UpdateCallback<K> =
    Arc<dyn Fn(&Arc<UpdateUnit<K>>) -> Result<(), CacheError> + Send + Sync>;

/// Bounded producer/consumer coalescing caller threads onto a small worker
/// pool.
///
/// Push is bounded in time by the configured push timeout, waiting for
/// completion by the query wait timeout. `stop_and_wait` closes the queue:
/// remaining units are drained and signalled with [`CacheError::Cancelled`],
/// then the workers exit.
pub struct UpdateQueue<K: DictionaryKey> {
    config: UpdateQueueConfig,
    /// Dropped on stop so that draining workers observe disconnection.
    sender: Mutex<Option<Sender<Arc<UpdateUnit<K>>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl<K: DictionaryKey> UpdateQueue<K> {
    /// Create the queue and spawn its worker pool.
    pub fn new(config: UpdateQueueConfig, callback: UpdateCallback<K>) -> Result<Self, CacheError> {
        config.validate()?;

        let (sender, receiver) = bounded(config.max_update_queue_size);
        let stopped = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.max_threads_for_updates);
        for worker_index in 0..config.max_threads_for_updates {
            let receiver = receiver.clone();
            let stopped = Arc::clone(&stopped);
            let callback = Arc::clone(&callback);
            let handle = thread::Builder::new()
                .name(format!("cachedict-update-{worker_index}"))
                .spawn(move || worker_loop(receiver, stopped, callback))
                .map_err(|e| CacheError::Io(e.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            config,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stopped,
        })
    }

    /// The configuration the queue was built with.
    pub fn config(&self) -> &UpdateQueueConfig {
        &self.config
    }

    /// Hand a unit to the queue, waiting up to the push timeout for a slot.
    ///
    /// On success the unit is owned by the queue until a worker signals it.
    pub fn try_push(&self, unit: Arc<UpdateUnit<K>>) -> Result<(), CacheError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CacheError::Cancelled);
        }
        let Some(sender) = self.sender.lock().clone() else {
            return Err(CacheError::Cancelled);
        };

        unit.mark_enqueued();
        sender
            .send_timeout(unit, self.config.push_timeout)
            .map_err(|error| match error {
                SendTimeoutError::Timeout(_) => CacheError::QueueFull {
                    timeout: self.config.push_timeout,
                },
                SendTimeoutError::Disconnected(_) => CacheError::Cancelled,
            })
    }

    /// Block until the unit is signalled, up to the query wait timeout.
    ///
    /// Resolves with the unit's outcome: `Ok` on completion, the stored
    /// error on failure, [`CacheError::Cancelled`] after a stop, or
    /// [`CacheError::UpdateTimeout`] when the wait elapses.
    pub fn wait_for_finish(&self, unit: &UpdateUnit<K>) -> Result<(), CacheError> {
        unit.wait_finished(self.config.query_wait_timeout)
    }

    /// Close the queue and join the workers. Idempotent.
    pub fn stop_and_wait(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            tracing::debug!("update queue stopping");
        }
        // Dropping the sender disconnects the channel once the workers have
        // drained the remaining units (cancelling each).
        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl<K: DictionaryKey> Drop for UpdateQueue<K> {
    fn drop(&mut self) {
        self.stop_and_wait();
    }
}

fn worker_loop<K: DictionaryKey>(
    receiver: Receiver<Arc<UpdateUnit<K>>>,
    stopped: Arc<AtomicBool>,
    callback: UpdateCallback<K>,
) {
    while let Ok(unit) = receiver.recv() {
        if stopped.load(Ordering::Acquire) {
            unit.cancel();
            continue;
        }

        unit.mark_in_progress();
        match callback(&unit) {
            Ok(()) => unit.complete(),
            Err(error) => unit.fail(error),
        }
    }
}
