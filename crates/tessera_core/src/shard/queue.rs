//! Buffer of keys awaiting a durable flush.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
struct QueueInner {
    order: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
}

/// Ordered, de-duplicating queue of dirty keys.
///
/// A key enqueued several times before it is taken appears once; the flush
/// writes whatever value the key holds at that moment. Taking a batch is two
/// phase: keys stay accounted for (in flight) until the flush either commits
/// them or rolls them back to the front of the queue.
#[derive(Debug, Default)]
pub struct PersistenceQueue {
    inner: Mutex<QueueInner>,
}

impl PersistenceQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a key dirty. Returns false if it was already waiting.
    pub fn enqueue(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.queued.contains(key) {
            return false;
        }
        inner.queued.insert(key.to_string());
        inner.order.push_back(key.to_string());
        true
    }

    /// Takes up to `max` keys, oldest first, and marks them in flight.
    pub fn take_batch(&self, max: usize) -> Vec<String> {
        let mut inner = self.inner.lock();
        let n = max.min(inner.order.len());
        let batch: Vec<String> = inner.order.drain(..n).collect();
        for key in &batch {
            inner.queued.remove(key);
            inner.in_flight.insert(key.clone());
        }
        batch
    }

    /// Forgets a batch that was written successfully.
    pub fn commit(&self, batch: &[String]) {
        let mut inner = self.inner.lock();
        for key in batch {
            inner.in_flight.remove(key);
        }
    }

    /// Returns a failed batch to the front of the queue, keeping its order.
    ///
    /// Keys re-enqueued while the batch was in flight keep their newer slot.
    pub fn rollback(&self, batch: Vec<String>) {
        let mut inner = self.inner.lock();
        for key in batch.into_iter().rev() {
            inner.in_flight.remove(&key);
            if inner.queued.insert(key.clone()) {
                inner.order.push_front(key);
            }
        }
    }

    /// Keys waiting or in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.order.len() + inner.in_flight.len()
    }

    /// Returns true if nothing is waiting or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting keys in queue order.
    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.inner.lock().order.iter().cloned().collect()
    }
}
