use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// Bounded FIFO of raw payment bodies awaiting another dispatch attempt.
///
/// Entries are kept unparsed and re-parsed on every attempt. A full queue
/// drops new entries instead of blocking the caller.
pub struct RetryQueue {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
    dropped: AtomicU64,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(8192))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns `false` when the entry was dropped because the queue is full
    pub fn enqueue(&self, payload: String) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            drop(entries);
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!("⚠️  Retry queue full ({}), {} payloads dropped so far", self.capacity, dropped);
            }
            return false;
        }
        entries.push_back(payload);
        true
    }

    /// Take up to `max` entries from the head
    pub fn drain_batch(&self, max: usize) -> Vec<String> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
