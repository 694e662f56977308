//! Bounded outgoing queue.
//!
//! Written by any caller thread, drained only by the owning worker loop.
//! A full queue makes `offer` wait up to its bound and then drop the item
//! with a warning. Callers are never blocked indefinitely and the queue
//! never grows past its capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

pub struct OutgoingQueue<T> {
    name: &'static str,
    capacity: usize,
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: AtomicU64,
}

impl<T> OutgoingQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            name,
            capacity,
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item`, waiting at most `wait` for room.
    /// Returns false if the item was dropped.
    pub fn offer(&self, item: T, wait: Duration) -> bool {
        match self.tx.send_timeout(item, wait) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    queue = self.name,
                    capacity = self.capacity,
                    wait_ms = wait.as_millis() as u64,
                    dropped,
                    "outgoing queue full, message dropped"
                );
                false
            }
            // Both ends live in self.
            Err(SendTimeoutError::Disconnected(_)) => false,
        }
    }

    /// Take the oldest item without blocking.
    pub fn poll(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items dropped by `offer` since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
