//! Bounded slice cache.
//!
//! Holds slice payloads by id until a consumer has pulled them over the chunk
//! protocol. Total payload bytes never exceed the configured capacity: an
//! insert that does not fit evicts the oldest entries first.
//!
//! Eviction is FIFO by insertion time, not LRU. Lookups never refresh an
//! entry, so a slice that is being pulled can still be evicted by newer ones.
//!
//! One mutex guards insert and evict together. The chunk server reads while
//! the orchestration worker writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;

struct Entry {
    payload: Bytes,
    inserted_at: Instant,
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<i32, Entry>,
    /// Insertion sequence → id. The first key is the oldest entry.
    order: BTreeMap<u64, i32>,
    usage: usize,
    next_seq: u64,
}

impl CacheInner {
    fn remove(&mut self, id: i32) -> Option<Entry> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.seq);
        self.usage -= entry.payload.len();
        Some(entry)
    }

    fn evict_oldest(&mut self) -> Option<(i32, Entry)> {
        let (_, id) = self.order.pop_first()?;
        let entry = self.entries.remove(&id)?;
        self.usage -= entry.payload.len();
        Some((id, entry))
    }
}

/// Result of `SliceCache::insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored. `evicted` lists the ids released to make room, oldest first.
    Stored { evicted: Vec<i32> },
    /// The payload alone exceeds the capacity. Nothing changed.
    Rejected { size: usize, capacity: usize },
}

impl InsertOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, InsertOutcome::Stored { .. })
    }
}

/// Capacity-limited store of slice payloads keyed by id.
pub struct SliceCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl SliceCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity: capacity_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // The guarded state is consistent after every statement, so a
        // panicking holder leaves nothing half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `payload` and store it under `id`.
    ///
    /// An existing entry with the same id is released first; the new payload
    /// counts as a fresh insertion.
    pub fn insert(&self, id: i32, payload: Bytes) -> InsertOutcome {
        let size = payload.len();
        if size > self.capacity {
            tracing::error!(
                slice_id = id,
                size,
                capacity = self.capacity,
                "slice larger than cache capacity, not stored"
            );
            return InsertOutcome::Rejected {
                size,
                capacity: self.capacity,
            };
        }

        let mut inner = self.lock();
        inner.remove(id);

        let mut evicted = Vec::new();
        while inner.usage + size > self.capacity {
            let Some((old_id, old)) = inner.evict_oldest() else {
                break;
            };
            tracing::debug!(
                slice_id = old_id,
                size = old.payload.len(),
                age_ms = old.inserted_at.elapsed().as_millis() as u64,
                "evicted slice"
            );
            evicted.push(old_id);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, id);
        inner.entries.insert(
            id,
            Entry {
                payload,
                inserted_at: Instant::now(),
                seq,
            },
        );
        inner.usage += size;

        InsertOutcome::Stored { evicted }
    }

    /// Pure lookup. Does not affect eviction order.
    pub fn get(&self, id: i32) -> Option<Bytes> {
        self.lock().entries.get(&id).map(|e| e.payload.clone())
    }

    pub fn contains(&self, id: i32) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Release every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.usage = 0;
    }

    /// Sum of the payload sizes currently held.
    pub fn usage_bytes(&self) -> usize {
        self.lock().usage
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
