//! Transit table: pages on their way out of the pool.
//!
//! When a dirty victim is evicted its identity is listed here until the
//! write-back finishes. Anyone installing that identity again waits on the
//! bucket's condition variable first, so the fresh read can never overtake the
//! outgoing write.

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::storage::page::PageId;

struct TransitBucket {
    pages: Mutex<Vec<PageId>>,
    cleared: Condvar,
}

/// `K` lock + condition buckets keyed by `page mod K`.
pub struct TransitTable {
    buckets: Box<[TransitBucket]>,
    capacity: usize,
}

impl TransitTable {
    /// Creates a table of `buckets` buckets holding up to `capacity` pages each.
    #[must_use]
    pub fn new(buckets: usize, capacity: usize) -> Self {
        let buckets = (0..buckets)
            .map(|_| TransitBucket {
                pages: Mutex::new(Vec::with_capacity(capacity)),
                cleared: Condvar::new(),
            })
            .collect();
        Self { buckets, capacity }
    }

    /// Locks the bucket for `id`.
    pub fn lock(&self, id: PageId) -> TransitGuard<'_> {
        let bucket = &self.buckets[id.stripe(self.buckets.len())];
        TransitGuard {
            bucket,
            pages: bucket.pages.lock(),
            capacity: self.capacity,
        }
    }

    /// Capacity of every bucket.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buckets.
    #[must_use]
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Largest number of pages listed in any one bucket right now.
    #[must_use]
    pub fn max_occupancy(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.pages.lock().len())
            .max()
            .unwrap_or(0)
    }

    /// Total number of pages in transit.
    #[must_use]
    pub fn in_transit(&self) -> usize {
        self.buckets.iter().map(|b| b.pages.lock().len()).sum()
    }
}

/// A held transit bucket.
pub struct TransitGuard<'a> {
    bucket: &'a TransitBucket,
    pages: MutexGuard<'a, Vec<PageId>>,
    capacity: usize,
}

impl TransitGuard<'_> {
    /// Waits until `id` is no longer in transit.
    ///
    /// The bucket lock is released while waiting and held again on return;
    /// the condition is re-checked after every wakeup.
    pub fn await_not_in_transit(&mut self, id: PageId) {
        while self.pages.contains(&id) {
            self.bucket.cleared.wait(&mut self.pages);
        }
    }

    /// Returns true if `id` is listed.
    #[must_use]
    pub fn contains(&self, id: PageId) -> bool {
        self.pages.contains(&id)
    }

    /// Returns true if another page may be listed in this bucket.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.pages.len() < self.capacity
    }

    /// Lists `id`. Returns false, listing nothing, if the bucket is full.
    pub fn mark_in_transit(&mut self, id: PageId) -> bool {
        if !self.has_capacity() {
            return false;
        }
        debug_assert!(!self.pages.contains(&id), "{id} already in transit");
        self.pages.push(id);
        true
    }

    /// Unlists `id` and wakes all waiters. Returns true if it was listed.
    pub fn clear_in_transit(&mut self, id: PageId) -> bool {
        let before = self.pages.len();
        self.pages.retain(|&p| p != id);
        let removed = self.pages.len() != before;
        if removed {
            self.bucket.cleared.notify_all();
        }
        removed
    }
}
