//! Buffer pool management for page caching.
//!
//! This module implements the buffer pool that caches pages in memory frames.
//! It provides:
//! - [`BufferCore`]: the concurrent core (cuckoo page index, clock eviction,
//!   transit handoff for pages being written out, per-frame latches)
//! - [`BufferPool`]: a fix/unfix layer that drives the core against a
//!   [`PageStore`], with RAII guards ([`PageHandle`]) for page access
//!
//! # Example
//!
//! ```
//! use bufcore::{BufferPool, LatchMode, MemoryStore, PageId, PoolConfig};
//!
//! let pool = BufferPool::new(PoolConfig::new(16), MemoryStore::new()).unwrap();
//! {
//!     let mut handle = pool.fix(PageId::main(1), LatchMode::Exclusive).unwrap();
//!     handle.data_mut()[100] = 42;
//! } // unpinned and unlatched here
//! pool.flush_all().unwrap();
//! ```

mod control_block;
mod core;
mod eviction;
mod frame_store;
mod free_list;
mod hash_index;
mod transit;
mod write_locks;

pub use self::core::{BufferCore, FrameId, LatchHolds, PoolSnapshot};
pub use control_block::{BlockState, ControlBlock};
pub use eviction::{ClockScanner, EvictionRound};
pub use frame_store::FrameStore;
pub use free_list::FreeList;
pub use hash_index::{BucketGuard, HashIndex, IndexStats, LockedBuckets};
pub use transit::{TransitGuard, TransitTable};
pub use write_locks::PageWriteLocks;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard};

use crate::config::PoolConfig;
use crate::error::{BufcoreError, Result};
use crate::storage::latch::{LatchMode, Timeout};
use crate::storage::page::{Lsn, PageId, PageStore};

/// Buffer pool over a page store.
pub struct BufferPool<S: PageStore> {
    core: BufferCore,
    store: S,
    /// Counter for cache hits (page found in buffer pool).
    cache_hits: AtomicU64,
    /// Counter for cache misses (page had to be read from the store).
    cache_misses: AtomicU64,
    /// Counter for number of pages evicted.
    evictions: AtomicU64,
    /// Counter for pages written back to the store.
    write_backs: AtomicU64,
}

impl<S: PageStore> BufferPool<S> {
    /// Creates a buffer pool over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: PoolConfig, store: S) -> Result<Self> {
        Ok(Self {
            core: BufferCore::new(config)?,
            store,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        })
    }

    /// The underlying core.
    #[must_use]
    pub fn core(&self) -> &BufferCore {
        &self.core
    }

    /// The page store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the number of frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.core.num_frames()
    }

    /// Returns the number of pages currently resident.
    #[must_use]
    pub fn size(&self) -> usize {
        self.core.snapshot().resident
    }

    /// Fixes `id` in `mode`, waiting as long as needed for the latch.
    ///
    /// # Errors
    ///
    /// See [`BufferPool::fix_with`].
    pub fn fix(&self, id: PageId, mode: LatchMode) -> Result<PageHandle<'_, S>> {
        self.fix_with(id, mode, Timeout::Forever)
    }

    /// Fixes `id` in `mode`, reading it from the store on a miss.
    ///
    /// The returned handle holds a pin and the latch until dropped.
    ///
    /// # Errors
    ///
    /// Returns the latch error on timeout, [`BufcoreError::ResourceExhausted`]
    /// if no frame could be freed, or the store's error if the page (or an
    /// evicted dirty victim) could not be transferred. A victim whose
    /// write-back failed is put back in the pool, still dirty.
    pub fn fix_with(&self, id: PageId, mode: LatchMode, timeout: Timeout) -> Result<PageHandle<'_, S>> {
        match self.core.find(id, mode, timeout, 1) {
            Ok(frame) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(self.handle(frame, id, mode));
            }
            Err(BufcoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let frame = self.core.replacement()?;
        if let Some(old) = self.core.block(frame).old_page_id() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            if self.core.block(frame).is_dirty() {
                self.write_back_victim(frame, old)?;
            }
        }
        self.core.publish_partial(frame);

        let (frame, found) = self.core.grab(frame, id, mode, timeout)?;
        if found {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(self.handle(frame, id, mode));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let read = {
            let mut data = self.core.frames().write(frame);
            self.store.read_page(id, &mut data)
        };
        match read {
            Ok(()) => {
                self.core.publish(frame, mode, false);
                Ok(self.handle(frame, id, mode))
            }
            Err(err) => {
                self.core.publish(frame, mode, true);
                if let Err(remove_err) = self.core.remove(id) {
                    tracing::warn!(page = %id, error = %remove_err, "unread page left in pool");
                }
                Err(err)
            }
        }
    }

    fn handle(&self, frame: FrameId, page_id: PageId, mode: LatchMode) -> PageHandle<'_, S> {
        PageHandle {
            pool: self,
            frame,
            page_id,
            mode,
        }
    }

    /// Writes an evicted dirty victim to the store.
    fn write_back_victim(&self, frame: FrameId, old: PageId) -> Result<()> {
        let written = {
            let _write_guard = self.core.write_locks().lock(old);
            let data = self.core.frames().read(frame);
            self.store.write_page(old, &data)
        };
        match written {
            Ok(()) => {
                self.write_backs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                tracing::error!(page = %old, frame, error = %err, "write-back of evicted page failed");
                if let Err(restore_err) = self.core.restore_victim(frame) {
                    tracing::error!(page = %old, frame, error = %restore_err, "evicted page lost");
                }
                Err(err)
            }
        }
    }

    /// Writes `id` to the store if it is resident and dirty.
    ///
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the page stays dirty.
    pub fn flush_page(&self, id: PageId) -> Result<bool> {
        let frame = match self.core.find(id, LatchMode::Shared, Timeout::Forever, 0) {
            Ok(frame) => frame,
            Err(BufcoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let result = self.flush_frame(frame, id);
        self.core.unpin(frame, 0);
        result
    }

    fn flush_frame(&self, frame: FrameId, id: PageId) -> Result<bool> {
        if !self.core.block(frame).is_dirty() {
            return Ok(false);
        }
        let _write_guard = self.core.write_locks().lock(id);
        let lsn = self.core.begin_write_back(frame);
        let written = {
            let data = self.core.frames().read(frame);
            self.store.write_page(id, &data)
        };
        if written.is_err() {
            self.core.mark_dirty(frame, lsn);
        } else {
            self.write_backs.fetch_add(1, Ordering::Relaxed);
        }
        self.core.end_write_back(frame);
        written.map(|()| true)
    }

    /// Flushes every dirty page, honouring write-order dependencies where
    /// they are acyclic.
    ///
    /// Returns the number of pages written.
    ///
    /// # Errors
    ///
    /// Returns the first store error.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let dirty = self.core.dirty_frames();
            if dirty.is_empty() {
                return Ok(flushed);
            }
            let ready: Vec<PageId> = dirty
                .iter()
                .filter(|(frame, _, _)| !self.core.block(*frame).has_write_order_deps())
                .map(|&(_, id, _)| id)
                .collect();
            let batch: Vec<PageId> = if ready.is_empty() {
                dirty.iter().map(|&(_, id, _)| id).collect()
            } else {
                ready
            };
            let mut progress = false;
            for id in batch {
                if self.flush_page(id)? {
                    flushed += 1;
                    progress = true;
                }
            }
            if !progress {
                return Ok(flushed);
            }
        }
    }

    /// Drops `id` from the pool without writing it.
    ///
    /// # Errors
    ///
    /// See [`BufferCore::remove`].
    pub fn discard(&self, id: PageId) -> Result<()> {
        self.core.remove(id)
    }

    /// Returns buffer pool statistics.
    #[must_use]
    pub fn stats(&self) -> BufferPoolStats {
        let snap = self.core.snapshot();
        BufferPoolStats {
            capacity: self.capacity(),
            pages_used: snap.resident,
            dirty_pages: snap.dirty,
            pinned_pages: snap.pinned,
            free_frames: snap.free,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }

    /// Resets the cache statistics counters.
    ///
    /// This is useful for benchmarking or monitoring specific workloads.
    pub fn reset_stats(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.write_backs.store(0, Ordering::Relaxed);
    }
}

/// RAII guard for a fixed page.
///
/// Releases the latch and the pin when dropped.
pub struct PageHandle<'a, S: PageStore> {
    pool: &'a BufferPool<S>,
    frame: FrameId,
    page_id: PageId,
    mode: LatchMode,
}

impl<S: PageStore> PageHandle<'_, S> {
    /// Returns the page ID.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the frame holding the page.
    #[must_use]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Returns the latch mode the page was fixed in.
    #[must_use]
    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    /// Returns a read-only view of the page data.
    #[must_use]
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.pool.core.frames().read(self.frame)
    }

    /// Returns a mutable view of the page data and marks the page as dirty.
    ///
    /// The page must be fixed in exclusive mode.
    pub fn data_mut(&mut self) -> MappedRwLockWriteGuard<'_, [u8]> {
        debug_assert_eq!(self.mode, LatchMode::Exclusive);
        self.pool.core.mark_dirty(self.frame, Lsn::NULL);
        self.pool.core.frames().write(self.frame)
    }

    /// Marks the page dirty as of log position `lsn`.
    pub fn mark_dirty(&self, lsn: Lsn) {
        self.pool.core.mark_dirty(self.frame, lsn);
    }
}

impl<S: PageStore> Drop for PageHandle<'_, S> {
    fn drop(&mut self) {
        if self.mode == LatchMode::None {
            self.pool.core.unpin_unlatched(self.frame, 0);
        } else {
            self.pool.core.unpin(self.frame, 0);
        }
    }
}

/// Statistics about the buffer pool state.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Number of frames in the pool.
    pub capacity: usize,
    /// Current number of pages in the pool.
    pub pages_used: usize,
    /// Number of dirty pages.
    pub dirty_pages: usize,
    /// Number of pinned pages.
    pub pinned_pages: usize,
    /// Number of frames on the free list.
    pub free_frames: usize,
    /// Number of cache hits (page found in buffer pool).
    pub cache_hits: u64,
    /// Number of cache misses (page had to be read from the store).
    pub cache_misses: u64,
    /// Number of pages evicted.
    pub evictions: u64,
    /// Number of pages written back to the store.
    pub write_backs: u64,
}

impl BufferPoolStats {
    /// Calculates the cache hit rate as a fraction (0.0 to 1.0).
    ///
    /// Returns `None` if there have been no cache accesses.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            None
        } else {
            Some(self.cache_hits as f64 / total as f64)
        }
    }

    /// Returns the total number of cache accesses (hits + misses).
    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.cache_hits + self.cache_misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{DiskManager, MemoryStore, PAGE_SIZE};
    use tempfile::TempDir;

    fn create_test_pool(capacity: usize) -> BufferPool<MemoryStore> {
        BufferPool::new(PoolConfig::new(capacity), MemoryStore::new()).unwrap()
    }

    #[test]
    fn test_fix_reads_from_store() {
        let pool = create_test_pool(4);
        let id = PageId::new(1, 8);
        let handle = pool.fix(id, LatchMode::Shared).unwrap();
        assert_eq!(handle.page_id(), id);
        assert_eq!(&handle.data()[..8], &MemoryStore::stamp(id));
        drop(handle);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.store().reads(), 1);
    }

    #[test]
    fn test_pin_unpin() {
        let pool = create_test_pool(4);
        let id = PageId::main(2);
        {
            let mut handle = pool.fix(id, LatchMode::Exclusive).unwrap();
            handle.data_mut()[0] = 42;
        }
        let handle = pool.fix(id, LatchMode::Shared).unwrap();
        assert_eq!(handle.data()[0], 42);
        assert_eq!(pool.stats().pinned_pages, 1);
        drop(handle);
        assert_eq!(pool.stats().pinned_pages, 0);
    }

    #[test]
    fn test_flush() {
        let pool = create_test_pool(4);
        let id = PageId::main(3);
        {
            let mut handle = pool.fix(id, LatchMode::Exclusive).unwrap();
            handle.data_mut()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        }
        assert!(pool.flush_page(id).unwrap());
        assert!(!pool.flush_page(id).unwrap());
        assert_eq!(&pool.store().contents(id).unwrap()[0..4], &[1, 2, 3, 4]);
        assert_eq!(pool.stats().dirty_pages, 0);
    }

    #[test]
    fn test_dirty_victim_written_back() {
        let pool = create_test_pool(2);
        for p in 0..2 {
            let mut handle = pool.fix(PageId::main(p), LatchMode::Exclusive).unwrap();
            handle.data_mut()[0] = p as u8 + 10;
        }
        for p in 2..6 {
            let _handle = pool.fix(PageId::main(p), LatchMode::Shared).unwrap();
        }

        let stats = pool.stats();
        assert!(stats.evictions >= 4, "expected evictions, got {}", stats.evictions);
        assert!(stats.write_backs >= 1);
        assert_eq!(pool.store().contents(PageId::main(0)).unwrap()[0], 10);

        for p in 0..2 {
            let handle = pool.fix(PageId::main(p), LatchMode::Shared).unwrap();
            assert_eq!(handle.data()[0], p as u8 + 10);
        }
    }

    #[test]
    fn test_failed_victim_write_back_keeps_changes() {
        let pool = create_test_pool(1);
        let dirty = PageId::main(1);
        {
            let mut handle = pool.fix(dirty, LatchMode::Exclusive).unwrap();
            handle.data_mut()[100] = 77;
        }

        pool.store().fail_page(dirty);
        assert!(matches!(
            pool.fix(PageId::main(2), LatchMode::Shared),
            Err(BufcoreError::Storage(_))
        ));
        let stats = pool.stats();
        assert_eq!(stats.pages_used, 1);
        assert_eq!(stats.dirty_pages, 1);
        assert_eq!(stats.pinned_pages, 0);
        assert_eq!(pool.core().snapshot().in_transit, 0);
        pool.core().audit().unwrap();

        pool.store().heal_page(dirty);
        {
            let handle = pool.fix(dirty, LatchMode::Shared).unwrap();
            assert_eq!(handle.data()[100], 77);
        }

        // The next eviction writes the restored page out.
        drop(pool.fix(PageId::main(2), LatchMode::Shared).unwrap());
        assert_eq!(pool.store().contents(dirty).unwrap()[100], 77);
    }

    #[test]
    fn test_read_failure_leaves_nothing_pinned() {
        let pool = create_test_pool(4);
        let id = PageId::main(6);
        pool.store().fail_page(id);
        assert!(matches!(
            pool.fix(id, LatchMode::Shared),
            Err(BufcoreError::Storage(_))
        ));
        let stats = pool.stats();
        assert_eq!(stats.pinned_pages, 0);
        assert_eq!(stats.pages_used, 0);

        pool.store().heal_page(id);
        assert!(pool.fix(id, LatchMode::Shared).is_ok());
    }

    #[test]
    fn test_cache_hit_miss_tracking() {
        let pool = create_test_pool(4);
        let stats = pool.stats();
        assert_eq!(stats.cache_hits, 0);
        assert!(stats.hit_rate().is_none());

        drop(pool.fix(PageId::main(1), LatchMode::Shared).unwrap());
        drop(pool.fix(PageId::main(1), LatchMode::Shared).unwrap());

        let stats = pool.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.hit_rate(), Some(0.5));

        pool.reset_stats();
        assert_eq!(pool.stats().total_accesses(), 0);
    }

    #[test]
    fn test_discard_drops_changes() {
        let pool = create_test_pool(4);
        let id = PageId::main(4);
        {
            let mut handle = pool.fix(id, LatchMode::Exclusive).unwrap();
            handle.data_mut()[10] = 1;
        }
        pool.discard(id).unwrap();
        assert_eq!(pool.size(), 0);
        assert!(pool.store().contents(id).is_none());
    }

    #[test]
    fn test_flush_all_honours_write_order() {
        let pool = create_test_pool(4);
        let (a, b) = (PageId::main(1), PageId::main(2));
        let frame_a = {
            let mut h = pool.fix(a, LatchMode::Exclusive).unwrap();
            h.data_mut()[0] = 1;
            h.frame()
        };
        let frame_b = {
            let mut h = pool.fix(b, LatchMode::Exclusive).unwrap();
            h.data_mut()[0] = 2;
            h.frame()
        };
        pool.core().add_write_order_dep(frame_a, frame_b);

        assert_eq!(pool.flush_all().unwrap(), 2);
        assert_eq!(pool.stats().dirty_pages, 0);
        assert!(!pool.core().block(frame_a).has_write_order_deps());
    }

    #[test]
    fn test_pool_over_disk_manager() {
        let temp_dir = TempDir::new().unwrap();
        let id = PageId::new(2, 5);
        {
            let dm = DiskManager::new(temp_dir.path()).unwrap();
            let pool = BufferPool::new(PoolConfig::new(2), dm).unwrap();
            let mut handle = pool.fix(id, LatchMode::Exclusive).unwrap();
            handle.data_mut()[..4].copy_from_slice(&[9, 8, 7, 6]);
            handle.mark_dirty(Lsn(3));
            drop(handle);
            assert_eq!(pool.flush_all().unwrap(), 1);
        }
        let dm = DiskManager::new(temp_dir.path()).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        dm.read_page(id, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_hit_rate_calculation() {
        let stats = BufferPoolStats {
            capacity: 10,
            pages_used: 5,
            dirty_pages: 1,
            pinned_pages: 2,
            free_frames: 5,
            cache_hits: 80,
            cache_misses: 20,
            evictions: 5,
            write_backs: 1,
        };
        assert_eq!(stats.hit_rate(), Some(0.8));
        assert_eq!(stats.total_accesses(), 100);
    }
}
