//! Per-frame control block.
//!
//! A control block is allocated once per frame and never moves. Its fields are
//! atomics so that the unlocked fast paths of the index and the clock scan can
//! read them; which thread may *change* a field is governed by the locking
//! rules of [`BufferCore`](super::BufferCore):
//! - identity and hash placement change only under the home bucket lock, or
//!   by the owner of an unbound block;
//! - the pin count moves from 0 to 1 only under the home bucket lock.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::storage::latch::Latch;
use crate::storage::page::{Lsn, PageId};

/// `hash_func_id` value for a block that is not in the index.
pub const NOT_RESIDENT: u8 = u8::MAX;

/// Sentinel for "no block" in index links.
pub const NIL: u32 = u32::MAX;

/// Lifecycle state of a control block, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// On the free list (or otherwise unlatched and unbound).
    Free,
    /// Latched by its owner after replacement, not yet in the index.
    LatchedUnbound,
    /// In the hash index under `page_id`.
    Resident,
    /// Evicted from the index; `old_page_id` is still being vacated.
    InTransitOut,
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockState::Free => "free",
            BlockState::LatchedUnbound => "unbound",
            BlockState::Resident => "resident",
            BlockState::InTransitOut => "in-transit-out",
        };
        f.write_str(s)
    }
}

/// Metadata for one frame.
#[derive(Debug)]
pub struct ControlBlock {
    index: usize,
    pin_count: AtomicI32,
    latch: Latch,
    page_id: AtomicU64,
    old_page_id: AtomicU64,
    old_valid: AtomicBool,
    dirty: AtomicBool,
    rec_lsn: AtomicU64,
    old_rec_lsn: AtomicU64,
    ref_count: AtomicU32,
    hot_count: AtomicU32,
    hash_func_id: AtomicU8,
    hash_bucket: AtomicUsize,
    /// Frames that must be written before this one.
    write_order_deps: Mutex<Vec<usize>>,
    /// Frames that depend on this one.
    write_order_back_refs: Mutex<Vec<usize>>,
    free_link: AtomicU32,
}

impl ControlBlock {
    /// Creates the control block for frame `index`.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            pin_count: AtomicI32::new(0),
            latch: Latch::new(),
            page_id: AtomicU64::new(0),
            old_page_id: AtomicU64::new(0),
            old_valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            rec_lsn: AtomicU64::new(0),
            old_rec_lsn: AtomicU64::new(0),
            ref_count: AtomicU32::new(0),
            hot_count: AtomicU32::new(0),
            hash_func_id: AtomicU8::new(NOT_RESIDENT),
            hash_bucket: AtomicUsize::new(0),
            write_order_deps: Mutex::new(Vec::new()),
            write_order_back_refs: Mutex::new(Vec::new()),
            free_link: AtomicU32::new(NIL),
        }
    }

    /// Frame index of this block.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The frame latch.
    #[must_use]
    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    // === Pins ===

    /// Current pin count.
    #[must_use]
    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Unconditionally adds a pin.
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a pin, never going below zero.
    pub fn unpin(&self) {
        let result = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n - 1)
            });
        if result.is_err() {
            debug_assert!(false, "unpin of unpinned frame {}", self.index);
            tracing::warn!(frame = self.index, "unpin of unpinned frame ignored");
        }
    }

    /// Adds a pin only if the block is already pinned.
    ///
    /// Retries until the compare-and-swap lands or the count is observed at
    /// zero. A pinned block cannot change identity, so success lets the
    /// caller trust an unlocked identity match.
    pub fn pin_if_pinned(&self) -> bool {
        let mut current = self.pin_count.load(Ordering::Acquire);
        while current > 0 {
            match self.pin_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
        false
    }

    // === Identity ===

    /// Current page identity. Meaningful only while resident or owned.
    #[must_use]
    pub fn page_id(&self) -> PageId {
        PageId::from_bits(self.page_id.load(Ordering::Acquire))
    }

    /// Sets the page identity.
    pub fn set_page_id(&self, id: PageId) {
        self.page_id.store(id.to_bits(), Ordering::Release);
    }

    /// The identity being vacated, while in transit out.
    #[must_use]
    pub fn old_page_id(&self) -> Option<PageId> {
        self.old_valid
            .load(Ordering::Acquire)
            .then(|| PageId::from_bits(self.old_page_id.load(Ordering::Acquire)))
    }

    /// Records the identity being vacated.
    pub fn set_old_page_id(&self, id: PageId) {
        self.old_page_id.store(id.to_bits(), Ordering::Release);
        self.old_valid.store(true, Ordering::Release);
    }

    /// Forgets the identity being vacated.
    pub fn clear_old_page_id(&self) {
        self.old_valid.store(false, Ordering::Release);
    }

    // === Placement ===

    /// Returns true while the block is in the hash index.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.hash_func_id.load(Ordering::Acquire) != NOT_RESIDENT
    }

    /// Hash function that currently places this block.
    #[must_use]
    pub fn hash_func_id(&self) -> Option<usize> {
        let id = self.hash_func_id.load(Ordering::Acquire);
        (id != NOT_RESIDENT).then_some(id as usize)
    }

    /// Bucket that currently holds this block. Stale unless resident.
    #[must_use]
    pub fn hash_bucket(&self) -> usize {
        self.hash_bucket.load(Ordering::Acquire)
    }

    /// Records the block's placement. Caller holds the bucket lock.
    pub fn set_placement(&self, func: usize, bucket: usize) {
        self.hash_bucket.store(bucket, Ordering::Release);
        self.hash_func_id.store(func as u8, Ordering::Release);
    }

    /// Marks the block as not resident. Caller holds the bucket lock.
    pub fn clear_placement(&self) {
        self.hash_func_id.store(NOT_RESIDENT, Ordering::Release);
    }

    // === Dirty state and log positions ===

    /// Returns true if the frame holds unwritten changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets the dirty flag.
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Recovery LSN of the current dirty state.
    #[must_use]
    pub fn rec_lsn(&self) -> Lsn {
        Lsn(self.rec_lsn.load(Ordering::Acquire))
    }

    /// Sets the recovery LSN.
    pub fn set_rec_lsn(&self, lsn: Lsn) {
        self.rec_lsn.store(lsn.0, Ordering::Release);
    }

    /// Sets the recovery LSN only if none is recorded. Returns true if stored.
    pub fn set_rec_lsn_if_null(&self, lsn: Lsn) -> bool {
        self.rec_lsn
            .compare_exchange(0, lsn.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Recovery LSN of an in-flight write-back. Valid while one is in flight.
    #[must_use]
    pub fn old_rec_lsn(&self) -> Lsn {
        Lsn(self.old_rec_lsn.load(Ordering::Acquire))
    }

    /// Sets the in-flight write-back LSN.
    pub fn set_old_rec_lsn(&self, lsn: Lsn) {
        self.old_rec_lsn.store(lsn.0, Ordering::Release);
    }

    // === Replacement hints ===

    /// Recent-access hint.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Raises the access hint to at least `hint`.
    pub fn raise_ref(&self, hint: u32) {
        self.ref_count.fetch_max(hint, Ordering::Relaxed);
    }

    /// Sets the access hint.
    pub fn set_ref(&self, hint: u32) {
        self.ref_count.store(hint, Ordering::Relaxed);
    }

    /// Lowers the access hint by one, saturating at zero.
    pub fn decay_ref(&self) {
        let _ = self
            .ref_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Number of threads currently waiting on this frame's latch.
    #[must_use]
    pub fn hot_count(&self) -> u32 {
        self.hot_count.load(Ordering::Relaxed)
    }

    /// Notes a waiter.
    pub fn enter_hot(&self) {
        self.hot_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes a waiter.
    pub fn leave_hot(&self) {
        let _ = self
            .hot_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    // === Write ordering ===

    /// Records that `other` must be written before this frame.
    pub fn add_write_order_dep(&self, other: usize) {
        let mut deps = self.write_order_deps.lock();
        if !deps.contains(&other) {
            deps.push(other);
        }
    }

    /// Records that `other` depends on this frame.
    pub fn add_write_order_back_ref(&self, other: usize) {
        let mut refs = self.write_order_back_refs.lock();
        if !refs.contains(&other) {
            refs.push(other);
        }
    }

    /// Returns true if this frame must wait for others to be written.
    #[must_use]
    pub fn has_write_order_deps(&self) -> bool {
        !self.write_order_deps.lock().is_empty()
    }

    /// Frames this one waits on.
    #[must_use]
    pub fn write_order_deps(&self) -> Vec<usize> {
        self.write_order_deps.lock().clone()
    }

    /// Removes `other` from this frame's dependencies.
    pub fn remove_write_order_dep(&self, other: usize) {
        self.write_order_deps.lock().retain(|&i| i != other);
    }

    /// Removes `other` from this frame's back references.
    pub fn remove_write_order_back_ref(&self, other: usize) {
        self.write_order_back_refs.lock().retain(|&i| i != other);
    }

    /// Takes this frame's back references, leaving none.
    pub fn take_write_order_back_refs(&self) -> Vec<usize> {
        std::mem::take(&mut *self.write_order_back_refs.lock())
    }

    /// Takes this frame's dependencies, leaving none.
    pub fn take_write_order_deps(&self) -> Vec<usize> {
        std::mem::take(&mut *self.write_order_deps.lock())
    }

    // === Free list ===

    pub(crate) fn free_link(&self) -> u32 {
        self.free_link.load(Ordering::Acquire)
    }

    pub(crate) fn set_free_link(&self, next: u32) {
        self.free_link.store(next, Ordering::Release);
    }

    // === Lifecycle ===

    /// Derived lifecycle state.
    #[must_use]
    pub fn state(&self) -> BlockState {
        if self.is_resident() {
            BlockState::Resident
        } else if self.old_valid.load(Ordering::Acquire) {
            BlockState::InTransitOut
        } else if self.latch.is_latched() {
            BlockState::LatchedUnbound
        } else {
            BlockState::Free
        }
    }

    /// Resets everything but the latch, the pin count and the free link.
    pub fn reset(&self) {
        self.clear_old_page_id();
        self.set_dirty(false);
        self.set_rec_lsn(Lsn::NULL);
        self.set_old_rec_lsn(Lsn::NULL);
        self.set_ref(0);
        self.hot_count.store(0, Ordering::Relaxed);
        self.write_order_deps.lock().clear();
        self.write_order_back_refs.lock().clear();
    }
}
