//! Buffer core: the operations callers use to fix, install and evict pages.
//!
//! A miss goes `find` → `replacement` → (write back the victim if dirty) →
//! `publish_partial` → `grab` → (read the page) → `publish`. Each returned
//! frame carries a pin, and usually a latch, that the caller gives back
//! through `unpin` or `publish`.
//!
//! # Lock order
//!
//! clock hand → transit bucket → hash buckets (ascending) → frame latch →
//! page write lock. Latches and write locks are only *tried* while any
//! earlier lock is held; blocking on them happens with nothing else held.

use std::fmt::Write as _;

use super::control_block::{BlockState, ControlBlock};
use super::eviction::{self, ClockScanner, EvictionRound};
use super::frame_store::FrameStore;
use super::free_list::FreeList;
use super::hash_index::{HashIndex, IndexStats};
use super::transit::TransitTable;
use super::write_locks::PageWriteLocks;
use crate::config::PoolConfig;
use crate::error::{BufcoreError, Result};
use crate::storage::latch::{LatchMode, Timeout};
use crate::storage::page::{Lsn, PageId};

/// Index of a frame and its control block.
pub type FrameId = usize;

/// Pool-wide counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
    /// Frames with a non-zero pin count.
    pub pinned: usize,
    /// Frames on the free list.
    pub free: usize,
    /// Frames in the hash index.
    pub resident: usize,
    /// Resident frames holding unwritten changes.
    pub dirty: usize,
    /// Identities currently in transit out.
    pub in_transit: usize,
}

/// Latches held by the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatchHolds {
    /// Holds on latches held in shared mode.
    pub shared: usize,
    /// Holds on latches held in exclusive mode.
    pub exclusive: usize,
    /// Distinct frames latched.
    pub frames: usize,
}

/// The buffer pool core.
pub struct BufferCore {
    config: PoolConfig,
    blocks: Box<[ControlBlock]>,
    frames: FrameStore,
    index: HashIndex,
    free_list: FreeList,
    transit: TransitTable,
    write_locks: PageWriteLocks,
    scanner: ClockScanner,
}

impl BufferCore {
    /// Allocates every frame and control block; all frames start free.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::Config`] if `config` is invalid.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let blocks: Box<[ControlBlock]> = (0..config.num_frames).map(ControlBlock::new).collect();
        let free_list = FreeList::with_all(&blocks);
        let core = Self {
            frames: FrameStore::new(config.num_frames),
            index: HashIndex::new(&config),
            transit: TransitTable::new(config.transit_buckets, config.transit_capacity),
            write_locks: PageWriteLocks::new(config.write_lock_stripes),
            scanner: ClockScanner::new(config.scan_patience()),
            free_list,
            blocks,
            config,
        };
        tracing::debug!(
            frames = core.config.num_frames,
            buckets = core.index.num_buckets(),
            slots = core.config.slots_per_bucket,
            "buffer core initialized"
        );
        Ok(core)
    }

    /// The configuration the core was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of frames.
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.blocks.len()
    }

    /// Control block of `frame`.
    #[must_use]
    pub fn block(&self, frame: FrameId) -> &ControlBlock {
        &self.blocks[frame]
    }

    /// The frame buffers.
    #[must_use]
    pub fn frames(&self) -> &FrameStore {
        &self.frames
    }

    /// Page write locks shared with whoever writes pages back.
    #[must_use]
    pub fn write_locks(&self) -> &PageWriteLocks {
        &self.write_locks
    }

    /// The transit table.
    #[must_use]
    pub fn transit(&self) -> &TransitTable {
        &self.transit
    }

    /// Hash index statistics.
    #[must_use]
    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    // === Fetch path ===

    /// Finds the resident frame for `id`, pins it and latches it in `mode`.
    ///
    /// `ref_hint` raises the frame's access hint.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::NotFound`] if `id` is not resident, or the
    /// latch error if the latch was not granted; the pin is dropped first.
    pub fn find(&self, id: PageId, mode: LatchMode, timeout: Timeout, ref_hint: u32) -> Result<FrameId> {
        let frame = self
            .index
            .lookup(&self.blocks, id)
            .ok_or(BufcoreError::NotFound(id))?;
        let block = &self.blocks[frame];
        block.raise_ref(ref_hint);
        if let Err(err) = self.latch_frame(frame, mode, timeout) {
            block.unpin();
            return Err(err);
        }
        Ok(frame)
    }

    /// Obtains an unbound frame, exclusively latched and unpinned.
    ///
    /// Free frames are used first. Otherwise a victim is chosen by the clock
    /// scan and evicted; its identity is left in `old_page_id` and, if it is
    /// dirty, listed in transit until [`BufferCore::publish_partial`].
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::ResourceExhausted`] if no victim was found
    /// within the scan budget.
    pub fn replacement(&self) -> Result<FrameId> {
        if let Some(frame) = self.free_list.pop(&self.blocks) {
            let block = &self.blocks[frame];
            block.reset();
            if block.latch().acquire(LatchMode::Exclusive, Timeout::Immediate).is_ok() {
                return Ok(frame);
            }
            tracing::warn!(frame, "latched frame found on free list");
            self.free_list.push(&self.blocks, frame);
        }

        let mut probes = 0;
        loop {
            let proposal = self.scanner.select_victim(&self.blocks, &mut probes, |id| {
                self.transit.lock(id).has_capacity()
            });
            let Some((victim, round)) = proposal else {
                tracing::warn!(probes, "clock scan found no replacement frame");
                return Err(BufcoreError::ResourceExhausted { probes });
            };
            if self.try_evict(victim, round) {
                return Ok(victim);
            }
        }
    }

    /// Validates and commits a proposed victim. Acquires nothing it keeps on
    /// failure.
    fn try_evict(&self, victim: FrameId, round: EvictionRound) -> bool {
        let block = &self.blocks[victim];
        let id = block.page_id();
        let mut transit = self.transit.lock(id);
        let bucket = self.index.lock_bucket(block.hash_bucket());
        if !bucket.contains(victim) || block.page_id() != id || block.latch().is_latched() {
            return false;
        }
        if block.latch().acquire(LatchMode::Exclusive, Timeout::Immediate).is_err() {
            return false;
        }
        let Some(write_guard) = self.write_locks.try_lock(id) else {
            block.latch().release();
            return false;
        };

        let dirty = block.is_dirty();
        if !eviction::eligible(block, round)
            || (dirty && !transit.has_capacity())
            || !self.index.remove(&bucket, &self.blocks, victim)
        {
            drop(write_guard);
            block.latch().release();
            return false;
        }
        block.set_old_page_id(id);
        if dirty {
            transit.mark_in_transit(id);
        }
        tracing::debug!(frame = victim, page = %id, dirty, ?round, "evicted page");
        true
    }

    /// Installs `candidate` (from [`BufferCore::replacement`]) as `id`, unless
    /// `id` is already resident.
    ///
    /// Returns `(frame, found)`. If `found`, the candidate went back to the
    /// free list and `frame` is the existing page, pinned and latched in
    /// `mode`. Otherwise `frame` is the candidate, now resident, pinned and
    /// still exclusively latched; the caller reads the page and then calls
    /// [`BufferCore::publish`].
    ///
    /// # Errors
    ///
    /// Returns the latch error if the existing page could not be latched, or
    /// [`BufcoreError::IndexIntegrityFailure`] if the index had no room. The
    /// candidate is released in both cases.
    pub fn grab(
        &self,
        candidate: FrameId,
        id: PageId,
        mode: LatchMode,
        timeout: Timeout,
    ) -> Result<(FrameId, bool)> {
        let cand = &self.blocks[candidate];
        debug_assert!(cand.latch().is_mine() && !cand.is_resident());
        if cand.old_page_id().is_some() {
            debug_assert!(false, "grab of frame {candidate} before publish_partial");
            tracing::warn!(frame = candidate, "grab before publish_partial; finishing handoff");
            self.publish_partial(candidate);
        }
        cand.pin();

        let mut transit = self.transit.lock(id);
        transit.await_not_in_transit(id);

        if let Some(frame) = self
            .index
            .lookup_locked(&self.blocks, id, self.config.grab_probe_attempts)
        {
            drop(transit);
            cand.unpin();
            self.discard_unbound(candidate);
            if let Err(err) = self.latch_frame(frame, mode, timeout) {
                self.blocks[frame].unpin();
                return Err(err);
            }
            return Ok((frame, true));
        }

        cand.set_page_id(id);
        if let Err(err) = self.index.insert(&self.blocks, candidate) {
            drop(transit);
            cand.unpin();
            self.discard_unbound(candidate);
            return Err(err);
        }
        Ok((candidate, false))
    }

    /// Finishes a fetch started by a `grab` miss.
    ///
    /// If `failed`, releases the latch and the pin; the page stays in the
    /// index and the caller must treat it as unread. Otherwise the exclusive
    /// latch is turned into `mode`.
    pub fn publish(&self, frame: FrameId, mode: LatchMode, failed: bool) {
        let block = &self.blocks[frame];
        if failed {
            block.latch().release();
            block.unpin();
            return;
        }
        match mode {
            LatchMode::Exclusive => {}
            LatchMode::Shared => block.latch().downgrade(),
            LatchMode::None => {
                block.latch().release();
            }
        }
    }

    /// Completes the eviction of a victim once its write-back is done or was
    /// not needed. The frame becomes a plain unbound frame.
    pub fn publish_partial(&self, frame: FrameId) {
        let block = &self.blocks[frame];
        let Some(old) = block.old_page_id() else {
            return;
        };
        {
            let mut transit = self.transit.lock(old);
            block.clear_old_page_id();
            transit.clear_in_transit(old);
        }
        self.unlink_write_order(frame);
        block.reset();
    }

    /// Undoes the eviction of a victim whose write-back failed.
    ///
    /// The frame goes back into the index under its old identity, still
    /// dirty and unpinned, and the caller's exclusive latch is released. The
    /// identity stays listed in transit until it is indexed again, so no
    /// other frame can have installed it meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::IndexIntegrityFailure`] if the index had no
    /// room; the frame is then freed and its contents are lost.
    pub fn restore_victim(&self, frame: FrameId) -> Result<()> {
        let block = &self.blocks[frame];
        let Some(old) = block.old_page_id() else {
            debug_assert!(false, "restore of frame {frame} that was never evicted");
            return Ok(());
        };
        let inserted = {
            let mut transit = self.transit.lock(old);
            block.set_page_id(old);
            let inserted = self.index.insert(&self.blocks, frame);
            block.clear_old_page_id();
            transit.clear_in_transit(old);
            inserted
        };
        match inserted {
            Ok(_) => {
                block.latch().release();
                tracing::warn!(frame, page = %old, "write-back failed; evicted page restored");
                Ok(())
            }
            Err(err) => {
                tracing::error!(frame, page = %old, "evicted page could not be restored");
                self.discard_unbound(frame);
                Err(err)
            }
        }
    }

    /// Returns an unbound frame latched by the caller to the free list.
    ///
    /// The caller must hold no pin on it. An optimistic lookup may still hold
    /// a transient pin taken through a stale slot; it drops it as soon as it
    /// sees the frame is not resident.
    pub fn discard_unbound(&self, frame: FrameId) {
        let block = &self.blocks[frame];
        debug_assert!(!block.is_resident());
        self.unlink_write_order(frame);
        block.reset();
        block.latch().release();
        self.free_list.push(&self.blocks, frame);
    }

    // === Pins ===

    /// Adds a pin to a frame the caller expects to hold `id`, then latches it.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::NotFound`] if the frame no longer holds `id`,
    /// or the latch error; no pin is left behind.
    pub fn pin(&self, frame: FrameId, id: PageId, mode: LatchMode, timeout: Timeout) -> Result<()> {
        let block = &self.blocks[frame];
        if block.pin_if_pinned() {
            if !(block.is_resident() && block.page_id() == id) {
                block.unpin();
                return Err(BufcoreError::NotFound(id));
            }
        } else if !self.pin_under_lock(block, id) {
            return Err(BufcoreError::NotFound(id));
        }
        if let Err(err) = self.latch_frame(frame, mode, timeout) {
            block.unpin();
            return Err(err);
        }
        Ok(())
    }

    /// Pins `block` under its bucket lock if it still holds `id`.
    fn pin_under_lock(&self, block: &ControlBlock, id: PageId) -> bool {
        for _ in 0..self.config.grab_probe_attempts {
            let bucket = block.hash_bucket();
            let guard = self.index.lock_bucket(bucket);
            if guard.contains(block.index()) {
                if block.page_id() != id {
                    return false;
                }
                block.pin();
                return true;
            }
            if !block.is_resident() || block.hash_bucket() == bucket {
                return false;
            }
        }
        false
    }

    /// Drops a pin taken by `find`, `grab` or `pin` in a latching mode,
    /// releasing one latch hold if the calling thread has one.
    ///
    /// Pins taken with [`LatchMode::None`] must be dropped with
    /// [`BufferCore::unpin_unlatched`], or they release a hold the caller
    /// took elsewhere.
    pub fn unpin(&self, frame: FrameId, ref_hint: u32) {
        let block = &self.blocks[frame];
        block.raise_ref(ref_hint);
        if block.latch().held_by_me() > 0 {
            block.latch().release();
        }
        block.unpin();
    }

    /// Drops a pin taken with [`LatchMode::None`], leaving the caller's
    /// latch holds alone.
    pub fn unpin_unlatched(&self, frame: FrameId, ref_hint: u32) {
        let block = &self.blocks[frame];
        block.raise_ref(ref_hint);
        block.unpin();
    }

    // === Removal ===

    /// Removes a resident page outright and frees its frame, discarding
    /// unwritten changes.
    ///
    /// Waits out an in-flight write-back of the page.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::NotFound`] if `id` is not resident,
    /// [`BufcoreError::Pinned`] if it is pinned, or [`BufcoreError::Timeout`]
    /// if exclusive access could not be had within the configured patience.
    pub fn remove(&self, id: PageId) -> Result<()> {
        for _ in 0..self.config.remove_patience {
            let transit = self.transit.lock(id);
            let locked = self.index.lock_candidates(id);
            let Some(frame) = locked.find(&self.blocks, id) else {
                return Err(BufcoreError::NotFound(id));
            };
            let block = &self.blocks[frame];
            let pin_count = block.pin_count();
            if pin_count > 0 {
                return Err(BufcoreError::Pinned { page: id, pin_count });
            }
            if block.old_rec_lsn().is_valid() {
                drop(locked);
                drop(transit);
                drop(self.write_locks.lock(id));
                continue;
            }
            if block.latch().is_latched()
                || block.latch().acquire(LatchMode::Exclusive, Timeout::Immediate).is_err()
            {
                drop(locked);
                drop(transit);
                std::thread::yield_now();
                continue;
            }
            let removed = match (self.write_locks.try_lock(id), locked.guard(block.hash_bucket())) {
                (Some(_write_guard), Some(guard)) => self.index.remove(guard, &self.blocks, frame),
                _ => false,
            };
            drop(locked);
            drop(transit);
            if !removed {
                block.latch().release();
                std::thread::yield_now();
                continue;
            }
            self.discard_unbound(frame);
            tracing::debug!(frame, page = %id, "removed page");
            return Ok(());
        }
        Err(BufcoreError::Timeout)
    }

    // === Latches ===

    /// Latches `frame`, marking it hot while the caller waits.
    fn latch_frame(&self, frame: FrameId, mode: LatchMode, timeout: Timeout) -> Result<()> {
        let block = &self.blocks[frame];
        match block.latch().acquire(mode, Timeout::Immediate) {
            Err(BufcoreError::Timeout) if !timeout.is_immediate() => {
                block.enter_hot();
                let result = block.latch().acquire(mode, timeout);
                block.leave_hot();
                result
            }
            result => result,
        }
    }

    /// Upgrades the caller's shared latch on `frame` to exclusive if that
    /// needs no waiting.
    pub fn upgrade_latch_if_not_block(&self, frame: FrameId) -> bool {
        self.blocks[frame].latch().try_upgrade()
    }

    /// Turns the caller's exclusive latch on `frame` into a shared one.
    pub fn downgrade_latch(&self, frame: FrameId) {
        self.blocks[frame].latch().downgrade();
    }

    /// Returns true if the caller holds `frame` exclusively.
    #[must_use]
    pub fn is_mine(&self, frame: FrameId) -> bool {
        self.blocks[frame].latch().is_mine()
    }

    /// Number of holds the caller has on `frame`'s latch.
    #[must_use]
    pub fn latched_by_me(&self, frame: FrameId) -> u32 {
        self.blocks[frame].latch().held_by_me()
    }

    /// Current latch mode of `frame`.
    #[must_use]
    pub fn latch_mode(&self, frame: FrameId) -> LatchMode {
        self.blocks[frame].latch().mode()
    }

    // === Cleaner hooks ===

    /// Marks `frame` dirty, recording `lsn` as its recovery LSN if it has none.
    pub fn mark_dirty(&self, frame: FrameId, lsn: Lsn) {
        let block = &self.blocks[frame];
        block.set_dirty(true);
        if lsn.is_valid() {
            block.set_rec_lsn_if_null(lsn);
        }
    }

    /// Starts writing `frame` back: the recovery LSN moves to the in-flight
    /// slot and the frame is marked clean. Returns the in-flight LSN.
    ///
    /// The caller holds the page's write lock and a latch on the frame.
    pub fn begin_write_back(&self, frame: FrameId) -> Lsn {
        let block = &self.blocks[frame];
        let lsn = block.rec_lsn();
        // Pages dirtied without a log position still need an in-flight marker.
        block.set_old_rec_lsn(if lsn.is_valid() { lsn } else { Lsn(u64::MAX) });
        block.set_rec_lsn(Lsn::NULL);
        block.set_dirty(false);
        lsn
    }

    /// Finishes a write-back started with [`BufferCore::begin_write_back`].
    ///
    /// Frames that had to wait for this one no longer do.
    pub fn end_write_back(&self, frame: FrameId) {
        let block = &self.blocks[frame];
        block.set_old_rec_lsn(Lsn::NULL);
        for dependent in block.take_write_order_back_refs() {
            self.blocks[dependent].remove_write_order_dep(frame);
        }
    }

    /// Records that `frame` must not be written before `must_precede`.
    pub fn add_write_order_dep(&self, frame: FrameId, must_precede: FrameId) {
        if frame == must_precede {
            return;
        }
        self.blocks[frame].add_write_order_dep(must_precede);
        self.blocks[must_precede].add_write_order_back_ref(frame);
    }

    /// Resident dirty frames with their identity and recovery LSN.
    #[must_use]
    pub fn dirty_frames(&self) -> Vec<(FrameId, PageId, Lsn)> {
        self.blocks
            .iter()
            .filter(|b| b.is_resident() && b.is_dirty())
            .map(|b| (b.index(), b.page_id(), b.rec_lsn()))
            .collect()
    }

    fn unlink_write_order(&self, frame: FrameId) {
        let block = &self.blocks[frame];
        for dependent in block.take_write_order_back_refs() {
            self.blocks[dependent].remove_write_order_dep(frame);
        }
        for dep in block.take_write_order_deps() {
            self.blocks[dep].remove_write_order_back_ref(frame);
        }
    }

    // === Introspection ===

    /// Pool-wide counts. Not atomic with respect to concurrent operations.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snap = PoolSnapshot {
            free: self.free_list.len(),
            resident: self.index.len(),
            in_transit: self.transit.in_transit(),
            ..PoolSnapshot::default()
        };
        for block in self.blocks.iter() {
            if block.pin_count() > 0 {
                snap.pinned += 1;
            }
            if block.is_resident() && block.is_dirty() {
                snap.dirty += 1;
            }
        }
        snap
    }

    /// Latches held by the calling thread.
    #[must_use]
    pub fn snapshot_me(&self) -> LatchHolds {
        let mut holds = LatchHolds::default();
        for block in self.blocks.iter() {
            let n = block.latch().held_by_me() as usize;
            if n == 0 {
                continue;
            }
            holds.frames += 1;
            if block.latch().mode() == LatchMode::Exclusive {
                holds.exclusive += n;
            } else {
                holds.shared += n;
            }
        }
        holds
    }

    /// Human-readable table of every frame not on the free list.
    #[must_use]
    pub fn dump(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "buffer core: {} frames, {} resident, {} pinned, {} free, {} dirty, {} in transit, hand at {}",
            self.blocks.len(),
            snap.resident,
            snap.pinned,
            snap.free,
            snap.dirty,
            snap.in_transit,
            self.scanner.hand(),
        );
        let _ = writeln!(
            out,
            "{:>6} {:<15} {:<16} {:>4} {:<3} {:<5} {:>3} {:>3} {:<16}",
            "frame", "state", "page", "pin", "lat", "dirty", "ref", "hot", "old page"
        );
        for block in self.blocks.iter() {
            let state = block.state();
            if state == BlockState::Free && block.pin_count() == 0 {
                continue;
            }
            let page = if state == BlockState::Resident {
                block.page_id().to_string()
            } else {
                "-".to_string()
            };
            let old = block
                .old_page_id()
                .map_or_else(|| "-".to_string(), |p| p.to_string());
            let _ = writeln!(
                out,
                "{:>6} {:<15} {:<16} {:>4} {:<3} {:<5} {:>3} {:>3} {:<16}",
                block.index(),
                state.to_string(),
                page,
                block.pin_count(),
                block.latch().mode().to_string(),
                block.is_dirty(),
                block.ref_count(),
                block.hot_count(),
                old,
            );
        }
        let _ = writeln!(out, "{:?}", self.index.stats());
        out
    }

    /// Checks index placement and free-list consistency.
    ///
    /// Meant for quiescent pools; concurrent operations can produce spurious
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::IndexIntegrityFailure`] on the first violation.
    pub fn audit(&self) -> Result<()> {
        self.index.verify(&self.blocks)?;
        for frame in self.free_list.members(&self.blocks) {
            let block = &self.blocks[frame];
            if block.pin_count() != 0 || block.is_resident() || block.is_dirty() {
                tracing::error!(frame, "free frame is pinned, resident or dirty");
                return Err(BufcoreError::IndexIntegrityFailure {
                    page: block.page_id(),
                    attempts: 0,
                });
            }
        }
        Ok(())
    }
}

impl Drop for BufferCore {
    fn drop(&mut self) {
        let pinned = self.blocks.iter().filter(|b| b.pin_count() > 0).count();
        if pinned > 0 {
            tracing::warn!(pinned, "buffer core dropped with pinned frames");
        }
    }
}
