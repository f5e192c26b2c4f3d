//! Cuckoo hash index mapping page identity to control block.
//!
//! The table has `B` buckets of `S` slots. Each identity has `H` candidate
//! buckets, one per hash function, and a resident block sits in exactly one
//! of them; its `hash_func_id`/`hash_bucket` record which.
//!
//! Readers scan buckets without locks. Writers lock a bucket to change it,
//! and lock two buckets in ascending index order to move an occupant between
//! them. A move inserts at the destination before deleting at the source, but
//! an unlocked scan can still slip past an entry while slots are compacted,
//! so a fast-path miss always falls back to a lookup that locks every
//! candidate bucket at once.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::control_block::{ControlBlock, NIL};
use crate::config::PoolConfig;
use crate::error::{BufcoreError, Result};
use crate::storage::page::PageId;

/// Deepest chain of relocations tried to free a single slot.
const MAX_RELOCATION_DEPTH: usize = 8;

struct Bucket {
    lock: Mutex<()>,
    slots: Box<[AtomicU32]>,
    count: AtomicUsize,
}

impl Bucket {
    fn new(slots: usize) -> Self {
        Self {
            lock: Mutex::new(()),
            slots: (0..slots).map(|_| AtomicU32::new(NIL)).collect(),
            count: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.slots.len())
    }

    fn is_full(&self) -> bool {
        self.len() >= self.slots.len()
    }

    /// Occupants as seen right now; exact only under the bucket lock.
    fn occupants(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots[..self.len()].iter().filter_map(|slot| {
            let idx = slot.load(Ordering::Acquire);
            (idx != NIL).then_some(idx as usize)
        })
    }

    fn contains(&self, idx: usize) -> bool {
        self.occupants().any(|occ| occ == idx)
    }

    /// Appends `idx`. Caller holds the lock.
    fn push(&self, idx: usize) -> bool {
        let n = self.len();
        if n >= self.slots.len() {
            return false;
        }
        self.slots[n].store(idx as u32, Ordering::Release);
        self.count.store(n + 1, Ordering::Release);
        true
    }

    /// Deletes `idx`, moving the last slot into its place. Caller holds the lock.
    fn delete(&self, idx: usize) -> bool {
        let n = self.len();
        let Some(pos) = self.slots[..n]
            .iter()
            .position(|slot| slot.load(Ordering::Acquire) as usize == idx)
        else {
            return false;
        };
        let last = self.slots[n - 1].load(Ordering::Acquire);
        self.slots[pos].store(last, Ordering::Release);
        self.slots[n - 1].store(NIL, Ordering::Release);
        self.count.store(n - 1, Ordering::Release);
        true
    }
}

/// A held bucket lock.
pub struct BucketGuard<'a> {
    index: usize,
    bucket: &'a Bucket,
    _guard: MutexGuard<'a, ()>,
}

impl BucketGuard<'_> {
    /// Index of the locked bucket.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns true if frame `idx` sits in this bucket.
    #[must_use]
    pub fn contains(&self, idx: usize) -> bool {
        self.bucket.contains(idx)
    }
}

/// All candidate buckets of one identity, locked in ascending order.
pub struct LockedBuckets<'a> {
    guards: Vec<BucketGuard<'a>>,
}

impl<'a> LockedBuckets<'a> {
    /// The guard for `bucket`, if it is one of the locked ones.
    #[must_use]
    pub fn guard(&self, bucket: usize) -> Option<&BucketGuard<'a>> {
        self.guards.iter().find(|g| g.index == bucket)
    }

    /// Frame holding `id` in any locked bucket.
    #[must_use]
    pub fn find(&self, blocks: &[ControlBlock], id: PageId) -> Option<usize> {
        self.guards
            .iter()
            .flat_map(|g| g.bucket.occupants())
            .find(|&occ| blocks[occ].page_id() == id)
    }

    /// Bucket indices held, ascending.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        self.guards.iter().map(|g| g.index).collect()
    }
}

/// Index counters.
#[derive(Debug, Default)]
struct Counters {
    lookups: AtomicU64,
    harsh_lookups: AtomicU64,
    inserts: AtomicU64,
    slow_inserts: AtomicU64,
    relocations: AtomicU64,
    collisions: AtomicU64,
    max_depth: AtomicUsize,
}

/// Snapshot of index statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Number of buckets.
    pub buckets: usize,
    /// Slots per bucket.
    pub slots_per_bucket: usize,
    /// Entries currently in the index.
    pub entries: usize,
    /// Lookups performed.
    pub lookups: u64,
    /// Lookups that needed the all-buckets-locked fallback.
    pub harsh_lookups: u64,
    /// Inserts performed.
    pub inserts: u64,
    /// Inserts that found every candidate bucket full.
    pub slow_inserts: u64,
    /// Entries moved to an alternative bucket.
    pub relocations: u64,
    /// Identities whose hash functions share a bucket.
    pub collisions: u64,
    /// Deepest relocation chain used.
    pub max_relocation_depth: usize,
}

/// Lock-striped cuckoo hash table of frame indices.
pub struct HashIndex {
    buckets: Box<[Bucket]>,
    seeds: Box<[u64]>,
    relocation_budget: usize,
    rng: Mutex<StdRng>,
    counters: Counters,
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl HashIndex {
    /// Builds an empty index sized for `config`.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.hash_seed);
        let seeds = (0..config.hash_functions).map(|_| rng.gen::<u64>()).collect();
        let buckets = (0..config.bucket_count())
            .map(|_| Bucket::new(config.slots_per_bucket))
            .collect();
        Self {
            buckets,
            seeds,
            relocation_budget: config.relocation_budget,
            rng: Mutex::new(rng),
            counters: Counters::default(),
        }
    }

    /// Number of buckets.
    #[must_use]
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket chosen for `id` by hash function `func`.
    #[must_use]
    pub fn hash(&self, func: usize, id: PageId) -> usize {
        (mix(self.seeds[func] ^ id.to_bits()) % self.buckets.len() as u64) as usize
    }

    /// Distinct `(func, bucket)` candidates for `id`, in function order.
    fn candidates(&self, id: PageId) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = Vec::with_capacity(self.seeds.len());
        for func in 0..self.seeds.len() {
            let bucket = self.hash(func, id);
            if !out.iter().any(|&(_, b)| b == bucket) {
                out.push((func, bucket));
            }
        }
        out
    }

    /// Locks one bucket.
    pub fn lock_bucket(&self, index: usize) -> BucketGuard<'_> {
        let bucket = &self.buckets[index];
        BucketGuard {
            index,
            bucket,
            _guard: bucket.lock.lock(),
        }
    }

    /// Locks every candidate bucket of `id` in ascending index order.
    pub fn lock_candidates(&self, id: PageId) -> LockedBuckets<'_> {
        let mut indices: Vec<usize> = self.candidates(id).into_iter().map(|(_, b)| b).collect();
        indices.sort_unstable();
        LockedBuckets {
            guards: indices.into_iter().map(|b| self.lock_bucket(b)).collect(),
        }
    }

    /// Finds and pins the block resident under `id`.
    pub fn lookup(&self, blocks: &[ControlBlock], id: PageId) -> Option<usize> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        for (_, b) in self.candidates(id) {
            let bucket = &self.buckets[b];
            for occ in bucket.occupants() {
                let block = &blocks[occ];
                if block.page_id() != id {
                    continue;
                }
                if block.pin_if_pinned() {
                    // Residency first: a block bound after our pin publishes
                    // its new identity before its placement.
                    if block.is_resident() && block.page_id() == id {
                        return Some(occ);
                    }
                    block.unpin();
                    continue;
                }
                let _guard = bucket.lock.lock();
                if bucket.contains(occ) && block.page_id() == id {
                    block.pin();
                    return Some(occ);
                }
            }
        }
        self.lookup_harsh(blocks, id)
    }

    /// Finds and pins `id` locking one candidate bucket at a time.
    ///
    /// A pass that misses is trusted only if no entry was relocated while it
    /// ran; after `attempts` unsettled passes the lookup locks all candidates.
    /// The caller must prevent concurrent inserts of `id`.
    pub fn lookup_locked(&self, blocks: &[ControlBlock], id: PageId, attempts: usize) -> Option<usize> {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let candidates = self.candidates(id);
        for _ in 0..attempts {
            let epoch = self.counters.relocations.load(Ordering::Acquire);
            for &(_, b) in &candidates {
                let bucket = &self.buckets[b];
                let _guard = bucket.lock.lock();
                if let Some(occ) = bucket.occupants().find(|&occ| blocks[occ].page_id() == id) {
                    blocks[occ].pin();
                    return Some(occ);
                }
            }
            if self.counters.relocations.load(Ordering::Acquire) == epoch {
                return None;
            }
        }
        self.lookup_harsh(blocks, id)
    }

    fn lookup_harsh(&self, blocks: &[ControlBlock], id: PageId) -> Option<usize> {
        self.counters.harsh_lookups.fetch_add(1, Ordering::Relaxed);
        let locked = self.lock_candidates(id);
        let found = locked.find(blocks, id);
        if let Some(idx) = found {
            tracing::trace!(page = %id, frame = idx, "found by locked lookup");
            blocks[idx].pin();
        }
        found
    }

    /// Inserts frame `idx` under its current page identity.
    ///
    /// The identity must not already be present. Returns the last entry that
    /// had to be relocated to make room, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::IndexIntegrityFailure`] if no slot could be
    /// freed within the relocation budget.
    pub fn insert(&self, blocks: &[ControlBlock], idx: usize) -> Result<Option<usize>> {
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        let id = blocks[idx].page_id();
        let candidates = self.candidates(id);
        if candidates.len() < self.seeds.len() {
            self.counters.collisions.fetch_add(1, Ordering::Relaxed);
        }
        let targets: Vec<usize> = candidates.iter().map(|&(_, b)| b).collect();
        let mut budget = self.relocation_budget;
        let mut moved = None;
        let mut slow = false;

        loop {
            for &(func, b) in &candidates {
                let bucket = &self.buckets[b];
                let _guard = bucket.lock.lock();
                if bucket.push(idx) {
                    blocks[idx].set_placement(func, b);
                    return Ok(moved);
                }
            }
            if !slow {
                slow = true;
                self.counters.slow_inserts.fetch_add(1, Ordering::Relaxed);
            }
            match self.make_room(blocks, &targets, &mut budget, 0) {
                Some(occ) => moved = Some(occ),
                None => {
                    let attempts = self.relocation_budget - budget;
                    tracing::error!(page = %id, attempts, "cuckoo index could not place page");
                    return Err(BufcoreError::IndexIntegrityFailure { page: id, attempts });
                }
            }
        }
    }

    /// Frees a slot in one of `targets` by relocating an occupant, recursing
    /// through alternative buckets. Returns the relocated frame.
    fn make_room(
        &self,
        blocks: &[ControlBlock],
        targets: &[usize],
        budget: &mut usize,
        depth: usize,
    ) -> Option<usize> {
        self.counters.max_depth.fetch_max(depth, Ordering::Relaxed);

        let mut moves = Vec::new();
        for &src in targets {
            for occ in self.buckets[src].occupants() {
                for (func, dst) in self.candidates(blocks[occ].page_id()) {
                    if dst != src {
                        moves.push((occ, src, func, dst));
                    }
                }
            }
        }

        for &(occ, src, func, dst) in &moves {
            if self.buckets[dst].is_full() {
                continue;
            }
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
            if self.relocate(blocks, occ, src, dst, func) {
                return Some(occ);
            }
        }

        if depth + 1 >= MAX_RELOCATION_DEPTH {
            return None;
        }
        moves.shuffle(&mut *self.rng.lock());
        for (occ, src, func, dst) in moves {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
            if self.make_room(blocks, &[dst], budget, depth + 1).is_some()
                && self.relocate(blocks, occ, src, dst, func)
            {
                return Some(occ);
            }
        }
        None
    }

    /// Moves `occ` from `src` to `dst` (its bucket under `func`).
    ///
    /// Locks both buckets in index order and re-checks everything the
    /// unlocked probe saw before moving.
    fn relocate(
        &self,
        blocks: &[ControlBlock],
        occ: usize,
        src: usize,
        dst: usize,
        func: usize,
    ) -> bool {
        let (low, high) = if src < dst { (src, dst) } else { (dst, src) };
        let _low = self.buckets[low].lock.lock();
        let _high = self.buckets[high].lock.lock();

        let block = &blocks[occ];
        if !block.is_resident()
            || block.hash_bucket() != src
            || !self.buckets[src].contains(occ)
            || self.hash(func, block.page_id()) != dst
            || !self.buckets[dst].push(occ)
        {
            return false;
        }
        block.set_placement(func, dst);
        self.buckets[src].delete(occ);
        self.counters.relocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(frame = occ, from = src, to = dst, "relocated index entry");
        true
    }

    /// Removes frame `idx` from the bucket held by `guard`.
    ///
    /// Returns false if the block is pinned or no longer in that bucket.
    pub fn remove(&self, guard: &BucketGuard<'_>, blocks: &[ControlBlock], idx: usize) -> bool {
        let block = &blocks[idx];
        if !block.is_resident() || block.hash_bucket() != guard.index || block.pin_count() != 0 {
            return false;
        }
        if !guard.bucket.delete(idx) {
            return false;
        }
        block.clear_placement();
        true
    }

    /// Number of entries, summed without locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Returns true if the index holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let c = &self.counters;
        IndexStats {
            buckets: self.buckets.len(),
            slots_per_bucket: self.buckets.first().map_or(0, |b| b.slots.len()),
            entries: self.len(),
            lookups: c.lookups.load(Ordering::Relaxed),
            harsh_lookups: c.harsh_lookups.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            slow_inserts: c.slow_inserts.load(Ordering::Relaxed),
            relocations: c.relocations.load(Ordering::Relaxed),
            collisions: c.collisions.load(Ordering::Relaxed),
            max_relocation_depth: c.max_depth.load(Ordering::Relaxed),
        }
    }

    /// Checks placement consistency with every bucket locked.
    ///
    /// Every entry must record its bucket, hash there under its recorded
    /// function, and appear once; every resident block must be an entry.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::IndexIntegrityFailure`] naming the first bad page.
    pub fn verify(&self, blocks: &[ControlBlock]) -> Result<()> {
        let guards: Vec<BucketGuard<'_>> =
            (0..self.buckets.len()).map(|b| self.lock_bucket(b)).collect();
        let fail = |page: PageId, what: &str| -> Result<()> {
            tracing::error!(page = %page, problem = what, "index audit failed");
            Err(BufcoreError::IndexIntegrityFailure { page, attempts: 0 })
        };

        let mut seen_frames = vec![false; blocks.len()];
        let mut seen_pages = std::collections::HashSet::new();
        for guard in &guards {
            for occ in guard.bucket.occupants() {
                let block = &blocks[occ];
                let page = block.page_id();
                let Some(func) = block.hash_func_id() else {
                    return fail(page, "entry not marked resident");
                };
                if block.hash_bucket() != guard.index || self.hash(func, page) != guard.index {
                    return fail(page, "entry in wrong bucket");
                }
                if std::mem::replace(&mut seen_frames[occ], true) {
                    return fail(page, "frame indexed twice");
                }
                if !seen_pages.insert(page) {
                    return fail(page, "page resident twice");
                }
            }
        }
        for block in blocks {
            if block.is_resident() && !seen_frames[block.index()] {
                return fail(block.page_id(), "resident block missing from index");
            }
        }
        Ok(())
    }
}
