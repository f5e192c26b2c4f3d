//! Clock eviction scanner.
//!
//! The scanner owns the clock hand. A scan walks the frames from the hand
//! under the hand's mutex, looking for a resident, unpinned frame acceptable
//! in the current round; each full pass over the frames raises the round and
//! relaxes the rules. Frames passed over have their access hint decayed.
//!
//! The scan only proposes a victim. The caller validates and commits it under
//! finer locks and, if that fails, scans again with the same probe counter, so
//! the total work per replacement stays bounded.

use parking_lot::Mutex;

use super::control_block::ControlBlock;
use crate::storage::page::PageId;

/// How permissive the scan currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictionRound {
    /// Clean frames that are neither recently used nor waited on.
    CleanCold = 1,
    /// As above, dirty frames allowed.
    Cold = 2,
    /// Any frame, except dirty ones with write-order dependencies.
    NoDependencies = 3,
    /// Any frame.
    Any = 4,
}

impl EvictionRound {
    /// Round in force after `probes` probes over `num_frames` frames.
    #[must_use]
    pub fn for_probe(probes: usize, num_frames: usize) -> Self {
        match probes / num_frames.max(1) {
            0 => EvictionRound::CleanCold,
            1 => EvictionRound::Cold,
            2 => EvictionRound::NoDependencies,
            _ => EvictionRound::Any,
        }
    }
}

/// Whether `block` may be evicted in `round`.
///
/// Frames that are not resident, are pinned, or have a write-back in flight
/// are never eligible.
#[must_use]
pub fn eligible(block: &ControlBlock, round: EvictionRound) -> bool {
    if !block.is_resident() || block.pin_count() != 0 || block.old_rec_lsn().is_valid() {
        return false;
    }
    let cold = block.ref_count() == 0 && block.hot_count() == 0;
    match round {
        EvictionRound::CleanCold => cold && !block.is_dirty(),
        EvictionRound::Cold => cold,
        EvictionRound::NoDependencies => !(block.is_dirty() && block.has_write_order_deps()),
        EvictionRound::Any => true,
    }
}

/// The clock hand and its scan.
#[derive(Debug)]
pub struct ClockScanner {
    hand: Mutex<usize>,
    patience: usize,
}

impl ClockScanner {
    /// Creates a scanner giving up after `patience` probes per replacement.
    #[must_use]
    pub fn new(patience: usize) -> Self {
        Self {
            hand: Mutex::new(0),
            patience,
        }
    }

    /// Current hand position.
    #[must_use]
    pub fn hand(&self) -> usize {
        *self.hand.lock()
    }

    /// Probe budget per replacement.
    #[must_use]
    pub fn patience(&self) -> usize {
        self.patience
    }

    /// Proposes a victim, advancing the hand past it.
    ///
    /// `probes` carries the probe count across retries of one replacement.
    /// Dirty candidates are only proposed if `has_transit_room` accepts their
    /// identity. Returns `None` once `probes` reaches the patience.
    pub fn select_victim(
        &self,
        blocks: &[ControlBlock],
        probes: &mut usize,
        has_transit_room: impl Fn(PageId) -> bool,
    ) -> Option<(usize, EvictionRound)> {
        let mut hand = self.hand.lock();
        while *probes < self.patience {
            let i = *hand;
            *hand = (i + 1) % blocks.len();
            let round = EvictionRound::for_probe(*probes, blocks.len());
            *probes += 1;

            let block = &blocks[i];
            if eligible(block, round) && (!block.is_dirty() || has_transit_room(block.page_id())) {
                return Some((i, round));
            }
            block.decay_ref();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::Lsn;

    fn resident_blocks(n: usize) -> Vec<ControlBlock> {
        (0..n)
            .map(|i| {
                let block = ControlBlock::new(i);
                block.set_page_id(PageId::main(i as u32));
                block.set_placement(0, i);
                block
            })
            .collect()
    }

    #[test]
    fn test_round_progression() {
        assert_eq!(EvictionRound::for_probe(0, 4), EvictionRound::CleanCold);
        assert_eq!(EvictionRound::for_probe(5, 4), EvictionRound::Cold);
        assert_eq!(EvictionRound::for_probe(8, 4), EvictionRound::NoDependencies);
        assert_eq!(EvictionRound::for_probe(12, 4), EvictionRound::Any);
        assert_eq!(EvictionRound::for_probe(100, 4), EvictionRound::Any);
    }

    #[test]
    fn test_eligibility_rules() {
        let blocks = resident_blocks(1);
        let block = &blocks[0];
        assert!(eligible(block, EvictionRound::CleanCold));

        block.set_dirty(true);
        assert!(!eligible(block, EvictionRound::CleanCold));
        assert!(eligible(block, EvictionRound::Cold));

        block.add_write_order_dep(3);
        assert!(!eligible(block, EvictionRound::NoDependencies));
        assert!(eligible(block, EvictionRound::Any));

        block.raise_ref(1);
        assert!(!eligible(block, EvictionRound::Cold));

        block.pin();
        assert!(!eligible(block, EvictionRound::Any));
        block.unpin();

        block.set_old_rec_lsn(Lsn(5));
        assert!(!eligible(block, EvictionRound::Any));
    }

    #[test]
    fn test_scan_skips_pinned_and_advances_hand() {
        let blocks = resident_blocks(4);
        blocks[0].pin();
        blocks[1].pin();
        let scanner = ClockScanner::new(16);

        let mut probes = 0;
        let (victim, round) = scanner.select_victim(&blocks, &mut probes, |_| true).unwrap();
        assert_eq!(victim, 2);
        assert_eq!(round, EvictionRound::CleanCold);
        assert_eq!(scanner.hand(), 3);
        assert_eq!(probes, 3);
    }

    #[test]
    fn test_scan_decays_refs_then_relaxes() {
        let blocks = resident_blocks(2);
        blocks[0].raise_ref(1);
        blocks[1].raise_ref(1);
        let scanner = ClockScanner::new(8);

        let mut probes = 0;
        let (victim, round) = scanner.select_victim(&blocks, &mut probes, |_| true).unwrap();
        // First pass only decays the hints.
        assert_eq!(victim, 0);
        assert_eq!(round, EvictionRound::Cold);
        assert_eq!(blocks[1].ref_count(), 0);
    }

    #[test]
    fn test_dirty_needs_transit_room() {
        let blocks = resident_blocks(2);
        blocks[0].set_dirty(true);
        blocks[1].pin();
        let scanner = ClockScanner::new(8);

        let mut probes = 0;
        assert!(scanner.select_victim(&blocks, &mut probes, |_| false).is_none());
        assert_eq!(probes, 8);

        let mut probes = 0;
        let (victim, _) = scanner.select_victim(&blocks, &mut probes, |_| true).unwrap();
        assert_eq!(victim, 0);
    }

    #[test]
    fn test_all_pinned_exhausts() {
        let blocks = resident_blocks(3);
        for block in &blocks {
            block.pin();
        }
        let scanner = ClockScanner::new(12);
        let mut probes = 0;
        assert!(scanner.select_victim(&blocks, &mut probes, |_| true).is_none());
        assert_eq!(probes, 12);
    }
}
