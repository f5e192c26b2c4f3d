//! Lock-free stack of unused control blocks.
//!
//! Links live in each block's `free_link`, so the stack holds indices rather
//! than pointers. The head packs a generation tag with the top index; the tag
//! changes on every successful update, which keeps a pop from succeeding
//! against a head that was popped and pushed back in between (ABA).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::control_block::{ControlBlock, NIL};

/// Treiber stack of free frame indices.
#[derive(Debug)]
pub struct FreeList {
    head: AtomicU64,
    count: AtomicUsize,
}

fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl FreeList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL)),
            count: AtomicUsize::new(0),
        }
    }

    /// Creates a list holding every block, frame 0 on top.
    #[must_use]
    pub fn with_all(blocks: &[ControlBlock]) -> Self {
        let list = Self::new();
        for block in blocks.iter().rev() {
            list.push(blocks, block.index());
        }
        list
    }

    /// Pushes frame `index`.
    pub fn push(&self, blocks: &[ControlBlock], index: usize) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            blocks[index].set_free_link(top);
            let new = pack(tag.wrapping_add(1), index as u32);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(seen) => head = seen,
            }
        }
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Pops a frame index, if any.
    pub fn pop(&self, blocks: &[ControlBlock]) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, top) = unpack(head);
            if top == NIL {
                return None;
            }
            let next = blocks[top as usize].free_link();
            let new = pack(tag.wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    blocks[top as usize].set_free_link(NIL);
                    let _ = self
                        .count
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                    return Some(top as usize);
                }
                Err(seen) => head = seen,
            }
        }
    }

    /// Approximate number of blocks on the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true if the list looks empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == NIL
    }

    /// Snapshot of the listed indices, top first. Not linearizable under
    /// concurrent updates.
    #[must_use]
    pub fn members(&self, blocks: &[ControlBlock]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = unpack(self.head.load(Ordering::Acquire)).1;
        while cur != NIL && out.len() <= blocks.len() {
            out.push(cur as usize);
            cur = blocks[cur as usize].free_link();
        }
        out
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn blocks(n: usize) -> Vec<ControlBlock> {
        (0..n).map(ControlBlock::new).collect()
    }

    #[test]
    fn test_with_all_pops_in_frame_order() {
        let blocks = blocks(4);
        let list = FreeList::with_all(&blocks);
        assert_eq!(list.len(), 4);
        assert_eq!(list.members(&blocks), vec![0, 1, 2, 3]);
        for expected in 0..4 {
            assert_eq!(list.pop(&blocks), Some(expected));
        }
        assert!(list.pop(&blocks).is_none());
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_push_pop_lifo() {
        let blocks = blocks(3);
        let list = FreeList::new();
        list.push(&blocks, 2);
        list.push(&blocks, 0);
        assert_eq!(list.pop(&blocks), Some(0));
        assert_eq!(list.pop(&blocks), Some(2));
        assert_eq!(list.pop(&blocks), None);
    }

    #[test]
    fn test_concurrent_push_pop_never_duplicates() {
        let blocks = Arc::new(blocks(64));
        let list = Arc::new(FreeList::with_all(&blocks));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let blocks = Arc::clone(&blocks);
                let list = Arc::clone(&list);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(idx) = list.pop(&blocks) {
                            list.push(&blocks, idx);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = HashSet::new();
        while let Some(idx) = list.pop(&blocks) {
            assert!(seen.insert(idx), "frame {idx} popped twice");
        }
        assert_eq!(seen.len(), 64);
    }
}
