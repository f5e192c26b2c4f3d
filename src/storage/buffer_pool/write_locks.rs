//! Striped page write locks.
//!
//! Whoever writes a page's bytes back to storage holds the stripe for that
//! page. Eviction and `remove` take the same stripe (non-blocking while they
//! hold other locks) so a page is never reused mid-write.

use parking_lot::{Mutex, MutexGuard};

use crate::storage::page::PageId;

/// Fixed table of write-serialization mutexes keyed by `page mod n`.
pub struct PageWriteLocks {
    stripes: Box<[Mutex<()>]>,
}

impl PageWriteLocks {
    /// Creates `stripes` locks.
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Blocks until the stripe for `id` is held.
    pub fn lock(&self, id: PageId) -> MutexGuard<'_, ()> {
        self.stripes[id.stripe(self.stripes.len())].lock()
    }

    /// Takes the stripe for `id` if it is free.
    pub fn try_lock(&self, id: PageId) -> Option<MutexGuard<'_, ()>> {
        self.stripes[id.stripe(self.stripes.len())].try_lock()
    }

    /// Number of stripes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    /// Returns true if there are no stripes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_stripe_excludes() {
        let locks = PageWriteLocks::new(64);
        let _held = locks.lock(PageId::main(3));
        assert!(locks.try_lock(PageId::main(3)).is_none());
        assert!(locks.try_lock(PageId::new(9, 67)).is_none());
        assert!(locks.try_lock(PageId::main(4)).is_some());
    }
}
