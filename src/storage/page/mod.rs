//! Page-level storage primitives.
//!
//! This module defines the page abstractions the buffer pool caches:
//! - `PageId`: Unique identifier for a page
//! - `Lsn`: Recovery log position attached to a cached page
//! - `PageStore`: The I/O collaborator that reads and writes page bytes
//! - `MemoryStore` / `DiskManager`: In-memory and file-backed stores

mod disk_manager;
mod page_id;

pub use disk_manager::DiskManager;
pub use page_id::PageId;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{BufcoreError, Result};

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Position in the write-ahead log. `Lsn::NULL` means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The null log position.
    pub const NULL: Lsn = Lsn(0);

    /// Returns true unless this is [`Lsn::NULL`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Reads and writes the bytes of a page on durable storage.
///
/// The buffer pool never interprets page contents; it hands a frame's buffer
/// to the store together with the identity being read or written.
pub trait PageStore: Send + Sync {
    /// Fills `buf` with the contents of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::Storage`] if the page cannot be read.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` as the new contents of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BufcoreError::Storage`] if the page cannot be written.
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;
}

/// In-memory page store.
///
/// Pages that were never written read back zero-filled with their packed
/// identity stamped in the first eight bytes (see [`MemoryStore::stamp`]).
#[derive(Debug, Default)]
pub struct MemoryStore {
    pages: Mutex<HashMap<PageId, Box<[u8]>>>,
    failing: Mutex<HashSet<PageId>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stamp an unwritten page carries in its first eight bytes.
    #[must_use]
    pub fn stamp(id: PageId) -> [u8; 8] {
        id.to_bits().to_le_bytes()
    }

    /// Makes every subsequent read and write of `id` fail.
    pub fn fail_page(&self, id: PageId) {
        self.failing.lock().insert(id);
    }

    /// Undoes [`MemoryStore::fail_page`].
    pub fn heal_page(&self, id: PageId) {
        self.failing.lock().remove(&id);
    }

    /// Number of completed reads.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed writes.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns a copy of the stored contents of `id`, if it was ever written.
    #[must_use]
    pub fn contents(&self, id: PageId) -> Option<Vec<u8>> {
        self.pages.lock().get(&id).map(|data| data.to_vec())
    }

    fn check(&self, id: PageId, op: &str) -> Result<()> {
        if self.failing.lock().contains(&id) {
            return Err(BufcoreError::Storage(format!("Injected {op} failure for {id}")));
        }
        Ok(())
    }
}

impl PageStore for MemoryStore {
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.check(id, "read")?;
        match self.pages.lock().get(&id) {
            Some(data) => buf.copy_from_slice(data),
            None => {
                buf.fill(0);
                buf[..8].copy_from_slice(&Self::stamp(id));
            }
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        self.check(id, "write")?;
        self.pages.lock().insert(id, buf.into());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_validity() {
        assert!(!Lsn::NULL.is_valid());
        assert!(Lsn(17).is_valid());
        assert!(Lsn(3) < Lsn(4));
    }

    #[test]
    fn test_memory_store_unwritten_page_is_stamped() {
        let store = MemoryStore::new();
        let id = PageId::new(1, 5);
        let mut buf = vec![0xAB; PAGE_SIZE];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(&buf[..8], &MemoryStore::stamp(id));
        assert!(buf[8..].iter().all(|&b| b == 0));
        assert_eq!(store.reads(), 1);
    }

    #[test]
    fn test_memory_store_read_write() {
        let store = MemoryStore::new();
        let id = PageId::main(3);
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 42;
        store.write_page(id, &page).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        store.read_page(id, &mut buf).unwrap();
        assert_eq!(buf[0], 42);
        assert_eq!(store.writes(), 1);
        assert_eq!(store.contents(id).unwrap()[0], 42);
    }

    #[test]
    fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        let id = PageId::main(9);
        let mut buf = vec![0u8; PAGE_SIZE];

        store.fail_page(id);
        assert!(matches!(
            store.read_page(id, &mut buf),
            Err(BufcoreError::Storage(_))
        ));
        assert!(store.write_page(id, &buf).is_err());

        store.heal_page(id);
        assert!(store.read_page(id, &mut buf).is_ok());
    }
}
