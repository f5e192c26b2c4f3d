//! Error types for buffer pool operations.

use thiserror::Error;

use crate::storage::page::PageId;

/// Result type alias using [`BufcoreError`].
pub type Result<T> = std::result::Result<T, BufcoreError>;

/// Error types for buffer pool operations.
#[derive(Debug, Error)]
pub enum BufcoreError {
    /// The page is not resident in the buffer pool.
    #[error("Page not found: {0} is not resident")]
    NotFound(PageId),

    /// A latch could not be acquired within the requested timeout.
    #[error("Latch timeout: latch not acquired in time")]
    Timeout,

    /// A latch upgrade would have to wait on the caller itself.
    #[error("Latch already in use: upgrade to exclusive would block")]
    AlreadyInUse,

    /// The clock scan found no replacement frame within its probe budget.
    #[error("Resource exhausted: no replacement frame after {probes} probes")]
    ResourceExhausted { probes: usize },

    /// The cuckoo index could not place (or lost track of) an entry.
    #[error("Index integrity failure for {page} after {attempts} relocation attempts")]
    IndexIntegrityFailure { page: PageId, attempts: usize },

    /// The page is still referenced and cannot be removed.
    #[error("Page pinned: {page} has pin count {pin_count}")]
    Pinned { page: PageId, pin_count: i32 },

    /// Invalid pool configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by the page store collaborator.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl BufcoreError {
    /// Returns whether this error must abort the caller's enclosing unit of work.
    ///
    /// Timeouts, misses and pin conflicts are ordinary recoverable outcomes;
    /// scan exhaustion and index integrity failures cannot succeed on retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BufcoreError::ResourceExhausted { .. } | BufcoreError::IndexIntegrityFailure { .. }
        )
    }
}
