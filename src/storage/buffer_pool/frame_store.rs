//! Fixed array of page-sized frame buffers.

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::page::PAGE_SIZE;

/// The page buffers, allocated once and addressed by frame index.
///
/// Each buffer sits behind its own `RwLock` so frame bytes can be borrowed
/// safely; the frame latch, not this lock, is what callers coordinate on.
pub struct FrameStore {
    frames: Box<[RwLock<Box<[u8]>>]>,
}

impl FrameStore {
    /// Allocates `num_frames` zeroed frames.
    #[must_use]
    pub fn new(num_frames: usize) -> Self {
        let frames = (0..num_frames)
            .map(|_| RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()))
            .collect();
        Self { frames }
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if there are no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Borrows a frame's bytes for reading.
    #[must_use]
    pub fn read(&self, frame: usize) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.frames[frame].read(), |data| &**data)
    }

    /// Borrows a frame's bytes for writing.
    #[must_use]
    pub fn write(&self, frame: usize) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.frames[frame].write(), |data| &mut **data)
    }
}
