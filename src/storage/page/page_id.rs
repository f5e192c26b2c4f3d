//! Page identifier type.

/// Unique identifier for a page cached by the buffer pool.
///
/// A page is identified by:
/// - `volume`: Which volume (file) the page belongs to
/// - `page`: The page number within the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    /// Volume identifier.
    pub volume: u32,
    /// Page number within the volume.
    pub page: u32,
}

impl PageId {
    /// Creates a new page ID.
    #[must_use]
    pub const fn new(volume: u32, page: u32) -> Self {
        Self { volume, page }
    }

    /// Creates a page ID on volume 0.
    #[must_use]
    pub const fn main(page: u32) -> Self {
        Self { volume: 0, page }
    }

    /// Returns the byte offset of this page within its volume file.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page as u64) * (super::PAGE_SIZE as u64)
    }

    /// Packs the identity into a single word so it can live in an atomic.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.volume as u64) << 32) | self.page as u64
    }

    /// Inverse of [`PageId::to_bits`].
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            volume: (bits >> 32) as u32,
            page: bits as u32,
        }
    }

    /// Stripe index for tables keyed by `page mod n`.
    #[must_use]
    pub fn stripe(&self, n: usize) -> usize {
        self.page as usize % n
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({}/{})", self.volume, self.page)
    }
}
