//! Storage module for page caching.
//!
//! This module provides the storage layer for bufcore, including:
//! - Buffer pool management ([`buffer_pool`])
//! - Frame latches ([`latch`])
//! - Page identities and page I/O ([`page`])

pub mod buffer_pool;
pub mod latch;
pub mod page;

// Re-export commonly used types
pub use buffer_pool::{
    BlockState, BufferCore, BufferPool, BufferPoolStats, FrameId, IndexStats, LatchHolds,
    PageHandle, PoolSnapshot,
};
pub use latch::{Latch, LatchMode, Timeout};
pub use page::{DiskManager, Lsn, MemoryStore, PageId, PageStore, PAGE_SIZE};
