//! bufcore - Buffer pool core for a disk-based storage engine
//!
//! Caches fixed-size pages in latched memory frames, indexes resident pages
//! with a concurrent cuckoo hash table, and reclaims frames with a clock scan
//! that hands dirty victims to the writer without ever exposing two live
//! copies of a page.

pub mod config;
pub mod error;
pub mod storage;

pub use config::PoolConfig;
pub use error::{BufcoreError, Result};
pub use storage::{
    BlockState, BufferCore, BufferPool, BufferPoolStats, DiskManager, FrameId, IndexStats,
    LatchHolds, LatchMode, Lsn, MemoryStore, PageHandle, PageId, PageStore, PoolSnapshot, Timeout,
    PAGE_SIZE,
};
