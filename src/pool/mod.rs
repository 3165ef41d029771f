//! Byte-block pool: allocation, pinning, eviction, swap.
//!
//! This module contains the core pool data structures and algorithms:
//! - [`byte_block`]: ByteBlock buffers and the Block / PinnedBlock handles
//! - [`block_pool`]: the BlockPool broker tying allocation, pinning,
//!   eviction, and swap I/O together
//! - [`lru`]: the O(1) LRU set backing the unpinned-block list
//! - [`pin_count`]: per-worker pin accounting

pub mod block_pool;
pub mod byte_block;
pub mod lru;
pub mod pin_count;

pub use block_pool::{BlockPool, PoolStats};
pub use byte_block::{Block, BlockId, PinError, PinFuture, PinnedBlock};
pub use lru::LruCacheSet;
pub use pin_count::PinCount;
