//! Swap I/O subsystem.
//!
//! - [`block_manager`]: the asynchronous disk gateway; one worker thread,
//!   callback-based completion, sharded swap files

pub mod block_manager;

pub use block_manager::{
    BlockManager, IoStats, ReadCallback, RequestHandle, SwapIoError, SwapSlot, WriteCallback,
};
