//! Block identity, buffers, and pin handles.
//!
//! A [`ByteBlock`] is the unit of pool-managed memory: a fixed-size byte
//! buffer that is either RAM-resident or swapped out to disk. Callers never
//! touch a `ByteBlock` directly; they hold a [`Block`] (a residence-agnostic
//! logical reference) or a [`PinnedBlock`] (a reference that additionally
//! holds one pin, guaranteeing RAM residence).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::oneshot;

use super::block_pool::BlockPool;

/// Unique identifier for a byte block.
pub type BlockId = u64;

/// Global monotonic block ID counter.
static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a new unique block ID.
fn new_block_id() -> BlockId {
    NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors surfaced through a [`PinFuture`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PinError {
    /// The swap read for this block failed.
    #[error("swap read failed for block {0}")]
    ReadFailed(BlockId),

    /// The pool shut down before the pin resolved.
    #[error("block pool shut down before the pin resolved")]
    PoolShutDown,
}

/// A fixed-size byte buffer managed by the pool.
///
/// The buffer itself lives behind an `RwLock` so the swap gateway can
/// snapshot it without the pool mutex, and is `None` while the block is
/// swapped out. Residence and pin bookkeeping live in the pool, guarded by
/// the pool mutex.
pub struct ByteBlock {
    id: BlockId,
    size: usize,
    data: RwLock<Option<Box<[u8]>>>,
    /// Whether the on-disk copy (if any) still matches the buffer. Set when
    /// a swap write lands, cleared on mutable access, so re-evicting an
    /// unmodified block can skip the write.
    disk_copy_valid: AtomicBool,
}

impl ByteBlock {
    /// Create a zero-filled RAM-resident block of exactly `size` bytes.
    pub(crate) fn new(size: usize) -> Self {
        Self {
            id: new_block_id(),
            size,
            data: RwLock::new(Some(vec![0u8; size].into_boxed_slice())),
            disk_copy_valid: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Install a freshly swapped-in buffer.
    pub(crate) fn install(&self, bytes: Vec<u8>) {
        debug_assert_eq!(bytes.len(), self.size, "swapped-in buffer has the wrong size");
        *self.data.write() = Some(bytes.into_boxed_slice());
    }

    /// Drop the RAM buffer after a swap-out.
    pub(crate) fn release_data(&self) {
        *self.data.write() = None;
    }

    pub(crate) fn disk_copy_valid(&self) -> bool {
        self.disk_copy_valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_disk_copy(&self) {
        self.disk_copy_valid.store(false, Ordering::Release);
    }

    /// Write the current buffer to `path`, marking the disk copy valid.
    ///
    /// Runs on the swap gateway's I/O thread. The read guard is held across
    /// the write so a mutation cannot interleave: either it happens before
    /// the snapshot (and is captured), or after (and clears the valid bit).
    pub(crate) fn write_snapshot_to(&self, path: &std::path::Path) -> std::io::Result<u64> {
        let guard = self.data.read();
        let bytes = guard
            .as_deref()
            .expect("swap write requires a RAM-resident buffer");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        self.disk_copy_valid.store(true, Ordering::Release);
        Ok(bytes.len() as u64)
    }

    fn read_data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |d| {
            d.as_deref()
                .expect("pinned block must be RAM-resident")
        })
    }

    fn write_data(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let guard = self.data.write();
        // the disk copy (if any) no longer matches once the caller can write
        self.disk_copy_valid.store(false, Ordering::Release);
        RwLockWriteGuard::map(guard, |d| {
            d.as_deref_mut()
                .expect("pinned block must be RAM-resident")
        })
    }
}

impl std::fmt::Debug for ByteBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBlock")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("resident", &self.data.read().is_some())
            .finish()
    }
}

pub(crate) struct BlockRef {
    pub(crate) block: Arc<ByteBlock>,
    pub(crate) pool: BlockPool,
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        // last logical reference gone: the pool reclaims the block
        self.pool.destroy_block(self.block.id());
    }
}

/// A logical reference to a byte block, valid regardless of residence.
///
/// Cloning is cheap and does not pin. When the last `Block` (including those
/// embedded in [`PinnedBlock`] handles) is dropped, the underlying byte
/// block is destroyed and its RAM and swap space reclaimed.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockRef>,
}

impl Block {
    pub(crate) fn new(pool: BlockPool, block: Arc<ByteBlock>) -> Self {
        Self {
            inner: Arc::new(BlockRef { block, pool }),
        }
    }

    pub fn id(&self) -> BlockId {
        self.inner.block.id()
    }

    pub fn size(&self) -> usize {
        self.inner.block.size()
    }

    /// Pin this block on `worker`, swapping it in if required.
    pub fn pin(&self, worker: usize) -> PinFuture {
        self.inner.pool.pin_block(self, worker)
    }

    pub(crate) fn byte_block(&self) -> &Arc<ByteBlock> {
        &self.inner.block
    }

    pub(crate) fn pool(&self) -> &BlockPool {
        &self.inner.pool
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("size", &self.size())
            .finish()
    }
}

/// A block handle that holds exactly one pin on behalf of a worker.
///
/// The pin guarantees RAM residence for as long as the handle lives. Cloning
/// takes an additional pin on the same worker; dropping releases the pin on
/// every exit path, and the last release makes the block eligible for
/// eviction.
pub struct PinnedBlock {
    block: Block,
    worker: usize,
}

impl PinnedBlock {
    /// Wrap an already-counted pin. The caller must have incremented the pin
    /// count for `worker` beforehand.
    pub(crate) fn from_parts(block: Block, worker: usize) -> Self {
        Self { block, worker }
    }

    /// The logical reference underneath this pin.
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn id(&self) -> BlockId {
        self.block.id()
    }

    pub fn size(&self) -> usize {
        self.block.size()
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Read access to the block's bytes.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.block.byte_block().read_data()
    }

    /// Write access to the block's bytes. Invalidates any on-disk copy.
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        self.block.byte_block().write_data()
    }
}

impl Clone for PinnedBlock {
    fn clone(&self) -> Self {
        self.block
            .pool()
            .inc_block_pin_count(&self.block, self.worker);
        Self {
            block: self.block.clone(),
            worker: self.worker,
        }
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        self.block
            .pool()
            .dec_block_pin_count(&self.block, self.worker);
    }
}

impl std::fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("worker", &self.worker)
            .finish()
    }
}

/// One-shot future resolving to a [`PinnedBlock`] once the block is
/// RAM-resident and pinned.
///
/// Resolution happens on the swap gateway's I/O thread when a read was
/// required; pins that need no I/O resolve immediately. Awaitable from async
/// code, or use [`PinFuture::wait`] from a plain thread.
pub struct PinFuture {
    rx: oneshot::Receiver<Result<PinnedBlock, PinError>>,
}

impl PinFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Result<PinnedBlock, PinError>>) -> Self {
        Self { rx }
    }

    /// Block the calling thread until the pin resolves.
    pub fn wait(self) -> Result<PinnedBlock, PinError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(PinError::PoolShutDown))
    }
}

impl Future for PinFuture {
    type Output = Result<PinnedBlock, PinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(PinError::PoolShutDown),
        })
    }
}
