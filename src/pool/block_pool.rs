//! The block pool: sole broker of byte-block memory on the host.
//!
//! Every byte of block RAM is allocated and freed through the pool, and
//! every swap read/write is issued through its [`BlockManager`]. Blocks are
//! born pinned; when the last pin drops they enter the unpinned LRU, from
//! which they are swapped out under soft-limit pressure. Allocations block
//! under the hard limit until eviction frees enough RAM.
//!
//! All mutable state sits behind a single mutex with short critical
//! sections; swap completions re-acquire it from the I/O thread. The
//! `memory_change` condvar is signalled on every event that could admit a
//! hard-limit waiter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::io::{BlockManager, IoStats, RequestHandle, SwapIoError, SwapSlot};
use crate::mem::MemoryManager;

use super::byte_block::{Block, BlockId, ByteBlock, PinError, PinFuture, PinnedBlock};
use super::lru::LruCacheSet;
use super::pin_count::PinCount;

/// Snapshot of pool accounting, for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of live byte blocks, regardless of residence.
    pub block_count: usize,
    /// Bytes of RAM held by pinned, unpinned, and in-flight-write blocks.
    pub total_ram_use: usize,
    /// Bytes currently pinned across all workers.
    pub total_pinned_bytes: usize,
    /// Pins currently held across all workers.
    pub total_pins: usize,
    /// RAM-resident blocks with no pins (eviction candidates).
    pub unpinned_count: usize,
    /// Blocks with a swap write in flight.
    pub writing_count: usize,
    /// Blocks resident only on disk.
    pub swapped_count: usize,
    /// Blocks with a swap read in flight.
    pub reading_count: usize,
    /// Peak simultaneous pins.
    pub max_pins: usize,
    /// Peak simultaneously pinned bytes.
    pub max_pinned_bytes: usize,
}

/// Per-block bookkeeping, guarded by the pool mutex.
struct BlockMeta {
    block: Arc<ByteBlock>,
    /// Pins held per local worker.
    pins: Vec<u32>,
    total_pins: u32,
    /// Swap slot, once the block has ever been evicted.
    slot: Option<SwapSlot>,
    /// Outstanding swap write, if any. Writes are never cancelled; a block
    /// that leaves the writing state keeps this until the completion fires.
    pending_write: Option<RequestHandle>,
    /// The last logical reference vanished while a write was in flight; the
    /// write completion finishes the destroy.
    zombie: bool,
}

impl BlockMeta {
    fn new(block: Arc<ByteBlock>, workers_per_host: usize) -> Self {
        Self {
            block,
            pins: vec![0; workers_per_host],
            total_pins: 0,
            slot: None,
            pending_write: None,
            zombie: false,
        }
    }
}

/// One in-flight swap read. Concurrent pin requests for the same block
/// attach additional waiters instead of issuing a second read.
struct ReadRequest {
    /// Keeps the block alive until the read resolves.
    block: Block,
    /// Waiting pin requests: `(worker, promise)`.
    waiters: Vec<(usize, oneshot::Sender<Result<PinnedBlock, PinError>>)>,
    /// The gateway request, set once the read is issued.
    req: Option<RequestHandle>,
}

struct PoolState {
    blocks: HashMap<BlockId, BlockMeta>,
    /// RAM-resident blocks with pin count zero, LRU to MRU.
    unpinned_blocks: LruCacheSet<BlockId>,
    /// Blocks whose swap write is their current residence.
    writing: HashSet<BlockId>,
    /// Blocks resident only on disk.
    swapped: HashSet<BlockId>,
    /// Blocks with a swap read in flight.
    reading: HashMap<BlockId, ReadRequest>,
    pin_count: PinCount,
    /// Bytes of RAM held by unpinned, pinned, and writing blocks.
    total_ram_use: usize,
    /// Bytes of in-flight writes (still occupying RAM).
    writing_bytes: usize,
    /// Bytes admitted under the hard limit but not yet materialized
    /// (in-flight allocations and swap-in read buffers).
    requested_bytes: usize,
}

impl PoolState {
    fn new(workers_per_host: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            unpinned_blocks: LruCacheSet::new(),
            writing: HashSet::new(),
            swapped: HashSet::new(),
            reading: HashMap::new(),
            pin_count: PinCount::new(workers_per_host),
            total_ram_use: 0,
            writing_bytes: 0,
            requested_bytes: 0,
        }
    }
}

struct PoolInner {
    soft_ram_limit: usize,
    hard_ram_limit: usize,
    workers_per_host: usize,
    state: Mutex<PoolState>,
    /// Signalled on write completion, read completion, unpin, and block
    /// destruction.
    memory_change: Condvar,
    bm: BlockManager,
    ram: MemoryManager,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let st = self.state.get_mut();
        assert!(
            st.blocks.is_empty(),
            "byte blocks leaked: {} still registered at pool teardown",
            st.blocks.len()
        );
        assert_eq!(st.total_ram_use, 0, "RAM accounting nonzero at pool teardown");
        st.pin_count.assert_zero();
        info!(
            max_pins = st.pin_count.max_pins(),
            max_pinned_bytes = st.pin_count.max_pinned_bytes(),
            "block pool shut down"
        );
    }
}

/// Pool to allocate, keep, swap out/in, and free all byte blocks on the
/// host. Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    /// Create a pool with the given limits, rooted at a fresh memory
    /// manager.
    pub fn new(config: Config) -> Result<Self, SwapIoError> {
        let root = MemoryManager::root("block_pool");
        Self::with_memory_parent(config, &root)
    }

    /// Create a pool whose RAM and swap accounting roll up into `parent`.
    pub fn with_memory_parent(
        config: Config,
        parent: &MemoryManager,
    ) -> Result<Self, SwapIoError> {
        assert!(config.pool.workers_per_host > 0, "need at least one worker");
        let ram = parent.child("ram");
        let external = parent.child("swap");
        let bm = BlockManager::new(&config.io, external)?;

        info!(
            soft_ram_limit = config.pool.soft_ram_limit,
            hard_ram_limit = config.pool.hard_ram_limit,
            workers_per_host = config.pool.workers_per_host,
            "block pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                soft_ram_limit: config.pool.soft_ram_limit,
                hard_ram_limit: config.pool.hard_ram_limit,
                workers_per_host: config.pool.workers_per_host,
                state: Mutex::new(PoolState::new(config.pool.workers_per_host)),
                memory_change: Condvar::new(),
                bm,
                ram,
            }),
        })
    }

    pub fn workers_per_host(&self) -> usize {
        self.inner.workers_per_host
    }

    /// Total number of live byte blocks in this pool.
    pub fn block_count(&self) -> usize {
        self.inner.state.lock().blocks.len()
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock();
        PoolStats {
            block_count: st.blocks.len(),
            total_ram_use: st.total_ram_use,
            total_pinned_bytes: st.pin_count.total_pinned_bytes(),
            total_pins: st.pin_count.total_pins(),
            unpinned_count: st.unpinned_blocks.len(),
            writing_count: st.writing.len(),
            swapped_count: st.swapped.len(),
            reading_count: st.reading.len(),
            max_pins: st.pin_count.max_pins(),
            max_pinned_bytes: st.pin_count.max_pinned_bytes(),
        }
    }

    /// Swap gateway statistics.
    pub fn io_stats(&self) -> IoStats {
        self.inner.bm.stats()
    }

    /// Allocate a byte block of exactly `size` bytes, pinned once on
    /// `worker`. Blocks the calling thread while the hard RAM limit is
    /// exceeded, until eviction or destruction frees memory.
    pub fn allocate(&self, size: usize, worker: usize) -> PinnedBlock {
        self.check_worker(worker);
        let byte_block = {
            let mut guard = self.inner.state.lock();
            self.request_internal_memory(&mut guard, size);

            let st = &mut *guard;
            st.requested_bytes -= size;
            st.total_ram_use += size;
            self.inner.ram.add(size);

            let block = Arc::new(ByteBlock::new(size));
            let id = block.id();
            let mut meta = BlockMeta::new(Arc::clone(&block), self.inner.workers_per_host);
            meta.pins[worker] = 1;
            meta.total_pins = 1;
            st.pin_count.increment(worker, size);
            st.blocks.insert(id, meta);

            debug!(block = id, size, worker, "allocated byte block");
            self.assert_ledger(st);
            block
        };
        let block = Block::new(self.clone(), byte_block);
        PinnedBlock::from_parts(block, worker)
    }

    /// Pin a block on `worker`, swapping it in if required.
    ///
    /// RAM-resident blocks resolve immediately; swapped blocks resolve once
    /// the read completes on the gateway thread. Concurrent pins of the same
    /// swapped block coalesce onto a single read. May block the calling
    /// thread on the hard limit while admitting the read buffer.
    pub fn pin_block(&self, block: &Block, worker: usize) -> PinFuture {
        self.check_worker(worker);
        let id = block.id();
        let size = block.size();
        let (tx, rx) = oneshot::channel();

        let mut guard = self.inner.state.lock();

        let total_pins = guard
            .blocks
            .get(&id)
            .expect("pin of a destroyed block")
            .total_pins;
        if total_pins > 0 {
            self.inc_pin(&mut guard, id, worker);
            drop(guard);
            let _ = tx.send(Ok(PinnedBlock::from_parts(block.clone(), worker)));
            return PinFuture::new(rx);
        }

        if guard.unpinned_blocks.erase(&id) {
            self.inc_pin(&mut guard, id, worker);
            debug!(block = id, worker, "pinned RAM-resident block");
            drop(guard);
            let _ = tx.send(Ok(PinnedBlock::from_parts(block.clone(), worker)));
            return PinFuture::new(rx);
        }

        if guard.writing.remove(&id) {
            // the bytes are still in RAM while the write is in flight, so
            // the pin is granted immediately; the completion callback will
            // release the swap slot it obtained
            guard.writing_bytes -= size;
            self.inc_pin(&mut guard, id, worker);
            debug!(block = id, worker, "pin reclaimed block from in-flight write");
            drop(guard);
            let _ = tx.send(Ok(PinnedBlock::from_parts(block.clone(), worker)));
            return PinFuture::new(rx);
        }

        if let Some(read) = guard.reading.get_mut(&id) {
            read.waiters.push((worker, tx));
            debug!(
                block = id,
                worker,
                req = ?read.req,
                waiters = read.waiters.len(),
                "attached pin to in-flight swap read"
            );
            return PinFuture::new(rx);
        }

        // swapped: register the read request first so concurrent pins attach
        // to it even if the admission below has to wait
        {
            let st = &mut *guard;
            assert!(st.swapped.remove(&id), "block {id} is in no residence set");
            st.reading.insert(
                id,
                ReadRequest {
                    block: block.clone(),
                    waiters: vec![(worker, tx)],
                    req: None,
                },
            );
        }
        self.request_internal_memory(&mut guard, size);

        let pool = self.clone();
        let req = {
            let st = &mut *guard;
            let meta = st.blocks.get(&id).expect("swapped block has metadata");
            let slot = meta.slot.as_ref().expect("swapped block has a swap slot");
            self.inner.bm.read_async(
                slot,
                Box::new(move |req, data, success| {
                    pool.on_read_complete(id, req, data, success);
                }),
            )
        };
        guard
            .reading
            .get_mut(&id)
            .expect("read request registered above")
            .req = Some(req);
        debug!(block = id, worker, ?req, "swapping block in");
        self.assert_ledger(&guard);
        PinFuture::new(rx)
    }

    /// Take an additional pin on an already-pinned block.
    pub fn inc_block_pin_count(&self, block: &Block, worker: usize) {
        self.check_worker(worker);
        let mut guard = self.inner.state.lock();
        let id = block.id();
        let total_pins = guard
            .blocks
            .get(&id)
            .expect("pin increment for unknown block")
            .total_pins;
        assert!(total_pins > 0, "pin count increment requires an existing pin");
        self.inc_pin(&mut guard, id, worker);
    }

    /// Release one pin. When the total reaches zero the block becomes an
    /// eviction candidate. Called by [`PinnedBlock`] on drop.
    pub fn dec_block_pin_count(&self, block: &Block, worker: usize) {
        let id = block.id();
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let meta = st.blocks.get_mut(&id).expect("pin drop for unknown block");
        assert!(
            meta.pins[worker] > 0,
            "pin dropped on worker {worker} which holds none for block {id}"
        );
        meta.pins[worker] -= 1;
        meta.total_pins -= 1;
        let size = meta.block.size();
        let last = meta.total_pins == 0;
        st.pin_count.decrement(worker, size);
        if last {
            self.unpin_block(st, id);
        }
        self.assert_ledger(st);
    }

    /// Reclaim a block once its last logical reference is gone. Called by
    /// the [`Block`] handle on drop.
    pub(crate) fn destroy_block(&self, id: BlockId) {
        let mut released: Option<SwapSlot> = None;
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let meta = st.blocks.get_mut(&id).expect("destroy of unknown block");
            assert_eq!(
                meta.total_pins, 0,
                "block {id} destroyed while pins are outstanding"
            );
            let size = meta.block.size();

            if meta.pending_write.is_some() {
                // writes are never cancelled; the completion finishes this
                meta.zombie = true;
                st.unpinned_blocks.erase(&id);
                if st.writing.insert(id) {
                    st.writing_bytes += size;
                }
                debug!(block = id, "destroy deferred until swap write completes");
            } else {
                let resident = st.unpinned_blocks.erase(&id);
                if resident {
                    meta.block.release_data();
                } else {
                    assert!(
                        st.swapped.remove(&id),
                        "destroyed block {id} is in no residence set"
                    );
                }
                released = meta.slot.take();
                st.blocks.remove(&id);
                if resident {
                    self.release_internal_memory(st, size);
                }
                debug!(block = id, size, "destroyed byte block");
            }
            self.inner.memory_change.notify_all();
            self.assert_ledger(st);
        }
        if let Some(slot) = released {
            self.inner.bm.release_slot(slot);
        }
    }

    /// Wait until `size` additional bytes fit under the hard limit, evicting
    /// unpinned blocks along the way, then reserve them.
    fn request_internal_memory(&self, guard: &mut MutexGuard<'_, PoolState>, size: usize) {
        let hard = self.inner.hard_ram_limit;
        if hard > 0 {
            while guard.total_ram_use + guard.requested_bytes + size > hard {
                if !guard.unpinned_blocks.is_empty() {
                    self.evict_block(&mut *guard);
                    continue;
                }
                self.inner.memory_change.wait(guard);
            }
        }
        guard.requested_bytes += size;
    }

    /// Return `size` bytes to the pool budget and wake hard-limit waiters.
    fn release_internal_memory(&self, st: &mut PoolState, size: usize) {
        st.total_ram_use -= size;
        self.inner.ram.subtract(size);
        self.inner.memory_change.notify_all();
    }

    fn inc_pin(&self, guard: &mut MutexGuard<'_, PoolState>, id: BlockId, worker: usize) {
        let st = &mut **guard;
        let meta = st.blocks.get_mut(&id).expect("pin increment for unknown block");
        meta.pins[worker] += 1;
        meta.total_pins += 1;
        let size = meta.block.size();
        st.pin_count.increment(worker, size);
    }

    /// The last pin just dropped: move the block into the unpinned LRU and
    /// swap out victims while the soft limit is exceeded.
    fn unpin_block(&self, st: &mut PoolState, id: BlockId) {
        st.unpinned_blocks.put(id);
        debug!(block = id, "block unpinned");

        let soft = self.inner.soft_ram_limit;
        while soft > 0 && st.total_ram_use > soft && !st.unpinned_blocks.is_empty() {
            self.evict_block(st);
        }
        // a new eviction candidate may unblock a hard-limit waiter
        self.inner.memory_change.notify_all();
    }

    /// Swap out the least recently used unpinned block.
    fn evict_block(&self, st: &mut PoolState) {
        let Some(id) = st.unpinned_blocks.pop() else {
            return;
        };
        let meta = st.blocks.get_mut(&id).expect("LRU entry for unknown block");
        let size = meta.block.size();

        if meta.pending_write.is_some() {
            // an earlier swap write is still in flight; rejoin it
            st.writing.insert(id);
            st.writing_bytes += size;
            debug!(block = id, "eviction rejoined in-flight write");
            return;
        }

        if meta.slot.is_some() && meta.block.disk_copy_valid() {
            // unmodified since the last swap-out: skip the write
            meta.block.release_data();
            st.swapped.insert(id);
            self.release_internal_memory(st, size);
            debug!(block = id, size, "evicted block without rewrite");
            return;
        }

        if meta.slot.is_none() {
            meta.slot = Some(self.inner.bm.allocate_slot(size));
        }
        let slot = meta.slot.as_ref().expect("slot allocated above");
        let pool = self.clone();
        let req = self.inner.bm.write_async(
            slot,
            Arc::clone(&meta.block),
            Box::new(move |req, success| {
                pool.on_write_complete(id, req, success);
            }),
        );
        meta.pending_write = Some(req);
        st.writing.insert(id);
        st.writing_bytes += size;
        debug!(block = id, size, ?req, "evicting block to swap");
    }

    /// Swap-write completion, invoked on the gateway thread.
    fn on_write_complete(&self, id: BlockId, req: RequestHandle, success: bool) {
        if !success {
            // the pool cannot maintain its invariants without the swap medium
            error!(block = id, "swap write failed; aborting");
            std::process::abort();
        }

        let mut released: Option<SwapSlot> = None;
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let meta = st
                .blocks
                .get_mut(&id)
                .expect("write completion for unknown block");
            debug_assert_eq!(meta.pending_write, Some(req));
            meta.pending_write = None;
            let size = meta.block.size();

            if meta.zombie {
                st.writing.remove(&id);
                st.writing_bytes -= size;
                released = meta.slot.take();
                st.blocks.remove(&id);
                self.release_internal_memory(st, size);
                debug!(block = id, "destroyed block after its final swap write");
            } else if !st.writing.contains(&id) {
                // a pin reclaimed the block mid-write; the disk copy is moot
                meta.block.invalidate_disk_copy();
                released = meta.slot.take();
                debug!(block = id, "swap write superseded by a pin; slot released");
            } else if !meta.block.disk_copy_valid() {
                // mutated after the snapshot; rewrite before swapping out
                let slot = meta.slot.as_ref().expect("writing block has a slot");
                let pool = self.clone();
                let new_req = self.inner.bm.write_async(
                    slot,
                    Arc::clone(&meta.block),
                    Box::new(move |req, success| {
                        pool.on_write_complete(id, req, success);
                    }),
                );
                meta.pending_write = Some(new_req);
                warn!(block = id, "swap write landed stale; rewriting");
            } else {
                st.writing.remove(&id);
                st.writing_bytes -= size;
                meta.block.release_data();
                st.swapped.insert(id);
                self.release_internal_memory(st, size);
                debug!(block = id, size, "block swapped out");
            }
            self.inner.memory_change.notify_all();
            self.assert_ledger(st);
        }
        if let Some(slot) = released {
            self.inner.bm.release_slot(slot);
        }
    }

    /// Swap-read completion, invoked on the gateway thread. Pins the block
    /// for every attached waiter and resolves their promises.
    fn on_read_complete(&self, id: BlockId, req: RequestHandle, data: Vec<u8>, success: bool) {
        let read = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let read = st
                .reading
                .remove(&id)
                .expect("read completion for unknown request");
            debug_assert_eq!(read.req, Some(req));
            let meta = st
                .blocks
                .get_mut(&id)
                .expect("read completion for unknown block");
            let size = meta.block.size();
            st.requested_bytes -= size;

            if success {
                st.total_ram_use += size;
                self.inner.ram.add(size);
                meta.block.install(data);
                for (worker, _) in &read.waiters {
                    meta.pins[*worker] += 1;
                    meta.total_pins += 1;
                    st.pin_count.increment(*worker, size);
                }
                debug!(
                    block = id,
                    size,
                    waiters = read.waiters.len(),
                    "block swapped in"
                );
                self.inner.memory_change.notify_all();
                self.assert_ledger(st);
            }
            read
        };

        if !success {
            // let waiters observe the error through their futures, then die:
            // the pool cannot maintain its invariants without the swap medium
            for (_, tx) in read.waiters {
                let _ = tx.send(Err(PinError::ReadFailed(id)));
            }
            error!(block = id, "swap read failed; aborting");
            std::process::abort();
        }

        // resolve the promises without holding the pool mutex
        let block = read.block.clone();
        for (worker, tx) in read.waiters {
            // a dropped receiver unpins through the handle's own drop
            let _ = tx.send(Ok(PinnedBlock::from_parts(block.clone(), worker)));
        }
    }

    fn check_worker(&self, worker: usize) {
        assert!(
            worker < self.inner.workers_per_host,
            "worker {worker} out of range (workers_per_host = {})",
            self.inner.workers_per_host
        );
    }

    /// RAM ledger invariant, checked after every mutation in debug builds:
    /// `total_ram_use == unpinned bytes + pinned bytes + writing bytes`.
    #[cfg(debug_assertions)]
    fn assert_ledger(&self, st: &PoolState) {
        let unpinned_bytes: usize = st
            .unpinned_blocks
            .iter()
            .map(|id| st.blocks[&id].block.size())
            .sum();
        assert_eq!(
            st.total_ram_use,
            unpinned_bytes + st.pin_count.total_pinned_bytes() + st.writing_bytes,
            "RAM ledger out of balance"
        );
    }

    #[cfg(not(debug_assertions))]
    fn assert_ledger(&self, _st: &PoolState) {}
}
