//! Asynchronous disk gateway for swapped blocks.
//!
//! The [`BlockManager`] owns a single I/O worker thread fed by a channel.
//! Swap writes and reads are issued with completion callbacks which the
//! worker invokes after the file operation finishes; callers must be
//! prepared for the callback to run concurrently with their own code.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::IoConfig;
use crate::mem::MemoryManager;
use crate::pool::byte_block::ByteBlock;

#[derive(Error, Debug)]
pub enum SwapIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read from {path}: expected {expected} bytes, got {got}")]
    ShortRead {
        path: PathBuf,
        expected: usize,
        got: usize,
    },
}

/// Opaque handle identifying an in-flight I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(u64);

/// A reserved location in the swap directory. One slot holds exactly one
/// block's bytes; the bytes are accounted against the external memory
/// manager for the lifetime of the slot.
#[derive(Debug)]
pub struct SwapSlot {
    id: u64,
    path: PathBuf,
    size: usize,
}

impl SwapSlot {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Completion callback for a swap write: `(request, success)`.
pub type WriteCallback = Box<dyn FnOnce(RequestHandle, bool) + Send>;

/// Completion callback for a swap read: `(request, data, success)`.
pub type ReadCallback = Box<dyn FnOnce(RequestHandle, Vec<u8>, bool) + Send>;

enum IoJob {
    Write {
        path: PathBuf,
        source: Arc<ByteBlock>,
        req: RequestHandle,
        callback: WriteCallback,
    },
    Read {
        path: PathBuf,
        size: usize,
        req: RequestHandle,
        callback: ReadCallback,
    },
    Delete {
        path: PathBuf,
    },
}

#[derive(Debug, Default)]
struct IoCounters {
    writes_issued: AtomicU64,
    reads_issued: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// Snapshot of gateway statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub writes_issued: u64,
    pub reads_issued: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

/// The asynchronous disk gateway.
pub struct BlockManager {
    swap_dir: PathBuf,
    tx: Option<mpsc::Sender<IoJob>>,
    worker: Option<thread::JoinHandle<()>>,
    counters: Arc<IoCounters>,
    external: MemoryManager,
    next_slot_id: AtomicU64,
    next_request_id: AtomicU64,
}

impl BlockManager {
    /// Create a gateway writing under `config.swap_dir` and start its I/O
    /// worker thread. Swapped bytes are accounted against `external`.
    pub fn new(config: &IoConfig, external: MemoryManager) -> Result<Self, SwapIoError> {
        std::fs::create_dir_all(&config.swap_dir)?;

        let counters = Arc::new(IoCounters::default());
        let (tx, rx) = mpsc::channel();
        let write_delay = Duration::from_millis(config.write_delay_ms);
        let read_delay = Duration::from_millis(config.read_delay_ms);
        let worker_counters = Arc::clone(&counters);
        let worker = thread::Builder::new()
            .name("block-pool-io".to_string())
            .spawn(move || run_worker(rx, worker_counters, write_delay, read_delay))
            .map_err(SwapIoError::Io)?;

        debug!(swap_dir = %config.swap_dir.display(), "block manager started");

        Ok(Self {
            swap_dir: config.swap_dir.clone(),
            tx: Some(tx),
            worker: Some(worker),
            counters,
            external,
            next_slot_id: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
        })
    }

    /// Reserve a swap slot for `size` bytes. No file is created until the
    /// first write lands.
    pub fn allocate_slot(&self, size: usize) -> SwapSlot {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        // two-level directory structure to avoid too many files per directory
        let shard = id / 1000;
        let path = self
            .swap_dir
            .join(format!("{shard}"))
            .join(format!("{id}.block"));
        self.external.add(size);
        SwapSlot { id, path, size }
    }

    /// Release a slot: delete its file and debit the external accounting.
    pub fn release_slot(&self, slot: SwapSlot) {
        self.external.subtract(slot.size);
        debug!(slot = slot.id, "releasing swap slot");
        if let Some(tx) = &self.tx {
            let _ = tx.send(IoJob::Delete { path: slot.path });
        }
    }

    /// Queue an asynchronous write of `source`'s buffer into `slot`. The
    /// callback runs on the I/O thread once the file write finishes.
    pub fn write_async(
        &self,
        slot: &SwapSlot,
        source: Arc<ByteBlock>,
        callback: WriteCallback,
    ) -> RequestHandle {
        let req = RequestHandle(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        self.counters.writes_issued.fetch_add(1, Ordering::Relaxed);
        self.send(IoJob::Write {
            path: slot.path.clone(),
            source,
            req,
            callback,
        });
        req
    }

    /// Queue an asynchronous read of `slot`'s file. The callback receives
    /// the bytes (or an empty buffer on failure) on the I/O thread.
    pub fn read_async(&self, slot: &SwapSlot, callback: ReadCallback) -> RequestHandle {
        let req = RequestHandle(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        self.counters.reads_issued.fetch_add(1, Ordering::Relaxed);
        self.send(IoJob::Read {
            path: slot.path.clone(),
            size: slot.size,
            req,
            callback,
        });
        req
    }

    /// Gateway statistics.
    pub fn stats(&self) -> IoStats {
        IoStats {
            writes_issued: self.counters.writes_issued.load(Ordering::Relaxed),
            reads_issued: self.counters.reads_issued.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Bytes currently held in swap slots.
    pub fn external_bytes(&self) -> usize {
        self.external.total()
    }

    fn send(&self, job: IoJob) {
        self.tx
            .as_ref()
            .expect("block manager is running")
            .send(job)
            .expect("I/O worker thread is alive");
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        // closing the channel lets the worker drain outstanding jobs and exit
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            // a completion callback may hold the last reference to the pool,
            // in which case this drop runs on the worker itself: the thread
            // is left to drain and exit on its own instead of self-joining
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(
    rx: mpsc::Receiver<IoJob>,
    counters: Arc<IoCounters>,
    write_delay: Duration,
    read_delay: Duration,
) {
    while let Ok(job) = rx.recv() {
        match job {
            IoJob::Write {
                path,
                source,
                req,
                callback,
            } => {
                if !write_delay.is_zero() {
                    thread::sleep(write_delay);
                }
                let success = match source.write_snapshot_to(&path) {
                    Ok(written) => {
                        counters.bytes_written.fetch_add(written, Ordering::Relaxed);
                        debug!(
                            block = source.id(),
                            path = %path.display(),
                            size = written,
                            "wrote block to swap"
                        );
                        true
                    }
                    Err(err) => {
                        error!(
                            block = source.id(),
                            path = %path.display(),
                            %err,
                            "swap write failed"
                        );
                        false
                    }
                };
                callback(req, success);
            }
            IoJob::Read {
                path,
                size,
                req,
                callback,
            } => {
                if !read_delay.is_zero() {
                    thread::sleep(read_delay);
                }
                match read_swap_file(&path, size) {
                    Ok(data) => {
                        counters
                            .bytes_read
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                        debug!(path = %path.display(), size, "read block from swap");
                        callback(req, data, true);
                    }
                    Err(err) => {
                        error!(path = %path.display(), %err, "swap read failed");
                        callback(req, Vec::new(), false);
                    }
                }
            }
            IoJob::Delete { path } => {
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), %err, "failed to delete swap file");
                    }
                }
            }
        }
    }
}

fn read_swap_file(path: &Path, size: usize) -> Result<Vec<u8>, SwapIoError> {
    let data = std::fs::read(path)?;
    if data.len() != size {
        return Err(SwapIoError::ShortRead {
            path: path.to_path_buf(),
            expected: size,
            got: data.len(),
        });
    }
    Ok(data)
}
