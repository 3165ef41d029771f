//! End-to-end tests for the block pool: allocation, limits, swap round
//! trips, and read coalescing.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use block_pool::config::{Config, IoConfig, PoolConfig};
use block_pool::pool::{Block, BlockPool, PinnedBlock};

fn make_pool(
    tmp: &TempDir,
    soft: usize,
    hard: usize,
    workers: usize,
    write_delay_ms: u64,
    read_delay_ms: u64,
) -> BlockPool {
    // opt-in logging: RUST_LOG=block_pool=debug cargo test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let config = Config {
        pool: PoolConfig {
            soft_ram_limit: soft,
            hard_ram_limit: hard,
            workers_per_host: workers,
        },
        io: IoConfig {
            swap_dir: tmp.path().join("swap"),
            write_delay_ms,
            read_delay_ms,
        },
    };
    BlockPool::new(config).unwrap()
}

/// Poll until `pred` holds or `timeout` elapses.
fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    pred()
}

fn fill_pattern(pinned: &PinnedBlock, seed: u8) {
    let mut data = pinned.data_mut();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
}

fn check_pattern(pinned: &PinnedBlock, seed: u8) {
    let data = pinned.data();
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(
            *byte,
            (i as u8).wrapping_mul(31).wrapping_add(seed),
            "byte {i} corrupted"
        );
    }
}

#[test]
fn test_basic_alloc_free() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 0, 0, 1, 0, 0);

    let pins: Vec<_> = (0..10).map(|_| pool.allocate(4096, 0)).collect();
    let stats = pool.stats();
    assert_eq!(stats.block_count, 10);
    assert_eq!(stats.total_ram_use, 10 * 4096);
    assert_eq!(stats.total_pins, 10);

    drop(pins);
    let stats = pool.stats();
    assert_eq!(stats.block_count, 0);
    assert_eq!(stats.total_ram_use, 0);
    assert_eq!(stats.swapped_count, 0);
}

#[test]
fn test_soft_limit_evicts_lru_blocks() {
    let tmp = TempDir::new().unwrap();
    // slow writes so the three unpins land before the first write completes
    let pool = make_pool(&tmp, 16 * 1024, 0, 1, 25, 0);

    let mut pins: Vec<_> = (0..5).map(|_| pool.allocate(4096, 0)).collect();
    let blocks: Vec<Block> = pins.iter().map(|p| p.block().clone()).collect();
    assert_eq!(pool.stats().total_ram_use, 5 * 4096);

    // unpin the first three; RAM is over the soft limit until writes land
    pins.drain(..3);

    assert!(
        wait_until(Duration::from_secs(5), || {
            let s = pool.stats();
            s.swapped_count == 3 && s.writing_count == 0
        }),
        "pool did not quiesce: {:?}",
        pool.stats()
    );

    let stats = pool.stats();
    assert_eq!(stats.swapped_count, 3);
    assert_eq!(stats.total_pinned_bytes, 2 * 4096);
    assert_eq!(stats.total_ram_use, 2 * 4096);
    assert_eq!(stats.unpinned_count, 0);

    drop(pins);
    drop(blocks);
    assert_eq!(pool.block_count(), 0);
}

#[test]
fn test_hard_limit_backpressure() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 0, 8 * 1024, 2, 0, 0);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for worker in 0..2 {
        let pool = pool.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let pinned = pool.allocate(6 * 1024, worker);
            thread::sleep(Duration::from_millis(40));
            let block = pinned.block().clone();
            drop(pinned); // lets the other thread's allocation proceed
            block
        }));
    }

    // sample the ceiling while both allocations are in flight
    let sampler = {
        let pool = pool.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(300);
            let mut max_seen = 0;
            while Instant::now() < deadline {
                max_seen = max_seen.max(pool.stats().total_ram_use);
                thread::sleep(Duration::from_millis(1));
            }
            max_seen
        })
    };

    let blocks: Vec<Block> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(pool.block_count(), 2);

    let max_seen = sampler.join().unwrap();
    assert!(
        max_seen <= 8 * 1024,
        "hard limit exceeded: {max_seen} bytes in RAM"
    );

    drop(blocks);
    assert!(wait_until(Duration::from_secs(5), || pool.block_count() == 0));
}

#[test]
fn test_swap_roundtrip_preserves_bytes() {
    let tmp = TempDir::new().unwrap();
    // soft limit of one byte: any unpinned block is evicted immediately
    let pool = make_pool(&tmp, 1, 0, 1, 0, 0);

    let pinned = pool.allocate(4096, 0);
    fill_pattern(&pinned, 7);
    let block = pinned.block().clone();
    drop(pinned);

    assert!(
        wait_until(Duration::from_secs(5), || {
            let s = pool.stats();
            s.swapped_count == 1 && s.writing_count == 0
        }),
        "block was not swapped out: {:?}",
        pool.stats()
    );
    assert_eq!(pool.stats().total_ram_use, 0);

    let repinned = block.pin(0).wait().unwrap();
    check_pattern(&repinned, 7);
    assert_eq!(pool.stats().total_ram_use, 4096);
    assert_eq!(pool.io_stats().reads_issued, 1);
}

#[test]
fn test_coalesced_pin_in_issues_one_read() {
    let tmp = TempDir::new().unwrap();
    // slow reads so all eight pins attach to the same in-flight request
    let pool = make_pool(&tmp, 1, 0, 1, 0, 40);

    let pinned = pool.allocate(4096, 0);
    fill_pattern(&pinned, 99);
    let block = pinned.block().clone();
    drop(pinned);

    assert!(wait_until(Duration::from_secs(5), || {
        let s = pool.stats();
        s.swapped_count == 1 && s.writing_count == 0
    }));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let block = block.clone();
            thread::spawn(move || block.pin(0).wait().unwrap())
        })
        .collect();
    let pins: Vec<PinnedBlock> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(pins.len(), 8);
    assert_eq!(pool.stats().total_pins, 8);
    assert_eq!(pool.io_stats().reads_issued, 1, "reads were not coalesced");
    for pinned in &pins {
        check_pattern(pinned, 99);
    }
}

#[test]
fn test_pin_reclaims_block_from_inflight_write() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 1, 0, 1, 50, 0);

    let pinned = pool.allocate(2048, 0);
    fill_pattern(&pinned, 3);
    let block = pinned.block().clone();
    drop(pinned); // eviction starts; the write takes ~50ms

    assert!(wait_until(Duration::from_millis(500), || {
        pool.stats().writing_count == 1
    }));

    // bytes are still in RAM, so the pin resolves without waiting
    let start = Instant::now();
    let repinned = block.pin(0).wait().unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(40),
        "pin should not wait for the write"
    );
    check_pattern(&repinned, 3);

    // once the superseded write lands, the block is pinned and not swapped
    assert!(wait_until(Duration::from_millis(500), || {
        pool.io_stats().bytes_written >= 2048
    }));
    thread::sleep(Duration::from_millis(10));
    let stats = pool.stats();
    assert_eq!(stats.swapped_count, 0);
    assert_eq!(stats.writing_count, 0);
    assert_eq!(stats.total_pins, 1);

    // the released slot means a later eviction writes afresh
    drop(repinned);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats().swapped_count == 1
    }));
    assert_eq!(pool.io_stats().writes_issued, 2);

    let again = block.pin(0).wait().unwrap();
    check_pattern(&again, 3);
}

#[test]
fn test_clean_reeviction_skips_write() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 1, 0, 1, 0, 0);

    let pinned = pool.allocate(1024, 0);
    fill_pattern(&pinned, 42);
    let block = pinned.block().clone();
    drop(pinned);

    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats().swapped_count == 1
    }));
    assert_eq!(pool.io_stats().writes_issued, 1);

    // pin it back in, read only, and drop: the disk copy is still valid
    let repinned = block.pin(0).wait().unwrap();
    check_pattern(&repinned, 42);
    drop(repinned);

    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats().swapped_count == 1
    }));
    assert_eq!(
        pool.io_stats().writes_issued,
        1,
        "unmodified block should re-evict without a second write"
    );

    // modifying the block invalidates the copy and forces a rewrite
    let dirty = block.pin(0).wait().unwrap();
    dirty.data_mut()[0] ^= 0xFF;
    drop(dirty);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.stats().swapped_count == 1 && pool.stats().writing_count == 0
    }));
    assert_eq!(pool.io_stats().writes_issued, 2);
}

#[test]
fn test_pinned_blocks_are_never_evicted() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 1, 0, 1, 0, 0);

    let held = pool.allocate(4096, 0);
    fill_pattern(&held, 5);

    // churn unpinned blocks through the pool under constant soft pressure
    for round in 0..10 {
        let victim = pool.allocate(4096, 0);
        let block = victim.block().clone();
        drop(victim);
        assert!(
            wait_until(Duration::from_secs(5), || {
                pool.stats().swapped_count == 1 && pool.stats().writing_count == 0
            }),
            "round {round} did not swap the victim"
        );
        drop(block);
    }

    // the pinned block never left RAM
    let stats = pool.stats();
    assert_eq!(stats.total_pinned_bytes, 4096);
    assert_eq!(stats.swapped_count, 0);
    assert_eq!(pool.io_stats().reads_issued, 0);
    check_pattern(&held, 5);
}

#[test]
fn test_alloc_has_exactly_one_pin_on_worker() {
    let tmp = TempDir::new().unwrap();
    let pool = make_pool(&tmp, 0, 0, 3, 0, 0);

    let pinned = pool.allocate(512, 2);
    assert_eq!(pinned.worker(), 2);
    let stats = pool.stats();
    assert_eq!(stats.total_pins, 1);
    assert_eq!(stats.total_pinned_bytes, 512);
}
