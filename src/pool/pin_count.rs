//! Per-worker pin accounting.
//!
//! Every pin is attributed to a local worker so the amount of memory locked
//! per thread can be inspected. Totals and peak watermarks are maintained
//! alongside the per-worker vectors.

/// Pin counters for all workers on the host.
#[derive(Debug)]
pub struct PinCount {
    /// Current total number of pins across all workers.
    total_pins: usize,

    /// Current total number of pinned bytes across all workers.
    total_pinned_bytes: usize,

    /// Peak number of simultaneous pins.
    max_pins: usize,

    /// Peak number of simultaneously pinned bytes.
    max_pinned_bytes: usize,

    /// Number of pins held per local worker.
    pin_count: Vec<usize>,

    /// Number of bytes pinned per local worker.
    pinned_bytes: Vec<usize>,
}

impl PinCount {
    pub fn new(workers_per_host: usize) -> Self {
        Self {
            total_pins: 0,
            total_pinned_bytes: 0,
            max_pins: 0,
            max_pinned_bytes: 0,
            pin_count: vec![0; workers_per_host],
            pinned_bytes: vec![0; workers_per_host],
        }
    }

    /// Record one new pin of `size` bytes for `worker`.
    pub fn increment(&mut self, worker: usize, size: usize) {
        self.pin_count[worker] += 1;
        self.pinned_bytes[worker] += size;
        self.total_pins += 1;
        self.total_pinned_bytes += size;
        self.max_pins = self.max_pins.max(self.total_pins);
        self.max_pinned_bytes = self.max_pinned_bytes.max(self.total_pinned_bytes);
    }

    /// Drop one pin of `size` bytes for `worker`.
    pub fn decrement(&mut self, worker: usize, size: usize) {
        assert!(
            self.pin_count[worker] > 0,
            "pin dropped on worker {worker} which holds no pins"
        );
        assert!(
            self.pinned_bytes[worker] >= size,
            "worker {worker} releases {size} pinned bytes but holds only {}",
            self.pinned_bytes[worker]
        );
        self.pin_count[worker] -= 1;
        self.pinned_bytes[worker] -= size;
        self.total_pins -= 1;
        self.total_pinned_bytes -= size;
    }

    pub fn total_pins(&self) -> usize {
        self.total_pins
    }

    pub fn total_pinned_bytes(&self) -> usize {
        self.total_pinned_bytes
    }

    pub fn max_pins(&self) -> usize {
        self.max_pins
    }

    pub fn max_pinned_bytes(&self) -> usize {
        self.max_pinned_bytes
    }

    /// Verify that every counter is zero. Called at pool teardown; a failure
    /// means a pin handle leaked.
    pub fn assert_zero(&self) {
        assert!(
            self.total_pins == 0
                && self.total_pinned_bytes == 0
                && self.pin_count.iter().all(|&c| c == 0)
                && self.pinned_bytes.iter().all(|&b| b == 0),
            "pin handles leaked: {} pins / {} bytes still held at pool teardown",
            self.total_pins,
            self.total_pinned_bytes
        );
    }
}
