//! Runtime configuration for block-pool.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All memory limits and swap I/O knobs live here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pool memory limits and worker accounting.
    pub pool: PoolConfig,

    /// Swap I/O settings.
    pub io: IoConfig,
}

/// Memory limits for the block pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Soft RAM limit in bytes. When total RAM use exceeds this, unpinned
    /// LRU blocks are proactively swapped out. 0 disables the limit.
    pub soft_ram_limit: usize,

    /// Hard RAM limit in bytes. Allocations block until the ceiling is
    /// respected. 0 disables the limit.
    pub hard_ram_limit: usize,

    /// Number of local worker threads whose pin counts are tracked
    /// independently.
    pub workers_per_host: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            soft_ram_limit: 0,
            hard_ram_limit: 0,
            workers_per_host: 1,
        }
    }
}

/// Swap I/O settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Directory holding swapped block files.
    pub swap_dir: PathBuf,

    /// Artificial delay before each swap write, in milliseconds.
    /// Latency injection for tests; 0 in production.
    pub write_delay_ms: u64,

    /// Artificial delay before each swap read, in milliseconds.
    pub read_delay_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            swap_dir: PathBuf::from("/tmp/block-pool"),
            write_delay_ms: 0,
            read_delay_ms: 0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
