//! Construction-time configuration of the block cache.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Upper bound on `block_size`.  The facade rejects anything larger.
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024;

/// Size of an on-disk region, the unit of disk reclamation.  A disk space
/// smaller than this still gets one region sized to the space.
pub const REGION_SIZE: u64 = 16 * 1024 * 1024;

/// Smallest usable disk space: one region that can hold a maximum-size
/// block with framing to spare.
pub const MIN_DISK_SPACE_SIZE: u64 = 2 * 1024 * 1024;

/// Default disk block alignment used for block-size defaulting.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Name of the data file placed in every configured disk directory.
pub const CACHE_DATA_FILE: &str = "cache_data";

/// Name of the statistics file written under `meta_path` on shutdown.
pub const STATS_FILE: &str = "stats.txt";

const fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

const fn default_max_concurrent_inserts() -> u32 {
    4
}

const fn default_blocking_admission() -> bool {
    true
}

const fn default_enable_checksum() -> bool {
    false
}

const fn default_max_flying_memory_mb() -> u64 {
    0
}

fn default_engine() -> CacheEngine {
    CacheEngine::MemoryOnly
}

/// One directory of disk cache space and the byte budget inside it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DirSpace {
    pub path: PathBuf,
    pub size: u64,
}

/// Which storage engine backs the cache.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheEngine {
    MemoryOnly,
    Hybrid,
}

/// Options fixed for the lifetime of a cache instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheOptions {
    /// Memory tier capacity in bytes.
    pub mem_space_size: u64,

    /// Disk directories and their byte budgets.  Empty means the disk tier
    /// is disabled.
    #[serde(default)]
    pub disk_spaces: Vec<DirSpace>,

    /// Alignment unit for cache addresses.  Must be a power of two and no
    /// larger than [`MAX_BLOCK_SIZE`].
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Directory where shutdown statistics are written.
    pub meta_path: PathBuf,

    /// Enable per-entry payload checksums in the disk tier.
    #[serde(default = "default_enable_checksum")]
    pub enable_checksum: bool,

    /// Cap on bytes accepted for disk write but not yet persisted.  (MiB)
    /// Zero means unbounded.
    #[serde(default = "default_max_flying_memory_mb")]
    pub max_flying_memory_mb: u64,

    /// Number of concurrent disk-tier insertions.  Clamped to at least one.
    #[serde(default = "default_max_concurrent_inserts")]
    pub max_concurrent_inserts: u32,

    /// When in-flight memory is saturated, block the writer until a slot
    /// frees (true) or fail the write with `ResourceExhausted` (false).
    #[serde(default = "default_blocking_admission")]
    pub blocking_admission: bool,

    /// Storage engine selection.
    #[serde(default = "default_engine")]
    pub engine: CacheEngine,
}

impl CacheOptions {
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(CacheError::InvalidArgument(format!(
                "block_size must be a non-zero power of two, got {}",
                self.block_size
            )));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(CacheError::InvalidArgument(format!(
                "block_size {} exceeds the maximum of {}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if matches!(self.engine, CacheEngine::Hybrid) && self.disk_spaces.is_empty() {
            return Err(CacheError::InvalidArgument(
                "hybrid engine requires at least one disk space".to_string(),
            ));
        }
        for space in &self.disk_spaces {
            if space.size < MIN_DISK_SPACE_SIZE {
                return Err(CacheError::InvalidArgument(format!(
                    "disk space {} holds {} bytes, the minimum is {}",
                    space.path.display(),
                    space.size,
                    MIN_DISK_SPACE_SIZE
                )));
            }
        }
        Ok(())
    }

    /// Writer-pool width after clamping.
    pub fn concurrent_inserts(&self) -> usize {
        self.max_concurrent_inserts.max(1) as usize
    }

    /// In-flight byte budget, or `None` when unbounded.
    pub fn flying_memory_bytes(&self) -> Option<u64> {
        match self.max_flying_memory_mb {
            0 => None,
            mb => Some(mb * 1024 * 1024),
        }
    }
}
