//! Storage backend abstraction behind the block cache facade.

use async_trait::async_trait;

use crate::buffer::IOBuffer;
use crate::config::DirSpace;
use crate::error::CacheError;
use crate::metrics::DataCacheMetrics;

/// Per-write options forwarded from the facade.
#[derive(Clone, Copy, Debug)]
pub struct WriteOptions {
    /// Replace an existing entry instead of failing with `AlreadyExists`.
    pub overwrite: bool,
    /// Seconds until expiry; zero means no expiry.
    pub ttl_seconds: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            overwrite: true,
            ttl_seconds: 0,
        }
    }
}

/// Capability set every cache engine provides.  Backends treat `key_fp` as
/// an opaque byte string; the facade owns its composition.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store `buffer` under `key_fp`.
    async fn write_buffer(
        &self,
        key_fp: &[u8],
        buffer: &IOBuffer<'_>,
        options: &WriteOptions,
    ) -> Result<(), CacheError>;

    /// Read up to `size` bytes starting at `offset` within the entry stored
    /// under `key_fp`.  The returned buffer is shorter than `size` only when
    /// the entry itself is (the final block of a file may be short).
    async fn read_buffer(
        &self,
        key_fp: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<IOBuffer<'static>, CacheError>;

    /// Remove the entry under `key_fp`.  Absence is not an error.
    async fn remove(&self, key_fp: &[u8]) -> Result<(), CacheError>;

    /// Store an opaque object handle.  Not every engine supports objects.
    async fn write_object(
        &self,
        key_fp: &[u8],
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<(), CacheError>;

    /// Read back an opaque object handle.
    async fn read_object(&self, key_fp: &[u8]) -> Result<IOBuffer<'static>, CacheError>;

    /// Replace the memory tier quota.
    async fn update_mem_quota(&self, quota_bytes: u64) -> Result<(), CacheError>;

    /// Replace the disk space layout.
    async fn update_disk_spaces(&self, spaces: &[DirSpace]) -> Result<(), CacheError>;

    /// Point-in-time counter snapshot.  Level 0 omits backend-specific
    /// detail pairs; level >= 1 includes them.  Never fails.
    fn cache_metrics(&self, level: usize) -> DataCacheMetrics;

    /// Drain pending work and persist statistics.  Safe to call once; later
    /// calls are no-ops.
    async fn shutdown(&self) -> Result<(), CacheError>;

    /// Record a read served by remote storage (a cache miss made good).
    fn record_read_remote(&self, bytes: u64, latency_us: u64);

    /// Record a read served by this cache.
    fn record_read_cache(&self, bytes: u64, latency_us: u64);
}
