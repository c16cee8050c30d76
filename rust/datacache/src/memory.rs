//! Sharded in-memory tier and the memory-only engine built on it.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{CacheBackend, WriteOptions};
use crate::buffer::IOBuffer;
use crate::config::{CacheOptions, DirSpace};
use crate::error::CacheError;
use crate::lru::{CacheValue, InsertError, Lookup, LruShard};
use crate::metrics::{CacheCounters, DataCacheMetrics};
use crate::stats;

struct Shard {
    lru: Mutex<LruShard>,
    bytes: AtomicU64,
}

/// Hash-sharded memory tier.  Shard count is the smallest power of two that
/// covers the CPU count; the byte quota is split evenly across shards so
/// eviction stays shard-local.
pub(crate) struct MemoryTier {
    shards: Vec<Shard>,
    quota: AtomicU64,
}

impl MemoryTier {
    pub(crate) fn new(quota: u64) -> Self {
        let shard_count = num_cpus::get().next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| Shard {
                lru: Mutex::new(LruShard::new(quota / shard_count as u64)),
                bytes: AtomicU64::new(0),
            })
            .collect();
        Self {
            shards,
            quota: AtomicU64::new(quota),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::default();
        key.hash(&mut hasher);
        // Shard count is a power of two.
        &self.shards[hasher.finish() as usize & (self.shards.len() - 1)]
    }

    /// Insert, returning how many entries eviction displaced.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        value: CacheValue,
        overwrite: bool,
    ) -> Result<usize, InsertError> {
        let shard = self.shard(key);
        let mut lru = shard.lru.lock();
        let evicted = lru.insert(key, value, overwrite, Instant::now())?;
        shard.bytes.store(lru.bytes_used(), Ordering::Relaxed);
        Ok(evicted.len())
    }

    pub(crate) fn get(&self, key: &[u8]) -> Lookup {
        let shard = self.shard(key);
        let mut lru = shard.lru.lock();
        let lookup = lru.get(key, Instant::now());
        shard.bytes.store(lru.bytes_used(), Ordering::Relaxed);
        lookup
    }

    pub(crate) fn contains_live(&self, key: &[u8]) -> bool {
        self.shard(key).lru.lock().contains_live(key, Instant::now())
    }

    pub(crate) fn remove(&self, key: &[u8]) -> bool {
        let shard = self.shard(key);
        let mut lru = shard.lru.lock();
        let removed = lru.remove(key).is_some();
        shard.bytes.store(lru.bytes_used(), Ordering::Relaxed);
        removed
    }

    /// Whether `key`'s shard could absorb `payload_len` more bytes without
    /// evicting.  Used by the disk tier's promotion policy.
    pub(crate) fn has_room_for(&self, key: &[u8], payload_len: usize) -> bool {
        let charge = (key.len() + payload_len) as u64;
        self.shard(key).lru.lock().has_room_for(charge)
    }

    pub(crate) fn set_quota(&self, quota: u64) -> usize {
        self.quota.store(quota, Ordering::Relaxed);
        let per_shard = quota / self.shards.len() as u64;
        let mut evicted = 0;
        for shard in &self.shards {
            let mut lru = shard.lru.lock();
            evicted += lru.set_quota(per_shard).len();
            shard.bytes.store(lru.bytes_used(), Ordering::Relaxed);
        }
        evicted
    }

    pub(crate) fn quota(&self) -> u64 {
        self.quota.load(Ordering::Relaxed)
    }

    /// Lazily-aggregated byte usage across shards.
    pub(crate) fn bytes_used(&self) -> u64 {
        self.shards
            .iter()
            .map(|shard| shard.bytes.load(Ordering::Relaxed))
            .sum()
    }
}

/// The memory-only engine: the sharded tier plus counters and the stats
/// file lifecycle.
pub struct MemoryCacheBackend {
    tier: MemoryTier,
    counters: Arc<CacheCounters>,
    meta_path: PathBuf,
    restored: BTreeMap<String, f64>,
    stats_dumped: Mutex<bool>,
}

impl MemoryCacheBackend {
    pub fn new(options: &CacheOptions) -> Self {
        Self {
            tier: MemoryTier::new(options.mem_space_size),
            counters: Arc::new(CacheCounters::default()),
            meta_path: options.meta_path.clone(),
            restored: stats::load_stats(&options.meta_path),
            stats_dumped: Mutex::new(false),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn write_buffer(
        &self,
        key_fp: &[u8],
        buffer: &IOBuffer<'_>,
        options: &WriteOptions,
    ) -> Result<(), CacheError> {
        let payload: Arc<[u8]> = buffer.to_vec().into();
        let value = CacheValue::new(payload, options.ttl_seconds);
        match self.tier.insert(key_fp, value, options.overwrite) {
            Ok(evicted) => {
                self.counters
                    .mem_evicted_count
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(InsertError::AlreadyExists) => Err(CacheError::AlreadyExists),
        }
    }

    async fn read_buffer(
        &self,
        key_fp: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<IOBuffer<'static>, CacheError> {
        match self.tier.get(key_fp) {
            Lookup::Hit(payload) => slice_payload(payload, offset, size).map(|buffer| {
                self.counters.record_hit();
                buffer
            }),
            Lookup::Expired => {
                self.counters.expired_count.fetch_add(1, Ordering::Relaxed);
                self.counters.record_miss();
                Err(CacheError::NotFound)
            }
            Lookup::Miss => {
                self.counters.record_miss();
                Err(CacheError::NotFound)
            }
        }
    }

    async fn remove(&self, key_fp: &[u8]) -> Result<(), CacheError> {
        self.tier.remove(key_fp);
        Ok(())
    }

    async fn write_object(
        &self,
        _key_fp: &[u8],
        _data: &[u8],
        _options: &WriteOptions,
    ) -> Result<(), CacheError> {
        Err(CacheError::NotSupported(
            "object cache is not supported by the memory engine",
        ))
    }

    async fn read_object(&self, _key_fp: &[u8]) -> Result<IOBuffer<'static>, CacheError> {
        Err(CacheError::NotSupported(
            "object cache is not supported by the memory engine",
        ))
    }

    async fn update_mem_quota(&self, quota_bytes: u64) -> Result<(), CacheError> {
        let evicted = self.tier.set_quota(quota_bytes);
        self.counters
            .mem_evicted_count
            .fetch_add(evicted as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn update_disk_spaces(&self, _spaces: &[DirSpace]) -> Result<(), CacheError> {
        Err(CacheError::NotSupported(
            "the memory engine has no disk spaces",
        ))
    }

    fn cache_metrics(&self, level: usize) -> DataCacheMetrics {
        let mut snapshot = DataCacheMetrics {
            mem_quota: self.tier.quota(),
            mem_bytes_used: self.tier.bytes_used(),
            ..Default::default()
        };
        self.counters.fill_snapshot(&mut snapshot);
        if level >= 1 {
            snapshot.detail = self.counters.export();
            for (name, value) in &self.restored {
                snapshot.detail.insert(format!("restored::{}", name), *value);
            }
        }
        snapshot
    }

    async fn shutdown(&self) -> Result<(), CacheError> {
        let mut dumped = self.stats_dumped.lock();
        if *dumped {
            return Ok(());
        }
        stats::dump_stats(&self.meta_path, &self.counters.export())?;
        *dumped = true;
        Ok(())
    }

    fn record_read_remote(&self, bytes: u64, latency_us: u64) {
        self.counters.record_read_remote(bytes, latency_us);
    }

    fn record_read_cache(&self, bytes: u64, latency_us: u64) {
        self.counters.record_read_cache(bytes, latency_us);
    }
}

/// Build the read result for a payload slice.  A request that starts past
/// the end of the entry is invalid; one that merely overruns it is clipped
/// (the final block of a file may be short).
pub(crate) fn slice_payload(
    payload: Arc<[u8]>,
    offset: u64,
    size: u64,
) -> Result<IOBuffer<'static>, CacheError> {
    let len = payload.len() as u64;
    if offset > len {
        return Err(CacheError::InvalidArgument(format!(
            "read offset {} is past the end of a {} byte entry",
            offset, len
        )));
    }
    let take = size.min(len - offset);
    let mut buffer = IOBuffer::new();
    if take > 0 {
        buffer.append_shared(payload, offset as usize, take as usize);
    }
    Ok(buffer)
}
