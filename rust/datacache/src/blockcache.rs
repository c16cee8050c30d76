//! The block cache facade: lifecycle, alignment enforcement, key
//! composition, and dispatch to the configured engine.
//!
//! The rest of the backend addresses cached bytes as `(key, offset)` pairs
//! with `offset` aligned to the configured block size.  The facade composes
//! a backend fingerprint `key || offset_be` per block entry, so different
//! offsets of the same logical object are independent entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::backend::{CacheBackend, WriteOptions};
use crate::buffer::IOBuffer;
use crate::config::{CacheEngine, CacheOptions, MAX_BLOCK_SIZE};
use crate::error::CacheError;
use crate::hybrid::HybridCacheBackend;
use crate::memory::MemoryCacheBackend;
use crate::metrics::{DataCacheMetrics, FacadeMetrics, Stopwatch};

static BLOCK_CACHE: Lazy<BlockCache> = Lazy::new(BlockCache::new);

struct Engine {
    backend: Arc<dyn CacheBackend>,
    block_size: u64,
}

/// Process-wide two-tier block cache.
///
/// The singleton is reached through [`BlockCache::instance`]; tests build
/// fresh instances with [`BlockCache::new`] so lifecycle tests do not fight
/// over process state.
pub struct BlockCache {
    engine: RwLock<Option<Engine>>,
    initialized: AtomicBool,
    metrics: FacadeMetrics,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    /// A fresh, uninitialized instance.  Production code wants
    /// [`BlockCache::instance`] instead.
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(None),
            initialized: AtomicBool::new(false),
            metrics: FacadeMetrics::default(),
        }
    }

    /// The process-wide instance, created lazily.
    pub fn instance() -> &'static BlockCache {
        &BLOCK_CACHE
    }

    /// Build the configured engine and arm the instance.  Fails on a second
    /// call unless [`BlockCache::shutdown`] ran in between.
    pub async fn init(&self, options: &CacheOptions) -> Result<(), CacheError> {
        options.validate()?;
        let mut engine = self.engine.write();
        if engine.is_some() {
            return Err(CacheError::AlreadyInitialized);
        }
        let backend: Arc<dyn CacheBackend> = match options.engine {
            CacheEngine::MemoryOnly => Arc::new(MemoryCacheBackend::new(options)),
            CacheEngine::Hybrid => Arc::new(HybridCacheBackend::new(options)?),
        };
        *engine = Some(Engine {
            backend,
            block_size: options.block_size,
        });
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            block_size = options.block_size,
            engine = ?options.engine,
            "block cache initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// The configured block size, or zero before `init`.
    pub fn block_size(&self) -> u64 {
        self.engine
            .read()
            .as_ref()
            .map(|engine| engine.block_size)
            .unwrap_or(0)
    }

    fn engine_handle(&self) -> Result<(Arc<dyn CacheBackend>, u64), CacheError> {
        let engine = self.engine.read();
        match engine.as_ref() {
            Some(engine) => Ok((Arc::clone(&engine.backend), engine.block_size)),
            None => Err(CacheError::Uninitialized),
        }
    }

    /// Store `buffer` at `(key, offset)`, one backend entry per covered
    /// block.  `offset` must be block-aligned; the buffer need not be a
    /// multiple of the block size (the final block of a file is short).
    #[tracing::instrument(skip(self, key, buffer), fields(bytes = buffer.size()))]
    pub async fn write_cache(
        &self,
        key: &[u8],
        offset: u64,
        buffer: &IOBuffer<'_>,
        ttl_seconds: u64,
        overwrite: bool,
    ) -> Result<(), CacheError> {
        let _stopwatch = Stopwatch::new(&self.metrics.write_latency_us);
        let (backend, block_size) = self.engine_handle()?;
        check_aligned("offset", offset, block_size)?;
        if buffer.is_empty() {
            return Err(CacheError::InvalidArgument(
                "cannot cache an empty buffer".to_string(),
            ));
        }
        let options = WriteOptions {
            overwrite,
            ttl_seconds,
        };
        // The common case is a single block; skip the copy-out.
        if buffer.size() as u64 <= block_size {
            let key_fp = compose_fingerprint(key, offset);
            return backend.write_buffer(&key_fp, buffer, &options).await;
        }
        let bytes = buffer.to_vec();
        let mut start = 0usize;
        let mut block_offset = offset;
        while start < bytes.len() {
            let end = (start + block_size as usize).min(bytes.len());
            let chunk: IOBuffer<'_> = (&bytes[start..end]).into();
            let key_fp = compose_fingerprint(key, block_offset);
            backend.write_buffer(&key_fp, &chunk, &options).await?;
            start = end;
            block_offset += block_size;
        }
        Ok(())
    }

    /// Convenience wrapper for writing a borrowed slice.
    pub async fn write_cache_slice(
        &self,
        key: &[u8],
        offset: u64,
        data: &[u8],
        ttl_seconds: u64,
        overwrite: bool,
    ) -> Result<(), CacheError> {
        let buffer: IOBuffer<'_> = data.into();
        self.write_cache(key, offset, &buffer, ttl_seconds, overwrite)
            .await
    }

    /// Read `size` bytes at `(key, offset)`, block by block.  Both must be
    /// block-aligned and `size` non-zero.  A miss on any covered block is
    /// `NotFound`; the result is shorter than `size` only when the final
    /// cached block itself is.
    #[tracing::instrument(skip(self, key))]
    pub async fn read_cache(
        &self,
        key: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<IOBuffer<'static>, CacheError> {
        let _stopwatch = Stopwatch::new(&self.metrics.read_latency_us);
        let (backend, block_size) = self.engine_handle()?;
        check_aligned("offset", offset, block_size)?;
        check_aligned("size", size, block_size)?;
        if size == 0 {
            return Err(CacheError::InvalidArgument(
                "read size must be non-zero".to_string(),
            ));
        }
        let mut out = IOBuffer::new();
        for i in 0..size / block_size {
            let key_fp = compose_fingerprint(key, offset + i * block_size);
            let chunk = backend.read_buffer(&key_fp, 0, block_size).await?;
            let short = (chunk.size() as u64) < block_size;
            out.append_buffer(chunk);
            if short {
                // A short block is the tail of the cached object.
                break;
            }
        }
        Ok(out)
    }

    /// Drop every block entry in `[offset, offset + size)`.  Removing an
    /// absent block is not an error.
    #[tracing::instrument(skip(self, key))]
    pub async fn remove_cache(&self, key: &[u8], offset: u64, size: u64) -> Result<(), CacheError> {
        let _stopwatch = Stopwatch::new(&self.metrics.remove_latency_us);
        let (backend, block_size) = self.engine_handle()?;
        check_aligned("offset", offset, block_size)?;
        check_aligned("size", size, block_size)?;
        for i in 0..size / block_size {
            let key_fp = compose_fingerprint(key, offset + i * block_size);
            backend.remove(&key_fp).await?;
        }
        Ok(())
    }

    /// Point-in-time counter snapshot including backend detail pairs.
    pub fn cache_metrics(&self) -> DataCacheMetrics {
        match self.engine.read().as_ref() {
            Some(engine) => engine.backend.cache_metrics(1),
            None => DataCacheMetrics::default(),
        }
    }

    /// Report a read the caller had to serve from remote storage.
    pub fn record_read_remote(&self, bytes: u64, latency_us: u64) {
        if let Some(engine) = self.engine.read().as_ref() {
            engine.backend.record_read_remote(bytes, latency_us);
        }
    }

    /// Report a read served from this cache.
    pub fn record_read_cache(&self, bytes: u64, latency_us: u64) {
        if let Some(engine) = self.engine.read().as_ref() {
            engine.backend.record_read_cache(bytes, latency_us);
        }
    }

    /// Drain pending work, persist statistics, and disarm the instance.
    /// Safe to call before `init` and safe to call twice.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        let backend = {
            let mut engine = self.engine.write();
            self.initialized.store(false, Ordering::Release);
            engine.take().map(|engine| engine.backend)
        };
        match backend {
            Some(backend) => backend.shutdown().await,
            None => Ok(()),
        }
    }
}

fn check_aligned(what: &str, value: u64, block_size: u64) -> Result<(), CacheError> {
    if value % block_size != 0 {
        return Err(CacheError::InvalidArgument(format!(
            "{} {} is not aligned to the {} byte block size",
            what, value, block_size
        )));
    }
    Ok(())
}

/// `key || u64_be(offset)`: entries at different offsets of one logical key
/// are distinct backend entries.
fn compose_fingerprint(key: &[u8], offset: u64) -> Vec<u8> {
    let mut fp = Vec::with_capacity(key.len() + 8);
    fp.extend_from_slice(key);
    fp.extend_from_slice(&offset.to_be_bytes());
    fp
}

const _: () = assert!(MAX_BLOCK_SIZE.is_power_of_two());
