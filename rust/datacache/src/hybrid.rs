//! Hybrid engine: the sharded memory tier in front of the region-based
//! disk tier.
//!
//! Writes land in the memory tier first and are then admitted into a
//! bounded writer pool that appends them to disk regions.  Admission is
//! gated twice: a byte-denominated semaphore caps unflushed in-flight
//! memory, and the pool width caps concurrent insertions.  Reads consult
//! the memory tier, then the disk index, promoting disk hits back into
//! memory when there is headroom.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{CacheBackend, WriteOptions};
use crate::buffer::IOBuffer;
use crate::config::{CacheOptions, DirSpace};
use crate::disk::DiskTier;
use crate::error::CacheError;
use crate::lru::{CacheValue, InsertError, Lookup};
use crate::memory::{slice_payload, MemoryTier};
use crate::metrics::{CacheCounters, DataCacheMetrics};
use crate::region::entry_frame_len;
use crate::stats;

/// One pending disk insertion.  The permit returns its bytes to the
/// in-flight budget when the job is done.
struct WriteJob {
    key: Box<[u8]>,
    payload: Arc<[u8]>,
    deadline: Option<Instant>,
    _permit: Option<OwnedSemaphorePermit>,
}

pub struct HybridCacheBackend {
    mem: MemoryTier,
    disk: Arc<DiskTier>,
    counters: Arc<CacheCounters>,
    meta_path: PathBuf,
    restored: BTreeMap<String, f64>,
    flying: Option<Arc<Semaphore>>,
    flying_cap: u64,
    blocking_admission: bool,
    queue: Mutex<Option<crossbeam_channel::Sender<WriteJob>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    shutdown_done: Mutex<bool>,
}

impl HybridCacheBackend {
    pub fn new(options: &CacheOptions) -> Result<Self, CacheError> {
        let counters = Arc::new(CacheCounters::default());
        let disk = Arc::new(DiskTier::open(
            &options.disk_spaces,
            options.enable_checksum,
            Arc::clone(&counters),
        )?);
        let writer_count = options.concurrent_inserts();
        let (tx, rx) = crossbeam_channel::bounded::<WriteJob>(writer_count * 8);
        let mut workers = Vec::with_capacity(writer_count);
        for i in 0..writer_count {
            let disk = Arc::clone(&disk);
            let counters = Arc::clone(&counters);
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("datacache-writer-{i}"))
                .spawn(move || writer_loop(disk, counters, rx))?;
            workers.push(handle);
        }
        let flying_cap = options.flying_memory_bytes();
        Ok(Self {
            mem: MemoryTier::new(options.mem_space_size),
            disk,
            counters,
            meta_path: options.meta_path.clone(),
            restored: stats::load_stats(&options.meta_path),
            flying: flying_cap.map(|bytes| Arc::new(Semaphore::new(bytes as usize))),
            flying_cap: flying_cap.unwrap_or(0),
            blocking_admission: options.blocking_admission,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutdown_done: Mutex::new(false),
        })
    }

    /// Claim in-flight budget for a frame.  Blocks or fails according to
    /// the configured admission mode.
    async fn admit(&self, frame_len: u64) -> Result<Option<OwnedSemaphorePermit>, CacheError> {
        let Some(flying) = &self.flying else {
            return Ok(None);
        };
        // A frame larger than the whole budget still has to pass through.
        let want = frame_len.min(self.flying_cap) as u32;
        if self.blocking_admission {
            match Arc::clone(flying).acquire_many_owned(want).await {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => Err(CacheError::Internal(
                    "in-flight admission semaphore closed".to_string(),
                )),
            }
        } else {
            match Arc::clone(flying).try_acquire_many_owned(want) {
                Ok(permit) => Ok(Some(permit)),
                Err(_) => {
                    self.counters
                        .admission_reject_count
                        .fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::ResourceExhausted(
                        "in-flight disk write budget is saturated".to_string(),
                    ))
                }
            }
        }
    }

    fn enqueue(&self, job: WriteJob) -> Result<(), CacheError> {
        let Some(sender) = self.queue.lock().clone() else {
            // Shutdown already closed the queue; the memory tier keeps the
            // entry so the write stands.
            return Ok(());
        };
        if self.blocking_admission {
            sender
                .send(job)
                .map_err(|_| CacheError::Internal("disk writer queue closed".to_string()))
        } else {
            match sender.try_send(job) {
                Ok(()) => Ok(()),
                Err(crossbeam_channel::TrySendError::Full(_)) => {
                    self.counters
                        .admission_reject_count
                        .fetch_add(1, Ordering::Relaxed);
                    Err(CacheError::ResourceExhausted(
                        "disk writer queue is full".to_string(),
                    ))
                }
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(
                    CacheError::Internal("disk writer queue closed".to_string()),
                ),
            }
        }
    }
}

fn writer_loop(
    disk: Arc<DiskTier>,
    counters: Arc<CacheCounters>,
    rx: crossbeam_channel::Receiver<WriteJob>,
) {
    while let Ok(job) = rx.recv() {
        if let Err(err) = disk.insert(&job.key, &job.payload, job.deadline) {
            counters
                .disk_write_fail_count
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, "disk insert failed; entry stays memory-only");
        }
    }
}

#[async_trait]
impl CacheBackend for HybridCacheBackend {
    #[tracing::instrument(skip(self, key_fp, buffer))]
    async fn write_buffer(
        &self,
        key_fp: &[u8],
        buffer: &IOBuffer<'_>,
        options: &WriteOptions,
    ) -> Result<(), CacheError> {
        if !options.overwrite
            && (self.mem.contains_live(key_fp) || self.disk.contains_live(key_fp))
        {
            return Err(CacheError::AlreadyExists);
        }
        let payload: Arc<[u8]> = buffer.to_vec().into();
        let value = CacheValue::new(Arc::clone(&payload), options.ttl_seconds);
        let deadline = value.deadline;
        match self.mem.insert(key_fp, value, options.overwrite) {
            Ok(evicted) => {
                self.counters
                    .mem_evicted_count
                    .fetch_add(evicted as u64, Ordering::Relaxed);
            }
            Err(InsertError::AlreadyExists) => return Err(CacheError::AlreadyExists),
        }
        let frame_len = entry_frame_len(key_fp.len(), payload.len());
        if frame_len > self.disk.max_frame_len() {
            tracing::debug!(
                bytes = payload.len(),
                "entry exceeds region capacity; kept memory-only"
            );
            return Ok(());
        }
        let permit = self.admit(frame_len).await?;
        self.enqueue(WriteJob {
            key: key_fp.to_vec().into_boxed_slice(),
            payload,
            deadline,
            _permit: permit,
        })
    }

    #[tracing::instrument(skip(self, key_fp))]
    async fn read_buffer(
        &self,
        key_fp: &[u8],
        offset: u64,
        size: u64,
    ) -> Result<IOBuffer<'static>, CacheError> {
        match self.mem.get(key_fp) {
            Lookup::Hit(payload) => {
                self.counters.record_hit();
                return slice_payload(payload, offset, size);
            }
            Lookup::Expired => {
                self.counters.expired_count.fetch_add(1, Ordering::Relaxed);
                // The disk copy carries the same deadline; fall through so
                // it gets unpublished too.
            }
            Lookup::Miss => {}
        }
        match self.disk.read(key_fp) {
            Ok((payload, deadline)) => {
                self.counters.record_hit();
                if self.mem.has_room_for(key_fp, payload.len()) {
                    let promoted = CacheValue {
                        payload: Arc::clone(&payload),
                        deadline,
                    };
                    let _ = self.mem.insert(key_fp, promoted, true);
                }
                slice_payload(payload, offset, size)
            }
            Err(CacheError::NotFound) => {
                self.counters.record_miss();
                Err(CacheError::NotFound)
            }
            Err(other) => Err(other),
        }
    }

    async fn remove(&self, key_fp: &[u8]) -> Result<(), CacheError> {
        self.mem.remove(key_fp);
        self.disk.remove(key_fp);
        Ok(())
    }

    async fn write_object(
        &self,
        _key_fp: &[u8],
        _data: &[u8],
        _options: &WriteOptions,
    ) -> Result<(), CacheError> {
        Err(CacheError::NotSupported(
            "object cache is not supported by the hybrid engine",
        ))
    }

    async fn read_object(&self, _key_fp: &[u8]) -> Result<IOBuffer<'static>, CacheError> {
        Err(CacheError::NotSupported(
            "object cache is not supported by the hybrid engine",
        ))
    }

    async fn update_mem_quota(&self, _quota_bytes: u64) -> Result<(), CacheError> {
        Err(CacheError::NotSupported(
            "the hybrid engine does not resize its memory tier",
        ))
    }

    async fn update_disk_spaces(&self, _spaces: &[DirSpace]) -> Result<(), CacheError> {
        Err(CacheError::NotSupported(
            "the hybrid engine does not resize its disk spaces",
        ))
    }

    fn cache_metrics(&self, level: usize) -> DataCacheMetrics {
        let mut snapshot = DataCacheMetrics {
            mem_quota: self.mem.quota(),
            mem_bytes_used: self.mem.bytes_used(),
            disk_quota: self.disk.quota(),
            disk_bytes_used: self.disk.bytes_used(),
            ..Default::default()
        };
        self.counters.fill_snapshot(&mut snapshot);
        if level >= 1 {
            snapshot.detail = self.counters.export();
            self.disk.detail_into(&mut snapshot.detail);
            for (name, value) in &self.restored {
                snapshot.detail.insert(format!("restored::{}", name), *value);
            }
        }
        snapshot
    }

    async fn shutdown(&self) -> Result<(), CacheError> {
        let mut done = self.shutdown_done.lock();
        if *done {
            return Ok(());
        }
        // Closing the queue lets the writers drain what is already admitted
        // and then exit.
        self.queue.lock().take();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                return Err(CacheError::Internal(
                    "a disk writer thread panicked".to_string(),
                ));
            }
        }
        stats::dump_stats(&self.meta_path, &self.counters.export())?;
        *done = true;
        tracing::info!(meta = %self.meta_path.display(), "data cache shut down; stats persisted");
        Ok(())
    }

    fn record_read_remote(&self, bytes: u64, latency_us: u64) {
        self.counters.record_read_remote(bytes, latency_us);
    }

    fn record_read_cache(&self, bytes: u64, latency_us: u64) {
        self.counters.record_read_cache(bytes, latency_us);
    }
}
