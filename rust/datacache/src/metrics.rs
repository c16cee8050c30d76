//! Counters and the point-in-time metrics snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::metrics::Histogram;

/// Immutable snapshot of cache counters.  Fields are sampled independently;
/// callers must not assume they are mutually consistent.
#[derive(Clone, Debug, Default)]
pub struct DataCacheMetrics {
    pub mem_quota: u64,
    pub mem_bytes_used: u64,
    pub disk_quota: u64,
    pub disk_bytes_used: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub remote_read_bytes: u64,
    pub remote_read_latency_us_sum: u64,
    pub cache_read_bytes: u64,
    pub cache_read_latency_us_sum: u64,
    /// Backend-specific pairs, present at detail level >= 1.
    pub detail: BTreeMap<String, f64>,
}

/// Monotonic counters shared by a backend and its writer pool.
#[derive(Default)]
pub(crate) struct CacheCounters {
    pub(crate) hit_count: AtomicU64,
    pub(crate) miss_count: AtomicU64,
    pub(crate) remote_read_bytes: AtomicU64,
    pub(crate) remote_read_latency_us: AtomicU64,
    pub(crate) cache_read_bytes: AtomicU64,
    pub(crate) cache_read_latency_us: AtomicU64,
    pub(crate) mem_evicted_count: AtomicU64,
    pub(crate) expired_count: AtomicU64,
    pub(crate) disk_insert_count: AtomicU64,
    pub(crate) disk_write_fail_count: AtomicU64,
    pub(crate) disk_reclaimed_regions: AtomicU64,
    pub(crate) checksum_fail_count: AtomicU64,
    pub(crate) admission_reject_count: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_remote(&self, bytes: u64, latency_us: u64) {
        self.remote_read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.remote_read_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
    }

    pub(crate) fn record_read_cache(&self, bytes: u64, latency_us: u64) {
        self.cache_read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.cache_read_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);
    }

    /// Fold every counter into `name : value` pairs for the stats file and
    /// the detailed snapshot.
    pub(crate) fn export(&self) -> BTreeMap<String, f64> {
        let mut pairs = BTreeMap::new();
        let mut put = |name: &str, value: &AtomicU64| {
            pairs.insert(name.to_string(), value.load(Ordering::Relaxed) as f64);
        };
        put("hit_count", &self.hit_count);
        put("miss_count", &self.miss_count);
        put("remote_read_bytes", &self.remote_read_bytes);
        put("remote_read_latency_us_sum", &self.remote_read_latency_us);
        put("cache_read_bytes", &self.cache_read_bytes);
        put("cache_read_latency_us_sum", &self.cache_read_latency_us);
        put("mem_evicted_count", &self.mem_evicted_count);
        put("expired_count", &self.expired_count);
        put("disk_insert_count", &self.disk_insert_count);
        put("disk_write_fail_count", &self.disk_write_fail_count);
        put("disk_reclaimed_regions", &self.disk_reclaimed_regions);
        put("checksum_fail_count", &self.checksum_fail_count);
        put("admission_reject_count", &self.admission_reject_count);
        pairs
    }

    pub(crate) fn fill_snapshot(&self, snapshot: &mut DataCacheMetrics) {
        snapshot.hit_count = self.hit_count.load(Ordering::Relaxed);
        snapshot.miss_count = self.miss_count.load(Ordering::Relaxed);
        snapshot.remote_read_bytes = self.remote_read_bytes.load(Ordering::Relaxed);
        snapshot.remote_read_latency_us_sum = self.remote_read_latency_us.load(Ordering::Relaxed);
        snapshot.cache_read_bytes = self.cache_read_bytes.load(Ordering::Relaxed);
        snapshot.cache_read_latency_us_sum = self.cache_read_latency_us.load(Ordering::Relaxed);
    }
}

/// Per-operation latency instruments registered under the
/// `quarry.datacache` meter.
#[derive(Clone)]
pub(crate) struct FacadeMetrics {
    pub(crate) read_latency_us: Histogram<u64>,
    pub(crate) write_latency_us: Histogram<u64>,
    pub(crate) remove_latency_us: Histogram<u64>,
}

impl Default for FacadeMetrics {
    fn default() -> Self {
        Self {
            read_latency_us: opentelemetry::global::meter("quarry.datacache")
                .u64_histogram("read_latency_us")
                .with_description("Latency of read_cache operations in microseconds")
                .with_unit("us")
                .build(),
            write_latency_us: opentelemetry::global::meter("quarry.datacache")
                .u64_histogram("write_latency_us")
                .with_description("Latency of write_cache operations in microseconds")
                .with_unit("us")
                .build(),
            remove_latency_us: opentelemetry::global::meter("quarry.datacache")
                .u64_histogram("remove_latency_us")
                .with_description("Latency of remove_cache operations in microseconds")
                .with_unit("us")
                .build(),
        }
    }
}

/// Records elapsed microseconds into a histogram when dropped.
pub(crate) struct Stopwatch<'a>(&'a Histogram<u64>, std::time::Instant);

impl<'a> Stopwatch<'a> {
    pub(crate) fn new(histogram: &'a Histogram<u64>) -> Self {
        Self(histogram, std::time::Instant::now())
    }
}

impl Drop for Stopwatch<'_> {
    fn drop(&mut self) {
        let elapsed = self.1.elapsed().as_micros() as u64;
        self.0.record(elapsed, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_carries_every_counter() {
        let counters = CacheCounters::default();
        counters.record_hit();
        counters.record_hit();
        counters.record_miss();
        counters.record_read_cache(4096, 17);
        let pairs = counters.export();
        assert_eq!(pairs["hit_count"], 2.0);
        assert_eq!(pairs["miss_count"], 1.0);
        assert_eq!(pairs["cache_read_bytes"], 4096.0);
        assert_eq!(pairs["cache_read_latency_us_sum"], 17.0);
        assert!(pairs.contains_key("disk_reclaimed_regions"));
    }

    #[test]
    fn snapshot_reflects_counters() {
        let counters = CacheCounters::default();
        counters.record_miss();
        counters.record_read_remote(1024, 250);
        let mut snapshot = DataCacheMetrics::default();
        counters.fill_snapshot(&mut snapshot);
        assert_eq!(snapshot.miss_count, 1);
        assert_eq!(snapshot.remote_read_bytes, 1024);
        assert_eq!(snapshot.remote_read_latency_us_sum, 250);
    }
}
