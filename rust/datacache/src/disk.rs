//! Log-structured disk tier: region allocation, FIFO reclamation, and the
//! in-memory index over region extents.
//!
//! Every configured directory holds one pre-sized data file partitioned
//! into fixed-size regions (16 MiB unless a space is smaller).  Entries
//! append to the open region; a full
//! region is sealed and a fresh one is taken from the free list, reclaiming
//! the oldest sealed region when the list runs dry.  The index maps key
//! fingerprints to absolute payload extents and is rebuilt empty on every
//! startup; regions carry no recoverable state across restarts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{DirSpace, CACHE_DATA_FILE, REGION_SIZE};
use crate::error::CacheError;
use crate::metrics::CacheCounters;
use crate::region::{
    encode_entry, entry_frame_len, payload_checksum, payload_offset, RegionHeader,
    REGION_HEADER_SIZE,
};

const INDEX_SHARDS: usize = 64;
const ZERO_CHUNK: usize = 256 * 1024;

/// Where an entry's payload lives on disk.  Geometry is fixed at startup,
/// so a location needs no region-table lookup to read.
#[derive(Clone, Copy, PartialEq, Eq)]
struct DiskLocation {
    region_id: u32,
    file_idx: u32,
    /// Absolute offset of the payload within the file.
    abs_off: u64,
    payload_len: u32,
    checksum: u32,
    deadline: Option<Instant>,
}

struct Region {
    file_idx: usize,
    /// Absolute offset of the region within its file.
    file_off: u64,
    /// Next append offset relative to the region start.
    write_off: u64,
    entry_count: u64,
    /// Keys appended into this region, consulted on reclamation.
    keys: Vec<Box<[u8]>>,
    /// Reservations whose physical write has not completed yet.  A region
    /// with a writer in flight must not be reclaimed: the reservation's
    /// extent would be zeroed and handed out again under its feet.
    pending_writers: u32,
    sealed: bool,
}

impl Region {
    fn bytes_used(&self) -> u64 {
        self.write_off - REGION_HEADER_SIZE
    }
}

struct RegionTable {
    regions: Vec<Region>,
    free: VecDeque<u32>,
    /// Sealed regions in seal order; the front is the reclamation victim.
    sealed: VecDeque<u32>,
    open: u32,
}

pub(crate) struct DiskTier {
    files: Vec<File>,
    table: Mutex<RegionTable>,
    /// Wakes writers stuck allocating because every sealed region still has
    /// a write lease outstanding.
    reclaim_cv: Condvar,
    index: Vec<RwLock<HashMap<Box<[u8]>, DiskLocation>>>,
    enable_checksum: bool,
    region_size: u64,
    quota: u64,
    bytes_used: AtomicU64,
    counters: Arc<CacheCounters>,
}

impl DiskTier {
    /// Open (and truncate) the data file in every configured directory and
    /// carve it into regions.  A failure here fails `init`.
    pub(crate) fn open(
        spaces: &[DirSpace],
        enable_checksum: bool,
        counters: Arc<CacheCounters>,
    ) -> Result<Self, CacheError> {
        let mut files = Vec::with_capacity(spaces.len());
        let mut regions = Vec::new();
        let mut quota = 0u64;
        // A space smaller than the default region still gets one region:
        // clamp the region size to the smallest configured space, aligned
        // down to 4 KiB.
        let region_size = spaces
            .iter()
            .map(|space| space.size)
            .min()
            .unwrap_or(REGION_SIZE)
            .min(REGION_SIZE)
            & !4095;
        for (file_idx, space) in spaces.iter().enumerate() {
            std::fs::create_dir_all(&space.path)?;
            let path = space.path.join(CACHE_DATA_FILE);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            // No cross-restart persistence: drop whatever the file held.
            file.set_len(0)?;
            let region_count = space.size / region_size;
            file.set_len(region_count * region_size)?;
            quota += region_count * region_size;
            for i in 0..region_count {
                regions.push(Region {
                    file_idx,
                    file_off: i * region_size,
                    write_off: REGION_HEADER_SIZE,
                    entry_count: 0,
                    keys: Vec::new(),
                    pending_writers: 0,
                    sealed: false,
                });
            }
            files.push(file);
        }
        let mut free: VecDeque<u32> = (0..regions.len() as u32).collect();
        let open = match free.pop_front() {
            Some(id) => id,
            None => {
                return Err(CacheError::Internal(
                    "disk tier configured with zero regions".to_string(),
                ))
            }
        };
        Ok(Self {
            files,
            table: Mutex::new(RegionTable {
                regions,
                free,
                sealed: VecDeque::new(),
                open,
            }),
            reclaim_cv: Condvar::new(),
            index: (0..INDEX_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            enable_checksum,
            region_size,
            quota,
            bytes_used: AtomicU64::new(0),
            counters,
        })
    }

    /// Largest entry frame a region can hold, leaving room for the header
    /// and the redundant trailer.
    pub(crate) fn max_frame_len(&self) -> u64 {
        self.region_size - 2 * REGION_HEADER_SIZE
    }

    fn index_shard(&self, key: &[u8]) -> &RwLock<HashMap<Box<[u8]>, DiskLocation>> {
        let mut hasher = DefaultHasher::default();
        key.hash(&mut hasher);
        &self.index[hasher.finish() as usize % INDEX_SHARDS]
    }

    pub(crate) fn quota(&self) -> u64 {
        self.quota
    }

    pub(crate) fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    pub(crate) fn contains_live(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        self.index_shard(key)
            .read()
            .get(key)
            .is_some_and(|loc| !loc.deadline.is_some_and(|deadline| deadline <= now))
    }

    pub(crate) fn remove(&self, key: &[u8]) {
        self.index_shard(key).write().remove(key);
    }

    /// Append an entry and publish it in the index.  Called from the writer
    /// pool only.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), CacheError> {
        let frame_len = entry_frame_len(key.len(), payload.len());
        if frame_len > self.max_frame_len() {
            return Err(CacheError::ResourceExhausted(format!(
                "entry frame of {} bytes exceeds the region capacity",
                frame_len
            )));
        }
        let checksum = if self.enable_checksum {
            payload_checksum(payload)
        } else {
            0
        };
        let frame = encode_entry(key, payload, checksum);
        let (region_id, file_idx, frame_abs_off) = self.reserve(key, frame.len() as u64)?;
        // The reservation holds a write lease on the region until the bytes
        // are durable and published, so reclamation cannot zero and reissue
        // this extent underneath us.
        let written = self.files[file_idx].write_all_at(&frame, frame_abs_off);
        if written.is_ok() {
            let location = DiskLocation {
                region_id,
                file_idx: file_idx as u32,
                abs_off: frame_abs_off + payload_offset(key.len()),
                payload_len: payload.len() as u32,
                checksum,
                deadline,
            };
            self.index_shard(key)
                .write()
                .insert(key.to_vec().into_boxed_slice(), location);
        }
        self.complete_write(region_id);
        written?;
        self.counters
            .disk_insert_count
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release the write lease taken by [`DiskTier::reserve`].
    fn complete_write(&self, region_id: u32) {
        let mut table = self.table.lock();
        let region = &mut table.regions[region_id as usize];
        region.pending_writers = region.pending_writers.saturating_sub(1);
        if region.pending_writers == 0 {
            self.reclaim_cv.notify_all();
        }
    }

    /// Read back the full payload stored under `key`, verifying expiry and
    /// checksum.  Returns the payload and its deadline so the caller can
    /// slice and promote.
    pub(crate) fn read(&self, key: &[u8]) -> Result<(Arc<[u8]>, Option<Instant>), CacheError> {
        let Some(location) = self.index_shard(key).read().get(key).copied() else {
            return Err(CacheError::NotFound);
        };
        if location.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            self.remove_if_at(key, &location);
            self.counters.expired_count.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::NotFound);
        }
        let mut payload = vec![0u8; location.payload_len as usize];
        self.files[location.file_idx as usize].read_exact_at(&mut payload, location.abs_off)?;
        // The region may have been reclaimed while we read.  The index is
        // authoritative: only a still-published identical location is valid.
        let still_current = self
            .index_shard(key)
            .read()
            .get(key)
            .is_some_and(|current| *current == location);
        if !still_current {
            return Err(CacheError::NotFound);
        }
        if self.enable_checksum && payload_checksum(&payload) != location.checksum {
            self.remove_if_at(key, &location);
            self.counters
                .checksum_fail_count
                .fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Corruption(format!(
                "checksum mismatch for a {} byte entry in region {}",
                location.payload_len, location.region_id
            )));
        }
        Ok((payload.into(), location.deadline))
    }

    /// Remove the index entry only if it still points at `location`; a
    /// concurrent overwrite must not be dropped.
    fn remove_if_at(&self, key: &[u8], location: &DiskLocation) {
        let mut shard = self.index_shard(key).write();
        if shard.get(key).is_some_and(|current| current == location) {
            shard.remove(key);
        }
    }

    /// Reserve `frame_len` bytes in the open region, sealing and allocating
    /// as needed.  On success the region carries a write lease that the
    /// caller must release with [`DiskTier::complete_write`].  Returns
    /// `(region_id, file_idx, absolute frame offset)`.
    fn reserve(&self, key: &[u8], frame_len: u64) -> Result<(u32, usize, u64), CacheError> {
        let mut table = self.table.lock();
        loop {
            let open = table.open;
            let region = &mut table.regions[open as usize];
            if region.write_off + frame_len <= self.region_size - REGION_HEADER_SIZE {
                let off = region.write_off;
                region.write_off += frame_len;
                region.entry_count += 1;
                region.keys.push(key.to_vec().into_boxed_slice());
                region.pending_writers += 1;
                let abs = region.file_off + off;
                let file_idx = region.file_idx;
                self.bytes_used.fetch_add(frame_len, Ordering::Relaxed);
                return Ok((open, file_idx, abs));
            }
            // Seal is idempotent: another writer may have sealed this region
            // while we waited below.
            self.seal_region(&mut table, open)?;
            let next = match table.free.pop_front() {
                Some(id) => id,
                None => match self.try_reclaim(&mut table)? {
                    Some(id) => id,
                    None => {
                        // Every sealed region still has a write in flight.
                        // Wait for a lease to drop, then re-check from the
                        // top: another writer may have installed a fresh
                        // open region meanwhile.
                        self.reclaim_cv.wait(&mut table);
                        continue;
                    }
                },
            };
            let region = &mut table.regions[next as usize];
            region.write_off = REGION_HEADER_SIZE;
            region.entry_count = 0;
            region.keys.clear();
            region.sealed = false;
            table.open = next;
        }
    }

    /// Write the header and its redundant trailer copy, then mark the
    /// region sealed.  A no-op if the region is already sealed.
    fn seal_region(&self, table: &mut RegionTable, region_id: u32) -> Result<(), CacheError> {
        let region = &table.regions[region_id as usize];
        if region.sealed {
            return Ok(());
        }
        let header = RegionHeader {
            region_id,
            bytes_used: region.bytes_used(),
            entry_count: region.entry_count,
        }
        .encode();
        let file = &self.files[region.file_idx];
        file.write_all_at(&header, region.file_off)?;
        file.write_all_at(
            &header,
            region.file_off + self.region_size - REGION_HEADER_SIZE,
        )?;
        table.regions[region_id as usize].sealed = true;
        table.sealed.push_back(region_id);
        Ok(())
    }

    /// Reclaim the oldest sealed region with no write lease outstanding:
    /// unpublish its keys, zero its extent, and hand it back as writable.
    /// `Ok(None)` means every sealed region still has writers in flight and
    /// the caller should wait; an error means nothing is sealed at all.
    fn try_reclaim(&self, table: &mut RegionTable) -> Result<Option<u32>, CacheError> {
        if table.sealed.is_empty() {
            return Err(CacheError::Internal(
                "no sealed region available for reclamation".to_string(),
            ));
        }
        let Some(pos) = table
            .sealed
            .iter()
            .position(|&id| table.regions[id as usize].pending_writers == 0)
        else {
            return Ok(None);
        };
        let victim = match table.sealed.remove(pos) {
            Some(id) => id,
            None => {
                return Err(CacheError::Internal(
                    "sealed region queue lost its victim".to_string(),
                ))
            }
        };
        let region = &mut table.regions[victim as usize];
        for key in region.keys.drain(..) {
            let mut shard = self.index_shard(&key).write();
            // Only drop entries that still live in this region; the key may
            // have been rewritten elsewhere since.
            if shard.get(&key).is_some_and(|loc| loc.region_id == victim) {
                shard.remove(&key);
            }
        }
        let used = region.bytes_used();
        self.bytes_used.fetch_sub(used, Ordering::Relaxed);
        let file = &self.files[region.file_idx];
        zero_extent(file, region.file_off, self.region_size)?;
        self.counters
            .disk_reclaimed_regions
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(region = victim, bytes = used, "reclaimed disk region");
        Ok(Some(victim))
    }

    pub(crate) fn detail_into(&self, detail: &mut BTreeMap<String, f64>) {
        let table = self.table.lock();
        detail.insert(
            "disk_regions_total".to_string(),
            table.regions.len() as f64,
        );
        detail.insert("disk_regions_free".to_string(), table.free.len() as f64);
        detail.insert(
            "disk_regions_sealed".to_string(),
            table.sealed.len() as f64,
        );
    }
}

fn zero_extent(file: &File, off: u64, len: u64) -> std::io::Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK];
    let mut written = 0u64;
    while written < len {
        let chunk = (len - written).min(ZERO_CHUNK as u64) as usize;
        file.write_all_at(&zeros[..chunk], off + written)?;
        written += chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::decode_entry;
    use std::path::Path;

    fn tier(dir: &Path, size: u64, checksum: bool) -> DiskTier {
        DiskTier::open(
            &[DirSpace {
                path: dir.to_path_buf(),
                size,
            }],
            checksum,
            Arc::new(CacheCounters::default()),
        )
        .unwrap()
    }

    #[test]
    fn data_file_is_truncated_and_presized() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_DATA_FILE), b"stale bytes").unwrap();
        let tier = tier(dir.path(), 2 * REGION_SIZE, false);
        let len = std::fs::metadata(dir.path().join(CACHE_DATA_FILE))
            .unwrap()
            .len();
        assert_eq!(len, 2 * REGION_SIZE);
        assert_eq!(tier.quota(), 2 * REGION_SIZE);
        assert_eq!(tier.bytes_used(), 0);
    }

    #[test]
    fn insert_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, true);
        let payload = vec![0x3C; 4096];
        tier.insert(b"fp", &payload, None).unwrap();
        assert!(tier.contains_live(b"fp"));
        assert_eq!(tier.read(b"fp").unwrap().0.as_ref(), payload.as_slice());
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, false);
        assert!(matches!(tier.read(b"nope"), Err(CacheError::NotFound)));
    }

    #[test]
    fn overwrite_points_at_the_new_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, true);
        tier.insert(b"fp", &[1u8; 128], None).unwrap();
        tier.insert(b"fp", &[2u8; 128], None).unwrap();
        assert_eq!(tier.read(b"fp").unwrap().0.as_ref(), &[2u8; 128][..]);
    }

    #[test]
    fn expired_entry_reads_as_not_found_and_unpublishes() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, false);
        let deadline = Some(Instant::now() - std::time::Duration::from_secs(1));
        tier.insert(b"fp", &[7u8; 64], deadline).unwrap();
        assert!(!tier.contains_live(b"fp"));
        assert!(matches!(tier.read(b"fp"), Err(CacheError::NotFound)));
        assert!(matches!(tier.read(b"fp"), Err(CacheError::NotFound)));
    }

    #[test]
    fn corrupted_payload_fails_then_misses() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, true);
        let payload = vec![0x11; 512];
        tier.insert(b"fp", &payload, None).unwrap();

        // Flip one payload byte behind the tier's back.
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path().join(CACHE_DATA_FILE))
            .unwrap();
        let loc = tier.index_shard(b"fp").read().get(b"fp".as_slice()).copied().unwrap();
        file.write_all_at(&[0xFF], loc.abs_off).unwrap();

        assert!(matches!(tier.read(b"fp"), Err(CacheError::Corruption(_))));
        // The offending index entry is gone.
        assert!(matches!(tier.read(b"fp"), Err(CacheError::NotFound)));
    }

    #[test]
    fn filling_regions_reclaims_the_oldest_fifo() {
        let dir = tempfile::tempdir().unwrap();
        // Two regions; each 1 MiB payload frames so a region holds 15.
        let tier = tier(dir.path(), 2 * REGION_SIZE, false);
        let payload = vec![0xEE; 1024 * 1024];
        let mut inserted = Vec::new();
        for i in 0..40u32 {
            let key = format!("key-{i}");
            tier.insert(key.as_bytes(), &payload, None).unwrap();
            inserted.push(key);
        }
        // Disk usage never exceeds the configured space.
        assert!(tier.bytes_used() <= tier.quota());
        // The newest entries are readable; the oldest were reclaimed.
        assert_eq!(
            tier.read(inserted.last().unwrap().as_bytes()).unwrap().0.len(),
            1024 * 1024
        );
        assert!(matches!(
            tier.read(inserted.first().unwrap().as_bytes()),
            Err(CacheError::NotFound)
        ));
        assert!(
            tier.counters.disk_reclaimed_regions.load(Ordering::Relaxed) > 0,
            "reclamation should have run"
        );
    }

    #[test]
    fn sealed_region_carries_header_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), 2 * REGION_SIZE, false);
        let payload = vec![0xAB; 1024 * 1024];
        // Overflow the first region so it gets sealed.
        for i in 0..16u32 {
            tier.insert(format!("key-{i}").as_bytes(), &payload, None)
                .unwrap();
        }
        let mut raw = vec![0u8; REGION_HEADER_SIZE as usize];
        let file = File::open(dir.path().join(CACHE_DATA_FILE)).unwrap();
        file.read_exact_at(&mut raw, 0).unwrap();
        let header = RegionHeader::decode(&raw).unwrap();
        assert_eq!(header.region_id, 0);
        assert!(header.entry_count > 0);
        file.read_exact_at(&mut raw, REGION_SIZE - REGION_HEADER_SIZE)
            .unwrap();
        assert_eq!(RegionHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn on_disk_frame_decodes_back() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, true);
        let payload = vec![0x42; 256];
        tier.insert(b"frame-key", &payload, None).unwrap();
        let frame_len = entry_frame_len(b"frame-key".len(), payload.len()) as usize;
        let mut raw = vec![0u8; frame_len];
        let file = File::open(dir.path().join(CACHE_DATA_FILE)).unwrap();
        file.read_exact_at(&mut raw, REGION_HEADER_SIZE).unwrap();
        let (key, body, checksum) = decode_entry(&raw).unwrap();
        assert_eq!(key, b"frame-key");
        assert_eq!(body, payload.as_slice());
        assert_eq!(checksum, payload_checksum(&payload));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, false);
        let payload = vec![0u8; REGION_SIZE as usize];
        assert!(matches!(
            tier.insert(b"fp", &payload, None),
            Err(CacheError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn small_space_gets_one_clamped_region() {
        let dir = tempfile::tempdir().unwrap();
        // 4 MiB space: a single 4 MiB region that recycles in place.
        let tier = tier(dir.path(), 4 * 1024 * 1024, false);
        assert_eq!(tier.quota(), 4 * 1024 * 1024);
        let payload = vec![0x9D; 1024 * 1024];
        for i in 0..12u32 {
            tier.insert(format!("key-{i}").as_bytes(), &payload, None)
                .unwrap();
        }
        assert!(tier.bytes_used() <= tier.quota());
        assert_eq!(tier.read(b"key-11").unwrap().0.len(), 1024 * 1024);
        assert!(matches!(tier.read(b"key-0"), Err(CacheError::NotFound)));
    }

    #[test]
    fn reclaim_waits_for_in_flight_writers() {
        let dir = tempfile::tempdir().unwrap();
        // One 4 MiB region: the fourth 1 MiB insert must recycle it.
        let tier = Arc::new(tier(dir.path(), 4 * 1024 * 1024, false));
        let payload = vec![0x6B; 1024 * 1024];
        for i in 0..3u32 {
            tier.insert(format!("key-{i}").as_bytes(), &payload, None)
                .unwrap();
        }
        // Pin a synthetic write lease on region 0, as if a writer were
        // still flushing its reservation.
        tier.table.lock().regions[0].pending_writers += 1;

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let worker = {
            let tier = Arc::clone(&tier);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let payload = vec![0x6C; 1024 * 1024];
                tier.insert(b"key-3", &payload, None).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(
            !done.load(Ordering::SeqCst),
            "reclamation must wait out the write lease"
        );
        tier.complete_write(0);
        worker.join().unwrap();
        assert_eq!(tier.read(b"key-3").unwrap().0.len(), 1024 * 1024);
        assert!(matches!(tier.read(b"key-0"), Err(CacheError::NotFound)));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tier = tier(dir.path(), REGION_SIZE, false);
        tier.insert(b"fp", &[1u8; 64], None).unwrap();
        tier.remove(b"fp");
        tier.remove(b"fp");
        assert!(matches!(tier.read(b"fp"), Err(CacheError::NotFound)));
    }
}
