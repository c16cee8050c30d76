//! On-disk layout of the disk tier.
//!
//! Each disk file is partitioned into fixed-size regions.  A region starts
//! with a 64-byte header, carries packed entries, and once sealed ends with
//! a redundant copy of the header in its last 64 bytes so a torn seal is
//! detectable.  Entries are framed as `{ key_fp_len, payload_len, checksum,
//! key_fp, payload }` with little-endian u32 fields.

use crate::error::CacheError;

pub(crate) const REGION_HEADER_SIZE: u64 = 64;
pub(crate) const REGION_MAGIC: u32 = 0x5144_4331; // "QDC1"
pub(crate) const REGION_VERSION: u32 = 1;
pub(crate) const ENTRY_HEADER_SIZE: u64 = 12;

fn read_u32(raw: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[off..off + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(raw: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionHeader {
    pub(crate) region_id: u32,
    pub(crate) bytes_used: u64,
    pub(crate) entry_count: u64,
}

impl RegionHeader {
    pub(crate) fn encode(&self) -> [u8; REGION_HEADER_SIZE as usize] {
        let mut out = [0u8; REGION_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&REGION_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&REGION_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.region_id.to_le_bytes());
        // out[12..16] reserved
        out[16..24].copy_from_slice(&self.bytes_used.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        let crc = crc32fast::hash(&out[0..32]);
        out[32..36].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, CacheError> {
        if raw.len() < REGION_HEADER_SIZE as usize {
            return Err(CacheError::Corruption(format!(
                "region header truncated to {} bytes",
                raw.len()
            )));
        }
        let magic = read_u32(raw, 0);
        if magic != REGION_MAGIC {
            return Err(CacheError::Corruption(format!(
                "bad region magic {:#x}",
                magic
            )));
        }
        let version = read_u32(raw, 4);
        if version != REGION_VERSION {
            return Err(CacheError::Corruption(format!(
                "unsupported region version {}",
                version
            )));
        }
        let stored_crc = read_u32(raw, 32);
        if stored_crc != crc32fast::hash(&raw[0..32]) {
            return Err(CacheError::Corruption(
                "region header checksum mismatch".to_string(),
            ));
        }
        Ok(Self {
            region_id: read_u32(raw, 8),
            bytes_used: read_u64(raw, 16),
            entry_count: read_u64(raw, 24),
        })
    }
}

pub(crate) fn entry_frame_len(key_len: usize, payload_len: usize) -> u64 {
    ENTRY_HEADER_SIZE + key_len as u64 + payload_len as u64
}

/// Offset of the payload within an entry frame.
pub(crate) fn payload_offset(key_len: usize) -> u64 {
    ENTRY_HEADER_SIZE + key_len as u64
}

pub(crate) fn payload_checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Frame an entry for appending to a region.  `checksum` is zero when
/// checksums are disabled.
pub(crate) fn encode_entry(key_fp: &[u8], payload: &[u8], checksum: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(entry_frame_len(key_fp.len(), payload.len()) as usize);
    out.extend_from_slice(&(key_fp.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(key_fp);
    out.extend_from_slice(payload);
    out
}

/// Parse an entry frame.  Returns `(key_fp, payload, checksum)`.
#[cfg(test)]
pub(crate) fn decode_entry(raw: &[u8]) -> Result<(&[u8], &[u8], u32), CacheError> {
    if raw.len() < ENTRY_HEADER_SIZE as usize {
        return Err(CacheError::Corruption("entry frame truncated".to_string()));
    }
    let key_len = read_u32(raw, 0) as usize;
    let payload_len = read_u32(raw, 4) as usize;
    let checksum = read_u32(raw, 8);
    let total = ENTRY_HEADER_SIZE as usize + key_len + payload_len;
    if raw.len() < total {
        return Err(CacheError::Corruption(format!(
            "entry frame holds {} bytes, header promises {}",
            raw.len(),
            total
        )));
    }
    let key = &raw[ENTRY_HEADER_SIZE as usize..ENTRY_HEADER_SIZE as usize + key_len];
    let payload = &raw[ENTRY_HEADER_SIZE as usize + key_len..total];
    Ok((key, payload, checksum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = RegionHeader {
            region_id: 7,
            bytes_used: 123_456,
            entry_count: 42,
        };
        let raw = header.encode();
        assert_eq!(RegionHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut raw = RegionHeader {
            region_id: 0,
            bytes_used: 0,
            entry_count: 0,
        }
        .encode();
        raw[0] ^= 0xFF;
        assert!(matches!(
            RegionHeader::decode(&raw),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn header_rejects_flipped_counter() {
        let mut raw = RegionHeader {
            region_id: 0,
            bytes_used: 100,
            entry_count: 1,
        }
        .encode();
        raw[16] ^= 0x01;
        assert!(matches!(
            RegionHeader::decode(&raw),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn entry_round_trip() {
        let payload = vec![0x5A; 4096];
        let checksum = payload_checksum(&payload);
        let frame = encode_entry(b"some-key", &payload, checksum);
        assert_eq!(frame.len() as u64, entry_frame_len(8, 4096));
        let (key, body, stored) = decode_entry(&frame).unwrap();
        assert_eq!(key, b"some-key");
        assert_eq!(body, payload.as_slice());
        assert_eq!(stored, checksum);
        assert_eq!(payload_checksum(body), stored);
    }

    #[test]
    fn payload_offset_matches_frame() {
        let frame = encode_entry(b"k", &[1, 2, 3], 0);
        let off = payload_offset(1) as usize;
        assert_eq!(&frame[off..], &[1, 2, 3]);
    }

    #[test]
    fn truncated_entry_is_corruption() {
        let frame = encode_entry(b"key", &[0u8; 100], 0);
        assert!(matches!(
            decode_entry(&frame[..frame.len() - 1]),
            Err(CacheError::Corruption(_))
        ));
    }
}
