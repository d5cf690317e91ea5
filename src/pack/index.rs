//! reader for the `.idx` side of a pack: a sorted table of keys with their
//! CRC32 and byte offset into the matching `.pack`, plus a 256-entry fanout
//! table used to narrow the binary search to a single byte range before it
//! starts. versions 1 (legacy, no magic/CRC table) and 2 (current) of the
//! format are both supported, grounded on `PackIndexFile` in the source.

use crate::error::BitError;
use crate::hash::Key;
use crate::BitResult;

pub(crate) const PACK_IDX_MAGIC: u32 = 0xff744f63;
pub(crate) const FANOUT_ENTRYC: usize = 256;
const FANOUT_ENTRY_SIZE: usize = 4;
const FANOUT_SIZE: usize = FANOUT_ENTRYC * FANOUT_ENTRY_SIZE;
const PACK_IDX_HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;
const OFFSET_SIZE: usize = 4;
const EXT_OFFSET_SIZE: usize = 8;
const KEY_SIZE: usize = 20;
const TRAILER_SIZE: usize = KEY_SIZE * 2;
/// highest bit of a v2 32-bit offset marks it as an index into the extended
/// 64-bit offset table rather than a direct offset.
pub(crate) const MAX_OFFSET: u64 = 0x7fffffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexVersion {
    /// no magic, no version field, no per-object CRC table.
    Legacy,
    Default,
}

/// an owned, parsed `.idx` file. entries are accessed by 0-based rank in
/// sort order, not by key, since most callers get there through [`find`].
///
/// [`find`]: PackIndex::find
pub struct PackIndex {
    version: IndexVersion,
    header_size: usize,
    num_entries: u32,
    data: Vec<u8>,
}

impl PackIndex {
    pub fn parse(data: Vec<u8>) -> BitResult<Self> {
        if data.len() < PACK_IDX_HEADER_SIZE + FANOUT_SIZE + TRAILER_SIZE {
            return Err(BitError::corrupt("pack index file too short"));
        }

        let (version, header_size) = if data[0..4] == PACK_IDX_MAGIC.to_be_bytes() {
            let found = be_u32(&data[4..8]);
            if found != 2 {
                return Err(BitError::UnsupportedVersion { found, expected: 2 });
            }
            (IndexVersion::Default, PACK_IDX_HEADER_SIZE)
        } else {
            (IndexVersion::Legacy, 0)
        };

        let fanout_last = header_size + FANOUT_SIZE - FANOUT_ENTRY_SIZE;
        let num_entries = be_u32(&data[fanout_last..fanout_last + FANOUT_ENTRY_SIZE]);

        let index = Self { version, header_size, num_entries, data };
        let expected_len = index.trailer_offset() + TRAILER_SIZE;
        if index.data.len() != expected_len {
            return Err(BitError::corrupt(format!(
                "pack index size mismatch: expected {} bytes, found {}",
                expected_len,
                index.data.len()
            )));
        }
        Ok(index)
    }

    pub fn version(&self) -> IndexVersion {
        self.version
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    fn fanout(&self, byte: u8) -> u32 {
        let offset = self.header_size + byte as usize * FANOUT_ENTRY_SIZE;
        be_u32(&self.data[offset..offset + FANOUT_ENTRY_SIZE])
    }

    fn sha_table_offset(&self) -> usize {
        self.header_size + FANOUT_SIZE
    }

    fn crc_table_offset(&self) -> usize {
        self.sha_table_offset() + self.num_entries as usize * KEY_SIZE
    }

    fn ofs32_table_offset(&self) -> usize {
        match self.version {
            // v1 entries are (4-byte offset, 20-byte key) pairs, sorted by key,
            // with no separate CRC table.
            IndexVersion::Legacy => self.sha_table_offset(),
            IndexVersion::Default => self.crc_table_offset() + self.num_entries as usize * CRC_SIZE,
        }
    }

    fn ofs64_table_offset(&self) -> usize {
        self.ofs32_table_offset() + self.num_entries as usize * OFFSET_SIZE
    }

    fn trailer_offset(&self) -> usize {
        match self.version {
            IndexVersion::Legacy =>
                self.sha_table_offset() + self.num_entries as usize * (OFFSET_SIZE + KEY_SIZE),
            IndexVersion::Default => self.ofs64_table_offset(),
        }
    }

    pub fn key_at(&self, i: u32) -> Key {
        let offset = match self.version {
            IndexVersion::Legacy =>
                self.sha_table_offset() + i as usize * (OFFSET_SIZE + KEY_SIZE) + OFFSET_SIZE,
            IndexVersion::Default => self.sha_table_offset() + i as usize * KEY_SIZE,
        };
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&self.data[offset..offset + KEY_SIZE]);
        Key::new(bytes)
    }

    pub fn crc_at(&self, i: u32) -> Option<u32> {
        match self.version {
            IndexVersion::Legacy => None,
            IndexVersion::Default => {
                let offset = self.crc_table_offset() + i as usize * CRC_SIZE;
                Some(be_u32(&self.data[offset..offset + CRC_SIZE]))
            }
        }
    }

    pub fn offset_at(&self, i: u32) -> u64 {
        match self.version {
            IndexVersion::Legacy => {
                let offset = self.sha_table_offset() + i as usize * (OFFSET_SIZE + KEY_SIZE);
                be_u32(&self.data[offset..offset + OFFSET_SIZE]) as u64
            }
            IndexVersion::Default => {
                let offset = self.ofs32_table_offset() + i as usize * OFFSET_SIZE;
                let ofs32 = be_u32(&self.data[offset..offset + OFFSET_SIZE]) as u64;
                if ofs32 <= MAX_OFFSET {
                    ofs32
                } else {
                    let ext_index = (ofs32 & MAX_OFFSET) as usize;
                    let ext_offset = self.ofs64_table_offset() + ext_index * EXT_OFFSET_SIZE;
                    be_u64(&self.data[ext_offset..ext_offset + EXT_OFFSET_SIZE])
                }
            }
        }
    }

    /// binary search for `key` within the fanout-narrowed range, returning
    /// its rank (suitable for [`key_at`]/[`offset_at`]/[`crc_at`]).
    ///
    /// [`key_at`]: PackIndex::key_at
    /// [`offset_at`]: PackIndex::offset_at
    /// [`crc_at`]: PackIndex::crc_at
    pub fn find(&self, key: &Key) -> Option<u32> {
        let byte = key.as_bytes()[0];
        let low = if byte == 0 { 0 } else { self.fanout(byte - 1) };
        let high = self.fanout(byte);

        let mut lo = low as i64;
        let mut hi = high as i64 - 1;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_at(mid as u32).cmp(key) {
                std::cmp::Ordering::Equal => return Some(mid as u32),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid - 1,
            }
        }
        None
    }

    pub fn pack_checksum(&self) -> Key {
        let offset = self.trailer_offset();
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&self.data[offset..offset + KEY_SIZE]);
        Key::new(bytes)
    }

    pub fn idx_checksum(&self) -> Key {
        let offset = self.trailer_offset() + KEY_SIZE;
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&self.data[offset..offset + KEY_SIZE]);
        Key::new(bytes)
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes(bytes.try_into().unwrap())
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// hand-builds a minimal, well-formed v2 index for a handful of keys.
    fn build_v2_index(mut keys: Vec<Key>) -> (PackIndex, Vec<Key>) {
        keys.sort();
        let mut fanout = [0u32; FANOUT_ENTRYC];
        for key in &keys {
            for b in key.as_bytes()[0] as usize..FANOUT_ENTRYC {
                fanout[b] += 1;
            }
        }

        let mut data = Vec::new();
        data.extend_from_slice(&PACK_IDX_MAGIC.to_be_bytes());
        data.extend_from_slice(&2u32.to_be_bytes());
        for f in fanout {
            data.extend_from_slice(&f.to_be_bytes());
        }
        for key in &keys {
            data.extend_from_slice(key.as_bytes());
        }
        for (i, _) in keys.iter().enumerate() {
            data.extend_from_slice(&(0xdead_0000u32 + i as u32).to_be_bytes());
        }
        for (i, _) in keys.iter().enumerate() {
            data.extend_from_slice(&(100u32 + i as u32 * 50).to_be_bytes());
        }
        data.extend_from_slice(&[0xaa; KEY_SIZE]); // pack checksum
        data.extend_from_slice(&[0xbb; KEY_SIZE]); // idx checksum

        (PackIndex::parse(data).unwrap(), keys)
    }

    fn key(byte0: u8, tail: u8) -> Key {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[0] = byte0;
        bytes[19] = tail;
        Key::new(bytes)
    }

    #[test]
    fn finds_every_entry_by_key() {
        let keys = vec![key(0x01, 1), key(0x01, 2), key(0x7f, 3), key(0xff, 4)];
        let (index, keys) = build_v2_index(keys);
        assert_eq!(index.num_entries(), 4);
        for (rank, k) in keys.iter().enumerate() {
            let found = index.find(k).unwrap();
            assert_eq!(index.key_at(found), *k);
            assert_eq!(index.offset_at(found), 100 + rank as u64 * 50);
            assert!(index.crc_at(found).is_some());
        }
    }

    #[test]
    fn missing_key_returns_none() {
        let keys = vec![key(0x01, 1), key(0x7f, 3)];
        let (index, _) = build_v2_index(keys);
        assert_eq!(index.find(&key(0x50, 9)), None);
    }

    #[test]
    fn checksums_roundtrip() {
        let (index, _) = build_v2_index(vec![key(1, 1)]);
        assert_eq!(index.pack_checksum(), Key::new([0xaa; KEY_SIZE]));
        assert_eq!(index.idx_checksum(), Key::new([0xbb; KEY_SIZE]));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut data = Vec::new();
        data.extend_from_slice(&PACK_IDX_MAGIC.to_be_bytes());
        data.extend_from_slice(&3u32.to_be_bytes());
        data.extend_from_slice(&[0u8; FANOUT_SIZE]);
        data.extend_from_slice(&[0u8; TRAILER_SIZE]);
        assert!(PackIndex::parse(data).is_err());
    }
}
