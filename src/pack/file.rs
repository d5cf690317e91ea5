//! one `.pack` + its `.idx`: offset-keyed entry access, delta-chain
//! resolution, and full-pack verification. grounded on `PackfileReader` /
//! `PackIndexReader` in the source, collapsed into a single type that owns
//! its mapping, index, and cache (the source keeps these as separate
//! reader objects threaded together by the caller).

use crate::env::{CacheMode, Environment};
use crate::error::BitError;
use crate::hash::Key;
use crate::io::ReadExt;
use crate::mmap::{Cursor, MemoryManager};
use crate::obj::{hash_object_bytes, BitObjType};
use crate::pack::cache::PackCache;
use crate::pack::index::PackIndex;
use crate::serialize::DeserializeSized;
use crate::BitResult;
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_EXT: &str = "pack";
pub const PACK_IDX_EXT: &str = "idx";

/// how many compressed bytes to pull from the mmap pool per incremental
/// read, when inflating a stream whose total compressed length isn't known
/// up front. independent of the pool's window size: a window just has to
/// be at least this big to be useful, and the pool grows it to fit.
const INFLATE_CHUNK: u64 = 64 * 1024;
/// window requested to decode an entry header: a type+size varint plus
/// either an ofs_delta offset or a 20-byte ref_delta key, comfortably
/// within this many bytes.
const HEADER_WINDOW: u64 = 64;

enum EntryKind {
    Object(BitObjType),
    OfsDelta(u64),
    RefDelta(Key),
}

struct EntryHeader {
    kind: EntryKind,
    /// size of what gets zlib-decompressed: the object's own bytes for a
    /// non-delta entry, the delta payload's byte length for a delta entry.
    size: u64,
    payload_offset: u64,
}

pub struct PackFile {
    path: PathBuf,
    cursor: Cursor,
    size: u64,
    index: PackIndex,
    cache: PackCache,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

impl PackFile {
    pub fn open(
        pack_path: impl AsRef<Path>,
        idx_path: impl AsRef<Path>,
        mmap: &Arc<MemoryManager>,
        mem_used: Arc<AtomicU64>,
        env: &Environment,
    ) -> BitResult<Self> {
        let pack_path = pack_path.as_ref();
        let idx_bytes = std::fs::read(idx_path)?;
        let index = PackIndex::parse(idx_bytes)?;

        let size = std::fs::metadata(pack_path)?.len();
        if size < 12 {
            return Err(BitError::corrupt("pack file too short for its header"));
        }
        let cursor = mmap.clone().cursor_for(pack_path);

        let header = cursor.use_region(0, 12)?;
        if &header[0..4] != PACK_SIGNATURE.as_slice() {
            return Err(BitError::corrupt("invalid pack file signature"));
        }
        let version = u32::from_be_bytes(header[4..8].try_into().unwrap());
        if version != 2 && version != 3 {
            return Err(BitError::UnsupportedVersion { found: version, expected: 2 });
        }
        let num_entries = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if num_entries != index.num_entries() {
            return Err(BitError::corrupt(format!(
                "pack header claims {} entries, index has {}",
                num_entries,
                index.num_entries()
            )));
        }
        drop(header);

        let trailer = cursor.use_region(size - 20, 20)?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&trailer);
        if Key::new(bytes) != index.pack_checksum() {
            return Err(BitError::corrupt("pack checksum mismatch"));
        }
        drop(trailer);

        let cache = PackCache::new(mem_used, env.pack_cache_memory_limit, env.pack_cache_mode, num_entries, size);

        Ok(Self { path: pack_path.to_path_buf(), cursor, size, index, cache })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    pub fn has(&self, key: &Key) -> bool {
        self.index.find(key).is_some()
    }

    fn window(&self, offset: u64, len: u64) -> BitResult<crate::mmap::View> {
        let len = len.min(self.size.saturating_sub(offset)).max(1);
        self.cursor.use_region(offset, len)
    }

    fn decode_entry_header(&self, offset: u64) -> BitResult<EntryHeader> {
        let view = self.window(offset, HEADER_WINDOW)?;
        let mut slice: &[u8] = &view;
        let (type_bits, size) = slice.read_le_varint_with_shift(3)?;

        let kind = match type_bits {
            1 => EntryKind::Object(BitObjType::Commit),
            2 => EntryKind::Object(BitObjType::Tree),
            3 => EntryKind::Object(BitObjType::Blob),
            4 => EntryKind::Object(BitObjType::Tag),
            6 => EntryKind::OfsDelta(slice.read_offset()?),
            7 => EntryKind::RefDelta(slice.read_key()?),
            other => return Err(BitError::corrupt(format!("invalid pack entry type `{}`", other))),
        };

        let consumed = view.len() - slice.len();
        Ok(EntryHeader { kind, size, payload_offset: offset + consumed as u64 })
    }

    /// inflate a zlib stream starting at `payload_offset`, pulling compressed
    /// input from the mmap pool in [`INFLATE_CHUNK`]-sized windows instead
    /// of requiring it all pre-sliced into memory at once.
    fn inflate_from(&self, payload_offset: u64, expected_size: u64) -> BitResult<Vec<u8>> {
        let mut decompress = Decompress::new(true);
        let mut out = vec![0u8; expected_size.max(4096) as usize];
        let mut out_pos = 0usize;

        loop {
            let in_pos = payload_offset + decompress.total_in();
            if in_pos >= self.size {
                return Err(BitError::corrupt("zlib stream ran past the end of the pack"));
            }
            let view = self.window(in_pos, INFLATE_CHUNK)?;

            if out_pos == out.len() {
                out.resize(out.len() + 4096, 0);
            }

            let status = decompress
                .decompress(&view, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|err| BitError::codec(format!("zlib inflate failed: {}", err)))?;
            out_pos = decompress.total_out() as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok => continue,
                Status::BufError => return Err(BitError::corrupt("zlib inflate stalled")),
            }
        }

        out.truncate(out_pos);
        if out.len() as u64 != expected_size {
            return Err(BitError::corrupt(format!(
                "expected inflated size {}, got {}",
                expected_size,
                out.len()
            )));
        }
        Ok(out)
    }

    /// walk the header chain without materializing delta bodies, learning
    /// just the final size (the root delta's `result_size`) and the leaf
    /// object type. cheaper than [`read_object`](Self::read_object) when a
    /// caller only needs to know what an entry *is*.
    pub fn peek_header(&self, offset: u64) -> BitResult<(BitObjType, u64)> {
        let header = self.decode_entry_header(offset)?;
        match header.kind {
            EntryKind::Object(obj_type) => Ok((obj_type, header.size)),
            EntryKind::OfsDelta(rel) => {
                let base_offset = offset
                    .checked_sub(rel)
                    .ok_or_else(|| BitError::corrupt("ofs_delta offset underflowed pack start"))?;
                let (_, result_size) = self.delta_payload_sizes(header.payload_offset)?;
                let (leaf_type, _) = self.peek_header(base_offset)?;
                Ok((leaf_type, result_size))
            }
            EntryKind::RefDelta(base_key) => {
                let base_offset = self
                    .index
                    .find(&base_key)
                    .map(|rank| self.index.offset_at(rank))
                    .ok_or_else(|| BitError::corrupt("ref_delta base not found in this pack"))?;
                let (_, result_size) = self.delta_payload_sizes(header.payload_offset)?;
                let (leaf_type, _) = self.peek_header(base_offset)?;
                Ok((leaf_type, result_size))
            }
        }
    }

    /// inflate just enough of a delta payload to read its two leading
    /// varints (`base_size`, `result_size`) without decompressing the rest.
    fn delta_payload_sizes(&self, payload_offset: u64) -> BitResult<(u64, u64)> {
        let mut decompress = Decompress::new(true);
        let mut out = vec![0u8; 32];
        loop {
            let in_pos = payload_offset + decompress.total_in();
            if in_pos >= self.size {
                return Err(BitError::corrupt("zlib stream ran past the end of the pack"));
            }
            let view = self.window(in_pos, INFLATE_CHUNK)?;
            let out_pos = decompress.total_out() as usize;
            let status = decompress
                .decompress(&view, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|err| BitError::codec(format!("zlib inflate failed: {}", err)))?;
            if decompress.total_out() as usize >= 20 || status == Status::StreamEnd {
                break;
            }
        }
        let produced = decompress.total_out() as usize;
        let mut reader = &out[..produced];
        let base_size = reader.read_size()?;
        let result_size = reader.read_size()?;
        Ok((base_size, result_size))
    }

    /// fully resolve the object at `offset`, applying any delta chain.
    ///
    /// caching is mode-dependent (see `CacheMode`): bulk/sequential
    /// consumers cache the fully-resolved bytes at this offset, since a
    /// delta chain rooted here is likely to be walked again shortly.
    /// random point lookups only cache entries that were already raw
    /// (non-delta) reads, since a resolved delta's expanded bytes are
    /// unlikely to be asked for again at the same offset and aren't worth
    /// the cache space under that access pattern.
    pub fn read_object(&mut self, offset: u64) -> BitResult<(BitObjType, Vec<u8>)> {
        if let Some((ty, data)) = self.cache.get(offset) {
            return Ok((ty, data.to_vec()));
        }

        let header = self.decode_entry_header(offset)?;
        let (result, is_delta) = match header.kind {
            EntryKind::Object(obj_type) => {
                let bytes = self.inflate_from(header.payload_offset, header.size)?;
                ((obj_type, bytes), false)
            }
            EntryKind::OfsDelta(rel) => {
                let base_offset = offset
                    .checked_sub(rel)
                    .ok_or_else(|| BitError::corrupt("ofs_delta offset underflowed pack start"))?;
                let delta_bytes = self.inflate_from(header.payload_offset, header.size)?;
                let (base_type, base_bytes) = self.read_object(base_offset)?;
                let delta = crate::delta::Delta::deserialize_from_slice(&delta_bytes)?;
                ((base_type, delta.expand(base_bytes)?), true)
            }
            EntryKind::RefDelta(base_key) => {
                let base_offset = self
                    .index
                    .find(&base_key)
                    .map(|rank| self.index.offset_at(rank))
                    .ok_or_else(|| BitError::corrupt("ref_delta base not found in this pack"))?;
                let delta_bytes = self.inflate_from(header.payload_offset, header.size)?;
                let (base_type, base_bytes) = self.read_object(base_offset)?;
                let delta = crate::delta::Delta::deserialize_from_slice(&delta_bytes)?;
                ((base_type, delta.expand(base_bytes)?), true)
            }
        };

        match self.cache.mode() {
            CacheMode::Sequential => self.cache.insert(offset, result.0, result.1.clone()),
            CacheMode::Random if !is_delta => self.cache.insert(offset, result.0, result.1.clone()),
            CacheMode::Random => {}
        }
        Ok(result)
    }

    pub fn read_by_key(&mut self, key: &Key) -> BitResult<(BitObjType, Vec<u8>)> {
        let rank = self.index.find(key).ok_or_else(|| BitError::NotFound(*key))?;
        let offset = self.index.offset_at(rank);
        self.read_object(offset)
    }

    pub fn cache(&mut self) -> &mut PackCache {
        &mut self.cache
    }

    /// a streaming reader for the object at `key`. for a non-delta entry
    /// this decompresses incrementally as the caller reads, never holding
    /// the full inflated object in memory at once; a delta entry still has
    /// to be fully resolved up front since applying copy/insert ops needs
    /// random access into the base, so it falls back to a resolved buffer.
    pub fn object(&mut self, key: &Key) -> BitResult<EntryAccessor<'_>> {
        let rank = self.index.find(key).ok_or_else(|| BitError::NotFound(*key))?;
        let offset = self.index.offset_at(rank);
        let header = self.decode_entry_header(offset)?;
        match header.kind {
            EntryKind::Object(obj_type) => Ok(EntryAccessor {
                pack: self,
                obj_type,
                state: AccessorState::Streaming {
                    decompress: Decompress::new(true),
                    pos: header.payload_offset,
                    total_size: header.size,
                    produced: 0,
                },
            }),
            EntryKind::OfsDelta(_) | EntryKind::RefDelta(_) => {
                let (obj_type, bytes) = self.read_object(offset)?;
                Ok(EntryAccessor { pack: self, obj_type, state: AccessorState::Buffered { bytes, pos: 0 } })
            }
        }
    }

    /// iterate every entry (in index rank order, not offset order) and
    /// confirm the resolved bytes hash to the key recorded for it.
    pub fn verify(&mut self) -> VerifyReport {
        info!("PackFile::verify({} entries)", self.index.num_entries());
        let mut report = VerifyReport::default();
        for rank in 0..self.index.num_entries() {
            let key = self.index.key_at(rank);
            let offset = self.index.offset_at(rank);
            match self.read_object(offset) {
                Ok((obj_type, bytes)) => {
                    let actual = hash_object_bytes(obj_type, &bytes);
                    if actual != key {
                        report.problems.push(format!(
                            "entry at offset {} hashes to {}, expected {}",
                            offset, actual, key
                        ));
                    }
                }
                Err(err) => report.problems.push(format!("entry at offset {}: {}", offset, err)),
            }
        }
        report
    }
}

enum AccessorState {
    Streaming { decompress: Decompress, pos: u64, total_size: u64, produced: u64 },
    Buffered { bytes: Vec<u8>, pos: usize },
}

/// a streaming handle onto one pack entry's uncompressed bytes, returned by
/// [`PackFile::object`].
pub struct EntryAccessor<'p> {
    pack: &'p PackFile,
    obj_type: BitObjType,
    state: AccessorState,
}

impl<'p> EntryAccessor<'p> {
    pub fn obj_type(&self) -> BitObjType {
        self.obj_type
    }
}

impl<'p> Read for EntryAccessor<'p> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.state {
            AccessorState::Buffered { bytes, pos } => {
                let n = (bytes.len() - *pos).min(buf.len());
                buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            AccessorState::Streaming { decompress, pos, total_size, produced } => {
                if produced == total_size {
                    return Ok(0);
                }
                loop {
                    if *pos >= self.pack.size {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "zlib stream ran past the end of the pack",
                        ));
                    }
                    let want = INFLATE_CHUNK.min(self.pack.size - *pos);
                    let view = self
                        .pack
                        .cursor
                        .use_region(*pos, want)
                        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

                    let before_in = decompress.total_in();
                    let before_out = decompress.total_out();
                    let status = decompress
                        .decompress(&view, buf, FlushDecompress::None)
                        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;
                    *pos += decompress.total_in() - before_in;
                    let produced_now = decompress.total_out() - before_out;
                    *produced += produced_now;

                    if produced_now > 0 || status == Status::StreamEnd {
                        return Ok(produced_now as usize);
                    }
                    // made no progress on this window (e.g. a zero-length
                    // `buf`, or the window's entire content was header
                    // bytes already consumed): pull the next window.
                    if buf.is_empty() {
                        return Ok(0);
                    }
                }
            }
        }
    }
}

/// true if `path`'s filename looks like `pack-<hex>.pack`.
pub fn is_pack_path(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == PACK_EXT)
        && path.file_stem().and_then(|s| s.to_str()).map_or(false, |s| s.starts_with("pack-"))
}

pub fn idx_path_for(pack_path: &Path) -> PathBuf {
    pack_path.with_extension(PACK_IDX_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashGenerator;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn write_type_size_header(out: &mut Vec<u8>, type_bits: u8, mut size: u64) {
        let mut first = (type_bits << 4) | (size & 0x0f) as u8;
        size >>= 4;
        if size != 0 {
            first |= 0x80;
        }
        out.push(first);
        while size != 0 {
            let mut byte = (size & 0x7f) as u8;
            size >>= 7;
            if size != 0 {
                byte |= 0x80;
            }
            out.push(byte);
        }
    }

    fn key_of(obj_type: BitObjType, bytes: &[u8]) -> Key {
        let mut gen = HashGenerator::new();
        gen.update(format!("{} {}\0", obj_type, bytes.len()));
        gen.update(bytes);
        gen.finalize()
    }

    /// hand-builds a single-object v2 pack ("blob" containing `content`)
    /// plus its matching index, writes both to `dir`, and returns the
    /// paths and the object's key.
    fn build_single_blob_pack(dir: &Path, content: &[u8]) -> (PathBuf, PathBuf, Key) {
        let key = key_of(BitObjType::Blob, content);

        let mut body = Vec::new();
        write_type_size_header(&mut body, 3, content.len() as u64); // 3 = blob
        body.extend_from_slice(&zlib_compress(content));

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&2u32.to_be_bytes());
        pack.extend_from_slice(&1u32.to_be_bytes());
        pack.extend_from_slice(&body);

        let mut pack_hasher = HashGenerator::new();
        pack_hasher.update(&pack);
        let pack_checksum = pack_hasher.finalize();
        pack.extend_from_slice(pack_checksum.as_bytes());

        let entry_offset = 12u32;
        let mut fanout = [0u32; 256];
        for b in key.as_bytes()[0] as usize..256 {
            fanout[b] = 1;
        }
        let mut idx = Vec::new();
        idx.extend_from_slice(&crate::pack::index::PACK_IDX_MAGIC.to_be_bytes());
        idx.extend_from_slice(&2u32.to_be_bytes());
        for f in fanout {
            idx.extend_from_slice(&f.to_be_bytes());
        }
        idx.extend_from_slice(key.as_bytes());
        idx.extend_from_slice(&crate::hash::crc_of(&body).to_be_bytes());
        idx.extend_from_slice(&entry_offset.to_be_bytes());
        idx.extend_from_slice(pack_checksum.as_bytes());
        let mut idx_hasher = HashGenerator::new();
        idx_hasher.update(&idx);
        idx.extend_from_slice(idx_hasher.finalize().as_bytes());

        let pack_path = dir.join("pack-test.pack");
        let idx_path = dir.join("pack-test.idx");
        std::fs::write(&pack_path, &pack).unwrap();
        std::fs::write(&idx_path, &idx).unwrap();
        (pack_path, idx_path, key)
    }

    fn open_test_pack(dir: &Path, content: &[u8]) -> (PackFile, Key) {
        let (pack_path, idx_path, key) = build_single_blob_pack(dir, content);
        let env = Environment::for_tests();
        let mmap = Arc::new(MemoryManager::new(&env));
        let mem_used = Arc::new(AtomicU64::new(0));
        let pack = PackFile::open(&pack_path, &idx_path, &mmap, mem_used, &env).unwrap();
        (pack, key)
    }

    #[test]
    fn reads_a_single_object_pack_and_verifies_clean() {
        let dir = tempdir().unwrap();
        let (mut pack, key) = open_test_pack(dir.path(), b"hello world");

        assert!(pack.has(&key));
        let (obj_type, bytes) = pack.read_by_key(&key).unwrap();
        assert_eq!(obj_type, BitObjType::Blob);
        assert_eq!(bytes, b"hello world");

        let report = pack.verify();
        assert!(report.is_ok(), "{:?}", report.problems);
    }

    #[test]
    fn rejects_pack_with_bad_checksum() {
        let dir = tempdir().unwrap();
        let (pack_path, idx_path, _key) = build_single_blob_pack(dir.path(), b"hello world");
        let mut bytes = std::fs::read(&pack_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&pack_path, &bytes).unwrap();

        let env = Environment::for_tests();
        let mmap = Arc::new(MemoryManager::new(&env));
        let mem_used = Arc::new(AtomicU64::new(0));
        assert!(PackFile::open(&pack_path, &idx_path, &mmap, mem_used, &env).is_err());
    }

    #[test]
    fn peek_header_reports_type_and_size_without_full_read() {
        let dir = tempdir().unwrap();
        let content = b"some content for peeking";
        let (mut pack, key) = open_test_pack(dir.path(), content);
        let rank = pack.index().find(&key).unwrap();
        let offset = pack.index().offset_at(rank);

        let (obj_type, size) = pack.peek_header(offset).unwrap();
        assert_eq!(obj_type, BitObjType::Blob);
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn streams_a_non_delta_entry_without_full_buffering() {
        let dir = tempdir().unwrap();
        let content = b"streamed content, read back in small chunks".repeat(8);
        let (mut pack, key) = open_test_pack(dir.path(), &content);

        let mut accessor = pack.object(&key).unwrap();
        assert_eq!(accessor.obj_type(), BitObjType::Blob);

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = accessor.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
    }

    #[test]
    fn slides_a_window_over_a_pack_larger_than_the_configured_window() {
        let dir = tempdir().unwrap();
        let content = vec![0x5au8; 200 * 1024];
        let (pack_path, idx_path, key) = build_single_blob_pack(dir.path(), &content);

        let mut env = Environment::for_tests();
        env.mmap_window_size = 8 * 1024;
        let mmap = Arc::new(MemoryManager::new(&env));
        let mem_used = Arc::new(AtomicU64::new(0));
        let mut pack = PackFile::open(&pack_path, &idx_path, &mmap, mem_used, &env).unwrap();

        let (obj_type, bytes) = pack.read_by_key(&key).unwrap();
        assert_eq!(obj_type, BitObjType::Blob);
        assert_eq!(bytes, content);
    }

    #[test]
    fn recognizes_pack_path_naming_convention() {
        assert!(is_pack_path(Path::new("/repo/objects/pack/pack-abcd.pack")));
        assert!(!is_pack_path(Path::new("/repo/objects/pack/pack-abcd.idx")));
        assert!(!is_pack_path(Path::new("/repo/objects/pack/loose.pack")));
        assert_eq!(
            idx_path_for(Path::new("/repo/pack-abcd.pack")),
            Path::new("/repo/pack-abcd.idx")
        );
    }
}
