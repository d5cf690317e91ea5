//! storage backends and the top-level facade that searches them in order:
//! in-memory state first, then loose objects, then packs. grounded on
//! `BitObjDb`/`BitLooseObjDb`/`BitPackedObjDb` in the source, collapsed from
//! a trait-object backend list into three concrete fields since there is
//! only ever this one fixed set of backends.

use crate::env::{CacheMode, Environment};
use crate::error::BitError;
use crate::hash::Key;
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::obj::{hash_object_bytes, BitObjType, Object};
use crate::pack::PackedStore;
use crate::BitResult;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// one-file-per-object storage under `<root>/<xx>/<38 hex chars>`.
pub struct LooseStore {
    root: PathBuf,
}

impl LooseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &Key) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..])
    }

    pub fn has(&self, key: &Key) -> bool {
        self.path_for(key).exists()
    }

    pub fn read(&self, key: &Key) -> BitResult<(BitObjType, Vec<u8>)> {
        let path = self.path_for(key);
        let file = std::fs::File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => BitError::NotFound(*key),
            _ => BitError::Io(err),
        })?;
        let mut reader = BufReader::new(ZlibDecoder::new(file));
        let header = crate::obj::read_obj_header(&mut reader)?;
        let mut bytes = Vec::with_capacity(header.size as usize);
        reader.read_to_end(&mut bytes)?;
        if bytes.len() as u64 != header.size {
            return Err(BitError::corrupt(format!(
                "loose object `{}` header declares {} bytes, found {}",
                key,
                header.size,
                bytes.len()
            )));
        }
        Ok((header.obj_type, bytes))
    }

    /// write `bytes` under the canonical header for `obj_type`. a no-op if
    /// an object with the resulting key is already present: loose objects
    /// are immutable, so a repeat write of identical content changes
    /// nothing. goes through a lockfile so a concurrent reader never
    /// observes a partial file.
    pub fn write(&self, obj_type: BitObjType, bytes: &[u8]) -> BitResult<Key> {
        let key = hash_object_bytes(obj_type, bytes);
        let path = self.path_for(&key);
        if path.exists() {
            trace!("LooseStore::write(key: {}) already present, skipping", key);
            return Ok(key);
        }

        debug!("LooseStore::write(key: {}, obj_type: {}, size: {})", key, obj_type, bytes.len());
        Lockfile::with_mut(&path, LockfileFlags::SET_READONLY, |lockfile| {
            let mut encoder = ZlibEncoder::new(lockfile, Compression::default());
            write!(encoder, "{} {}\0", obj_type, bytes.len())?;
            encoder.write_all(bytes)?;
            encoder.finish()?;
            Ok(())
        })?;
        Ok(key)
    }

    /// every valid 40-hex-char key found under the two-level layout;
    /// anything that doesn't parse as one is silently skipped.
    pub fn iter(&self) -> BitResult<Vec<Key>> {
        let mut keys = Vec::new();
        if !self.root.is_dir() {
            return Ok(keys);
        }
        for dir_entry in std::fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let prefix = dir_entry.file_name();
            let prefix = match prefix.to_str() {
                Some(s) if s.len() == 2 => s.to_owned(),
                _ => continue,
            };
            if !dir_entry.path().is_dir() {
                continue;
            }
            for file_entry in std::fs::read_dir(dir_entry.path())? {
                let file_entry = file_entry?;
                let suffix = file_entry.file_name();
                let suffix = match suffix.to_str() {
                    Some(s) if s.len() == 38 => s,
                    _ => continue,
                };
                if let Ok(key) = format!("{}{}", prefix, suffix).parse::<Key>() {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

/// a process-local keyed map, used for tests, scratch staging, and objects
/// that should never touch disk.
#[derive(Default)]
pub struct MemoryStore {
    objects: HashMap<Key, (BitObjType, Vec<u8>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.objects.contains_key(key)
    }

    pub fn get(&self, key: &Key) -> Option<(BitObjType, &[u8])> {
        self.objects.get(key).map(|(ty, bytes)| (*ty, bytes.as_slice()))
    }

    /// overwrites idempotently on collision: content-addressing guarantees
    /// a colliding key carries identical bytes.
    pub fn put(&mut self, obj_type: BitObjType, bytes: Vec<u8>) -> Key {
        let key = hash_object_bytes(obj_type, &bytes);
        self.objects.insert(key, (obj_type, bytes));
        key
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.objects.keys()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// unifies the three backends: an in-memory scratch store, the loose
/// object store, and the packed store, searched in that order.
pub struct ObjectDb {
    memory: MemoryStore,
    loose: LooseStore,
    packed: PackedStore,
}

impl ObjectDb {
    pub fn new(objects_dir: impl AsRef<Path>, env: Environment) -> Self {
        let objects_dir = objects_dir.as_ref();
        Self {
            memory: MemoryStore::new(),
            loose: LooseStore::new(objects_dir),
            packed: PackedStore::new(objects_dir.join("pack"), env),
        }
    }

    pub fn has(&mut self, key: &Key) -> BitResult<bool> {
        if self.memory.has(key) || self.loose.has(key) {
            return Ok(true);
        }
        self.packed.has(key)
    }

    pub fn get(&mut self, key: &Key) -> BitResult<Object> {
        let (obj_type, bytes) = self.get_raw(key)?;
        Object::from_slice(obj_type, bytes.len() as u64, &bytes)
    }

    pub fn get_raw(&mut self, key: &Key) -> BitResult<(BitObjType, Vec<u8>)> {
        trace!("ObjectDb::get_raw(key: {})", key);
        if let Some((ty, bytes)) = self.memory.get(key) {
            return Ok((ty, bytes.to_vec()));
        }
        if self.loose.has(key) {
            return self.loose.read(key);
        }
        self.packed.get(key)
    }

    /// always lands in the loose backend: packs are read-only.
    pub fn put_loose(&self, obj_type: BitObjType, bytes: &[u8]) -> BitResult<Key> {
        self.loose.write(obj_type, bytes)
    }

    pub fn put_memory(&mut self, obj_type: BitObjType, bytes: Vec<u8>) -> Key {
        self.memory.put(obj_type, bytes)
    }

    pub fn refresh_packs(&mut self) -> BitResult<()> {
        self.packed.refresh()
    }

    pub fn set_pack_cache_memory_limit(&mut self, bytes: u64, mode: CacheMode) {
        self.packed.set_cache_memory_limit(bytes, mode)
    }

    pub fn loose(&self) -> &LooseStore {
        &self.loose
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::Blob;
    use crate::serialize::Serialize;
    use tempfile::tempdir;

    fn blob_bytes(content: &[u8]) -> Vec<u8> {
        let blob = Blob::new(content.to_vec());
        let mut buf = vec![];
        blob.serialize(&mut buf).unwrap();
        buf
    }

    #[test]
    fn memory_store_put_then_get_roundtrips() {
        let mut store = MemoryStore::new();
        let key = store.put(BitObjType::Blob, blob_bytes(b"hello"));
        assert_eq!(key.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        let (ty, bytes) = store.get(&key).unwrap();
        assert_eq!(ty, BitObjType::Blob);
        assert_eq!(bytes, blob_bytes(b"hello"));
    }

    #[test]
    fn memory_store_put_is_idempotent_on_identical_content() {
        let mut store = MemoryStore::new();
        let a = store.put(BitObjType::Blob, blob_bytes(b"same"));
        let b = store.put(BitObjType::Blob, blob_bytes(b"same"));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn loose_store_write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let store = LooseStore::new(dir.path());
        let bytes = blob_bytes(b"hello world");
        let key = store.write(BitObjType::Blob, &bytes).unwrap();
        assert!(store.has(&key));

        let (ty, read_back) = store.read(&key).unwrap();
        assert_eq!(ty, BitObjType::Blob);
        assert_eq!(read_back, bytes);
    }

    #[test]
    fn loose_store_write_is_a_no_op_on_existing_key() {
        let dir = tempdir().unwrap();
        let store = LooseStore::new(dir.path());
        let bytes = blob_bytes(b"idempotent");
        let key_a = store.write(BitObjType::Blob, &bytes).unwrap();
        let path = store.path_for(&key_a);
        let modified_before = std::fs::metadata(&path).unwrap().modified().unwrap();

        let key_b = store.write(BitObjType::Blob, &bytes).unwrap();
        assert_eq!(key_a, key_b);
        let modified_after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified_before, modified_after);
    }

    #[test]
    fn loose_store_iter_finds_every_written_key() {
        let dir = tempdir().unwrap();
        let store = LooseStore::new(dir.path());
        let k1 = store.write(BitObjType::Blob, &blob_bytes(b"one")).unwrap();
        let k2 = store.write(BitObjType::Blob, &blob_bytes(b"two")).unwrap();

        let mut found = store.iter().unwrap();
        found.sort();
        let mut expected = vec![k1, k2];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn loose_store_read_of_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let store = LooseStore::new(dir.path());
        assert!(matches!(store.read(&Key::NULL), Err(BitError::NotFound(_))));
    }

    #[test]
    fn object_db_searches_memory_before_loose() {
        let dir = tempdir().unwrap();
        let mut db = ObjectDb::new(dir.path(), Environment::for_tests());

        let bytes = blob_bytes(b"shadowed");
        let loose_key = db.put_loose(BitObjType::Blob, &bytes).unwrap();
        let mem_key = db.put_memory(BitObjType::Blob, blob_bytes(b"memory wins"));
        assert_ne!(loose_key, mem_key);

        assert!(db.has(&loose_key).unwrap());
        let obj = db.get(&mem_key).unwrap();
        assert_eq!(obj.into_blob().unwrap().bytes, b"memory wins");
    }
}
