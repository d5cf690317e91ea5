//! the union view over every pack file under an `objects/pack` directory.
//! grounded on `odb_pack`: a lazily-populated list of packs, refreshed on
//! demand, searched in listing order for a key.

use crate::env::{CacheMode, Environment};
use crate::error::BitError;
use crate::hash::Key;
use crate::mmap::MemoryManager;
use crate::obj::BitObjType;
use crate::pack::file::{idx_path_for, is_pack_path, PackFile};
use crate::BitResult;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub struct PackedStore {
    dir: PathBuf,
    mmap: Arc<MemoryManager>,
    mem_used: Arc<AtomicU64>,
    env: Environment,
    packs: HashMap<PathBuf, PackFile>,
    /// listing order at the time of the last scan; determines lookup order.
    order: Vec<PathBuf>,
    loaded: bool,
}

impl PackedStore {
    pub fn new(dir: impl Into<PathBuf>, env: Environment) -> Self {
        Self {
            dir: dir.into(),
            mmap: Arc::new(MemoryManager::new(&env)),
            mem_used: Arc::new(AtomicU64::new(0)),
            env,
            packs: HashMap::new(),
            order: Vec::new(),
            loaded: false,
        }
    }

    fn ensure_loaded(&mut self) -> BitResult<()> {
        if !self.loaded {
            self.loaded = true;
            self.refresh()?;
        }
        Ok(())
    }

    /// rescan `dir`: open any new `pack-*.pack` files found, and drop any
    /// previously-opened pack whose backing file has since vanished.
    pub fn refresh(&mut self) -> BitResult<()> {
        trace!("PackedStore::refresh(dir: {})", self.dir.display());
        let mut seen = Vec::new();

        if self.dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(&self.dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| is_pack_path(p))
                .collect();
            entries.sort();

            for pack_path in entries {
                seen.push(pack_path.clone());
                if self.packs.contains_key(&pack_path) {
                    continue;
                }
                let idx_path = idx_path_for(&pack_path);
                if !idx_path.exists() {
                    continue;
                }
                debug!("PackedStore::refresh opening new pack {}", pack_path.display());
                let pack = PackFile::open(
                    &pack_path,
                    &idx_path,
                    &self.mmap,
                    self.mem_used.clone(),
                    &self.env,
                )?;
                self.packs.insert(pack_path.clone(), pack);
            }
        }

        let dropped = self.packs.keys().filter(|path| !seen.contains(path) && !path.exists()).count();
        if dropped > 0 {
            debug!("PackedStore::refresh dropping {} vanished pack(s)", dropped);
        }
        self.packs.retain(|path, _| seen.contains(path) || path.exists());
        self.order = seen;
        Ok(())
    }

    pub fn has(&mut self, key: &Key) -> BitResult<bool> {
        self.ensure_loaded()?;
        Ok(self.order.iter().filter_map(|p| self.packs.get(p)).any(|pack| pack.has(key)))
    }

    pub fn get(&mut self, key: &Key) -> BitResult<(BitObjType, Vec<u8>)> {
        self.ensure_loaded()?;
        for path in self.order.clone() {
            if let Some(pack) = self.packs.get_mut(&path) {
                if pack.has(key) {
                    return pack.read_by_key(key);
                }
            }
        }
        Err(BitError::NotFound(*key))
    }

    /// propagate a new cache budget to every currently-open pack; a zero
    /// limit clears every pack's cache by re-sizing it to zero capacity.
    pub fn set_cache_memory_limit(&mut self, bytes: u64, mode: CacheMode) {
        self.env.pack_cache_memory_limit = bytes;
        self.env.pack_cache_mode = mode;
        self.mem_used.store(0, std::sync::atomic::Ordering::Relaxed);
        for pack in self.packs.values_mut() {
            let num_entries = pack.index().num_entries();
            let pack_size = 0; // re-sizing only; pack_size only matters in sequential mode
            *pack.cache() =
                crate::pack::cache::PackCache::new(self.mem_used.clone(), bytes, mode, num_entries, pack_size);
        }
    }

    pub fn num_packs(&mut self) -> BitResult<usize> {
        self.ensure_loaded()?;
        Ok(self.packs.len())
    }

    pub fn pack_paths(&mut self) -> BitResult<Vec<PathBuf>> {
        self.ensure_loaded()?;
        Ok(self.order.clone())
    }
}
