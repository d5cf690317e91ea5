//! a bounded pool of sliding-window mmaps over pack files, grounded on
//! `mapped_memory_manager`/`cursor` in the source: each open file keeps a
//! sorted, non-overlapping list of mapped regions. a request for a byte
//! range either falls inside an already-mapped region (bumping its LRU
//! usage counter) or causes a new region to be mapped, extended toward its
//! neighbours up to the configured window size and page-aligned, per
//! `cursor::use_region`. when mapping a new region would blow the memory
//! or handle budget, the globally least-recently-used *unpinned* region
//! (across every open file) is evicted first, mirroring
//! `collect_one_lru_region`; a region currently held by a caller is never
//! evicted, tracked the same way the old whole-file pool did: via the
//! strong count of the `Arc<Mmap>` shared between the registry and the
//! [`View`] handed out.

use crate::env::Environment;
use crate::error::BitError;
use crate::BitResult;
use memmap2::{Mmap, MmapOptions};
use std::collections::HashMap;
use std::fs::File;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn page_size() -> u64 {
    4096
}

/// grow `[offset, offset+size)` leftward, up to `window_size` total, without
/// crossing `left_bound`.
fn extend_left(offset: u64, size: u64, left_bound: u64, window_size: u64) -> (u64, u64) {
    if size >= window_size {
        return (offset, size);
    }
    let room = window_size - size;
    let new_offset = offset.saturating_sub(room).max(left_bound);
    (new_offset, size + (offset - new_offset))
}

/// grow `[offset, offset+size)` rightward, up to `window_size` total, without
/// crossing `right_bound`.
fn extend_right(offset: u64, size: u64, right_bound: u64, window_size: u64) -> u64 {
    if size >= window_size {
        return size;
    }
    let room = window_size - size;
    let end = offset + size;
    let new_end = (end + room).min(right_bound);
    size + new_end.saturating_sub(end)
}

/// round `offset` down to the start of its page, growing `size` to match.
fn align(offset: u64, size: u64) -> (u64, u64) {
    let page = page_size();
    let aligned_offset = offset - (offset % page);
    (aligned_offset, size + (offset - aligned_offset))
}

struct Region {
    offset: u64,
    size: u64,
    mmap: Arc<Mmap>,
    usage: u64,
}

impl Region {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.mmap) > 1
    }

    fn contains(&self, offset: u64, size: u64) -> bool {
        offset >= self.offset && offset + size <= self.offset + self.size
    }
}

struct FileState {
    file: File,
    file_size: u64,
    /// sorted by `offset`, non-overlapping.
    regions: Vec<Region>,
}

struct Inner {
    files: HashMap<PathBuf, FileState>,
    usage_counter: u64,
    memory_size: u64,
    handles: usize,
}

/// a pinned view onto a slice of a mapped pack file. derefs to `&[u8]`;
/// dropping it unpins the backing region, making it eligible for eviction
/// again.
pub struct View {
    mmap: Arc<Mmap>,
    start: usize,
    end: usize,
}

impl Deref for View {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.mmap[self.start..self.end]
    }
}

pub struct MemoryManager {
    window_size: u64,
    max_memory: u64,
    max_handles: Option<usize>,
    inner: Mutex<Inner>,
}

impl MemoryManager {
    pub fn new(env: &Environment) -> Self {
        Self {
            window_size: env.mmap_window_size,
            max_memory: env.mmap_max_memory,
            max_handles: env.mmap_max_handles,
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                usage_counter: 0,
                memory_size: 0,
                handles: 0,
            }),
        }
    }

    /// a cursor bound to `path`, matching `mapped_memory_manager::make_cursor`.
    /// takes `self` by `Arc` since a cursor may outlive the caller's
    /// particular borrow of the shared pool.
    pub fn cursor_for(self: Arc<Self>, path: impl Into<PathBuf>) -> Cursor {
        Cursor { manager: self, path: path.into() }
    }

    /// the total size of a pinned window covering `[offset, offset+size)` of
    /// `path`, mapping and evicting as needed.
    fn use_region(&self, path: &Path, offset: u64, size: u64) -> BitResult<View> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.files.contains_key(path) {
            let file = File::open(path)
                .map_err(|err| BitError::corrupt(format!("failed to open `{}`: {}", path.display(), err)))?;
            let file_size = file.metadata()?.len();
            inner.files.insert(
                path.to_path_buf(),
                FileState { file, file_size, regions: Vec::new() },
            );
        }

        let file_size = inner.files[path].file_size;
        if offset + size > file_size {
            return Err(BitError::corrupt("mapped region runs past end of file"));
        }

        let usage = {
            let counter = inner.usage_counter;
            inner.usage_counter += 1;
            counter
        };

        if let Some(pos) = inner.files[path].regions.iter().position(|r| r.contains(offset, size)) {
            let region = &mut inner.files.get_mut(path).unwrap().regions[pos];
            region.usage = usage;
            let mmap = region.mmap.clone();
            let start = (offset - region.offset) as usize;
            return Ok(View { mmap, start, end: start + size as usize });
        }

        let requested_offset = offset;
        let requested_size = size;

        let window_size = self.window_size.max(size).min(file_size.max(1));
        let pos = inner.files[path].regions.iter().position(|r| r.offset > offset).unwrap_or(inner.files[path].regions.len());
        let left_bound = if pos > 0 { inner.files[path].regions[pos - 1].offset + inner.files[path].regions[pos - 1].size } else { 0 };
        let right_bound = inner.files[path].regions.get(pos).map_or(file_size, |r| r.offset);

        let (region_offset, region_size) = extend_left(offset, size, left_bound, window_size);
        let region_size = extend_right(region_offset, region_size, right_bound, window_size);
        let (region_offset, region_size) = align(region_offset, region_size);
        let region_size = region_size.min(file_size - region_offset);

        self.make_room(&mut inner, region_size)?;

        let state = &inner.files[path];
        let mmap = unsafe {
            MmapOptions::new()
                .offset(region_offset)
                .len(region_size as usize)
                .map(&state.file)
                .map_err(|err| BitError::corrupt(format!("failed to mmap `{}`: {}", path.display(), err)))?
        };
        let mmap = Arc::new(mmap);

        let state = inner.files.get_mut(path).unwrap();
        let insert_at = state.regions.iter().position(|r| r.offset > region_offset).unwrap_or(state.regions.len());
        state.regions.insert(insert_at, Region { offset: region_offset, size: region_size, mmap: mmap.clone(), usage });
        inner.memory_size += region_size;
        inner.handles += 1;

        let start = (requested_offset - region_offset) as usize;
        Ok(View { mmap, start, end: start + requested_size as usize })
    }

    fn make_room(&self, inner: &mut Inner, incoming: u64) -> BitResult<()> {
        loop {
            let exceeds_memory = self.max_memory != 0 && inner.memory_size + incoming > self.max_memory;
            let exceeds_handles = self.max_handles.map_or(false, |max| inner.handles >= max);
            if !exceeds_memory && !exceeds_handles {
                return Ok(());
            }

            let mut victim: Option<(PathBuf, usize, u64)> = None;
            for (path, state) in inner.files.iter() {
                for (idx, region) in state.regions.iter().enumerate() {
                    if region.is_pinned() {
                        continue;
                    }
                    if victim.as_ref().map_or(true, |(_, _, usage)| region.usage < *usage) {
                        victim = Some((path.clone(), idx, region.usage));
                    }
                }
            }

            match victim {
                Some((path, idx, _)) => {
                    let state = inner.files.get_mut(&path).unwrap();
                    let removed = state.regions.remove(idx);
                    inner.memory_size -= removed.size;
                    inner.handles -= 1;
                }
                None => return Err(BitError::ResourceExhausted),
            }
        }
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.inner.lock().unwrap().memory_size
    }

    pub fn num_mapped(&self) -> usize {
        self.inner.lock().unwrap().files.values().map(|f| f.regions.len()).sum()
    }
}

/// a handle bound to one file, handed out `View`s over byte ranges of it.
pub struct Cursor {
    manager: Arc<MemoryManager>,
    path: PathBuf,
}

impl Cursor {
    pub fn use_region(&self, offset: u64, size: u64) -> BitResult<View> {
        self.manager.use_region(&self.path, offset, size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
