//! a fixed-size, direct-mapped cache of fully-resolved (delta-expanded)
//! pack objects keyed by pack offset, grounded on `PackCache` in the
//! source. every offset hashes to exactly one slot; a hit requires the
//! slot's stored offset to match, so collisions simply evict whatever was
//! there. a side insertion-order list (threaded through slot indices
//! rather than raw pointers, since the source's intrusive linked list has
//! no natural Rust translation) lets [`collect`](PackCache::collect) free
//! the oldest entries in bulk when the shared memory budget is tight.

use crate::env::CacheMode;
use crate::obj::BitObjType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MIN_ENTRIES: usize = 256;
/// rough per-slot bookkeeping overhead, used only to size the random-mode
/// cache against the memory budget; doesn't account for the cached bytes
/// themselves, which are tracked separately via `mem_used`.
const SLOT_OVERHEAD: u64 = 48;

#[derive(Clone)]
struct Slot {
    offset: u64,
    entry: Option<(BitObjType, Vec<u8>)>,
    prev: usize,
    next: usize,
}

impl Slot {
    fn empty() -> Self {
        Self { offset: 0, entry: None, prev: 0, next: 0 }
    }
}

/// number of addressable slots (excluding the two list sentinels) a cache
/// should be sized to, given the access pattern and available memory.
fn entry_count(mode: CacheMode, num_pack_entries: u32, pack_size: u64, mem_avail: u64) -> usize {
    let num_pack_entries = num_pack_entries.max(1) as u64;
    let ne = match mode {
        CacheMode::Sequential => {
            let avg_obj_size = (pack_size / num_pack_entries).max(1);
            mem_avail / avg_obj_size / 140
        }
        CacheMode::Random => {
            let by_mem = mem_avail / 10 / SLOT_OVERHEAD;
            let by_entries = num_pack_entries * 3 / 4;
            by_mem.min(by_entries)
        }
    };
    ne.max(MIN_ENTRIES as u64) as usize
}

/// an offset never collides with slot 0: that index (and the last index)
/// are the list's head/tail sentinels and are never handed out.
fn offset_to_entry(offset: u64, usable_slots: u64) -> usize {
    let h = offset
        .wrapping_add(offset >> 8)
        .wrapping_add(offset >> 16)
        .wrapping_add(offset >> 24)
        .wrapping_add(offset >> 32);
    1 + (h % usable_slots) as usize
}

pub struct PackCache {
    slots: Vec<Slot>,
    mem_used: Arc<AtomicU64>,
    mem_limit: u64,
    mode: CacheMode,
    /// bytes held by this cache specifically, as opposed to `mem_used`
    /// which totals every pack's cache sharing the same budget.
    bytes_cached: u64,
    hits: u64,
    calls: u64,
}

impl PackCache {
    /// `mem_used` is shared across every pack opened by the same store, so
    /// the configured budget is a total across all of them, matching the
    /// source's process-wide `gMemory`/`gMemoryLimit` pair.
    pub fn new(
        mem_used: Arc<AtomicU64>,
        mem_limit: u64,
        mode: CacheMode,
        num_pack_entries: u32,
        pack_size: u64,
    ) -> Self {
        let mem_avail = mem_limit.saturating_sub(mem_used.load(Ordering::Relaxed));
        let ne = entry_count(mode, num_pack_entries, pack_size, mem_avail);
        let total = ne + 2;
        let tail = total - 1;
        let mut slots = vec![Slot::empty(); total];
        slots[0].next = tail;
        slots[tail].prev = 0;
        Self { slots, mem_used, mem_limit, mode, bytes_cached: 0, hits: 0, calls: 0 }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn usable_slots(&self) -> u64 {
        (self.slots.len() - 2) as u64
    }

    pub fn get(&mut self, offset: u64) -> Option<(BitObjType, &[u8])> {
        self.calls += 1;
        let idx = offset_to_entry(offset, self.usable_slots());
        match &self.slots[idx].entry {
            Some((ty, data)) if self.slots[idx].offset == offset => {
                self.hits += 1;
                Some((*ty, data.as_slice()))
            }
            _ => None,
        }
    }

    pub fn hit_rate(&self) -> f64 {
        if self.calls == 0 { 0.0 } else { self.hits as f64 / self.calls as f64 }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if self.slots[idx].entry.is_some() {
            self.slots[prev].next = next;
            self.slots[next].prev = prev;
        }
    }

    fn link_before_tail(&mut self, idx: usize) {
        let tail = self.slots.len() - 1;
        let prev = self.slots[tail].prev;
        self.slots[idx].prev = prev;
        self.slots[idx].next = tail;
        self.slots[prev].next = idx;
        self.slots[tail].prev = idx;
    }

    fn evict(&mut self, idx: usize) {
        if let Some((_, data)) = self.slots[idx].entry.take() {
            let size = data.len() as u64;
            self.mem_used.fetch_sub(size, Ordering::Relaxed);
            self.bytes_cached = self.bytes_cached.saturating_sub(size);
        }
        self.unlink(idx);
    }

    /// free at least `bytes_needed`, with the eviction order depending on
    /// the access pattern this cache was sized for.
    fn collect(&mut self, bytes_needed: u64) {
        match self.mode {
            CacheMode::Sequential => self.collect_sequential(bytes_needed),
            CacheMode::Random => {
                // a point lookup has no locality to exploit, so when eviction
                // is triggered it's worth clearing out half the cache rather
                // than trickling single entries out on every subsequent miss.
                let target = bytes_needed.max(self.bytes_cached / 2);
                self.collect_oldest(target);
            }
        }
    }

    /// evict the oldest entries (in insertion order) until at least
    /// `target` bytes have been freed, or the list is exhausted.
    fn collect_oldest(&mut self, target: u64) {
        let mut freed = 0u64;
        let tail = self.slots.len() - 1;
        let mut cur = self.slots[0].next;
        while cur != tail && freed < target {
            let next = self.slots[cur].next;
            if let Some((_, data)) = &self.slots[cur].entry {
                freed += data.len() as u64;
            }
            self.evict(cur);
            cur = next;
        }
    }

    /// one pass preferring blob entries (in insertion order), falling back
    /// to whatever's left if evicting every blob still isn't enough: a
    /// bulk consumer re-walks the same tree/commit chain far more than it
    /// revisits blobs, so blobs are the cheaper thing to re-inflate.
    fn collect_sequential(&mut self, target: u64) {
        let mut freed = 0u64;
        let tail = self.slots.len() - 1;

        let mut cur = self.slots[0].next;
        while cur != tail && freed < target {
            let next = self.slots[cur].next;
            if matches!(&self.slots[cur].entry, Some((BitObjType::Blob, _))) {
                if let Some((_, data)) = &self.slots[cur].entry {
                    freed += data.len() as u64;
                }
                self.evict(cur);
            }
            cur = next;
        }

        if freed >= target {
            return;
        }
        cur = self.slots[0].next;
        while cur != tail && freed < target {
            let next = self.slots[cur].next;
            if let Some((_, data)) = &self.slots[cur].entry {
                freed += data.len() as u64;
            }
            self.evict(cur);
            cur = next;
        }
    }

    /// cache `bytes` at `offset`. silently refuses if `bytes` alone would
    /// blow the budget, or if there's nothing left to evict to make room:
    /// the cache is an optimization, not a correctness requirement, so a
    /// miss is always an acceptable outcome.
    pub fn insert(&mut self, offset: u64, obj_type: BitObjType, bytes: Vec<u8>) {
        let size = bytes.len() as u64;
        if self.mem_limit != 0 && size * 2 > self.mem_limit {
            return;
        }

        let idx = offset_to_entry(offset, self.usable_slots());
        let old_size = self.slots[idx].entry.as_ref().map_or(0, |(_, d)| d.len() as u64);

        if self.mem_limit != 0 {
            let used = self.mem_used.load(Ordering::Relaxed);
            // the source computes `diff = min(0, size - old_size)` here, which
            // casts a possibly-negative difference to unsigned nonsense; the
            // intent is clearly "how much *more* memory would this use".
            let diff = size.saturating_sub(old_size);
            if used.saturating_sub(old_size) + size > self.mem_limit {
                trace!("PackCache::insert(offset: {}) evicting to free {} bytes", offset, diff);
                self.collect(diff);
                let used = self.mem_used.load(Ordering::Relaxed);
                if used.saturating_sub(old_size) + size > self.mem_limit {
                    return;
                }
            }
        }

        self.evict(idx);
        self.mem_used.fetch_add(size, Ordering::Relaxed);
        self.bytes_cached += size;
        self.slots[idx].offset = offset;
        self.slots[idx].entry = Some((obj_type, bytes));
        self.link_before_tail(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_counter() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    #[test]
    fn sizes_to_at_least_the_minimum_entry_count() {
        let cache = PackCache::new(shared_counter(), 0, CacheMode::Random, 4, 1000);
        assert!(cache.slots.len() - 2 >= MIN_ENTRIES);
    }

    #[test]
    fn stores_and_retrieves_by_offset() {
        let mut cache = PackCache::new(shared_counter(), 1024 * 1024, CacheMode::Random, 100, 10_000);
        cache.insert(42, BitObjType::Blob, b"hello".to_vec());
        let (ty, data) = cache.get(42).unwrap();
        assert_eq!(ty, BitObjType::Blob);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn miss_on_unseen_offset() {
        let mut cache = PackCache::new(shared_counter(), 1024, CacheMode::Random, 10, 1000);
        assert!(cache.get(7).is_none());
    }

    #[test]
    fn refuses_entries_too_large_for_the_budget() {
        let mem_used = shared_counter();
        let mut cache = PackCache::new(mem_used.clone(), 100, CacheMode::Random, 10, 1000);
        cache.insert(1, BitObjType::Blob, vec![0u8; 200]);
        assert!(cache.get(1).is_none());
        assert_eq!(mem_used.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn evicts_oldest_entries_to_make_room() {
        let mem_used = shared_counter();
        let mut cache = PackCache::new(mem_used.clone(), 100, CacheMode::Random, 10, 1000);
        cache.insert(1, BitObjType::Blob, vec![0u8; 40]);
        cache.insert(2, BitObjType::Blob, vec![0u8; 40]);
        cache.insert(3, BitObjType::Blob, vec![0u8; 40]);
        // budget of 100 can't hold all three 40-byte entries; the oldest
        // (offset 1) should have been evicted to make room for the third.
        assert!(cache.get(1).is_none());
        assert!(cache.get(3).is_some());
        assert!(mem_used.load(Ordering::Relaxed) <= 100);
    }

    #[test]
    fn sequential_mode_evicts_blobs_before_other_entries() {
        let mem_used = shared_counter();
        let mut cache = PackCache::new(mem_used.clone(), 100, CacheMode::Sequential, 10, 1000);
        cache.insert(1, BitObjType::Tree, vec![0u8; 40]);
        cache.insert(2, BitObjType::Blob, vec![0u8; 40]);
        cache.insert(3, BitObjType::Blob, vec![0u8; 40]);
        // needs 40 bytes freed for the third insert; the blob at offset 2
        // (not the older tree at offset 1) should be the one evicted.
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn random_mode_frees_at_least_half_the_cache_on_eviction() {
        let mem_used = shared_counter();
        let mut cache = PackCache::new(mem_used.clone(), 1000, CacheMode::Random, 10, 1000);
        for offset in 0..9u64 {
            cache.insert(offset, BitObjType::Blob, vec![0u8; 100]);
        }
        // 900 bytes cached against a 1000 byte budget; inserting one more
        // 100 byte entry only needs 0 bytes freed (900+100 <= 1000 isn't
        // true: 1000 <= 1000 holds), so force pressure with a bigger entry.
        cache.insert(100, BitObjType::Blob, vec![0u8; 300]);
        assert!(mem_used.load(Ordering::Relaxed) <= 1000);
        // random-mode collection targets at least half of what was cached
        // before the insert, so more than just the one entry needed for
        // `bytes_needed` should have been evicted.
        let remaining = (0..9u64).filter(|o| cache.get(*o).is_some()).count();
        assert!(remaining <= 5, "expected at least half of the old entries evicted, {} remain", remaining);
    }

    #[test]
    fn tracks_hit_rate() {
        let mut cache = PackCache::new(shared_counter(), 1024, CacheMode::Random, 10, 1000);
        cache.insert(1, BitObjType::Blob, vec![1]);
        cache.get(1);
        cache.get(2);
        assert_eq!(cache.hit_rate(), 0.5);
    }
}
