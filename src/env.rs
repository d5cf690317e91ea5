//! process-wide knobs collapsed into an explicit value, per the source's
//! globals (`PackCache::gMemoryLimit`/`gMemory`, the implicit per-process
//! mmap manager singleton) being redesigned as something threaded through
//! constructors instead of ambient state.

/// which access pattern a [`crate::pack::cache::PackCache`] should size and
/// evict for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// object lookup by key: any object, base or not, may be consulted next.
    Random,
    /// bulk consumers (verify, streaming export): delta chains rooted at
    /// the same base arrive in close succession.
    Sequential,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Random
    }
}

/// configuration threaded through every store constructor. tests build a
/// fresh `Environment` rather than relying on shared process-wide state.
#[derive(Debug, Clone)]
pub struct Environment {
    pub mmap_window_size: u64,
    pub mmap_max_memory: u64,
    pub mmap_max_handles: Option<usize>,
    pub pack_cache_memory_limit: u64,
    pub pack_cache_mode: CacheMode,
}

impl Default for Environment {
    fn default() -> Self {
        let is_64_bit = std::mem::size_of::<usize>() >= 8;
        Self {
            mmap_window_size: if is_64_bit { 1024 * 1024 * 1024 } else { 32 * 1024 * 1024 },
            mmap_max_memory: if is_64_bit {
                8192 * 1024 * 1024
            } else {
                512 * 1024 * 1024
            },
            mmap_max_handles: None,
            pack_cache_memory_limit: 0,
            pack_cache_mode: CacheMode::Random,
        }
    }
}

impl Environment {
    /// an environment tuned for tests that want to exercise eviction paths
    /// without mapping gigabytes of address space.
    pub fn for_tests() -> Self {
        Self {
            mmap_window_size: 64 * 1024,
            mmap_max_memory: 256 * 1024,
            mmap_max_handles: Some(8),
            pack_cache_memory_limit: 1024 * 1024,
            pack_cache_mode: CacheMode::Random,
        }
    }
}
