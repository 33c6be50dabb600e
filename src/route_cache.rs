//! LRU memo of static route lookups
//!
//! Keys are `(host, path)`. Misses are memoized as well as hits. The whole
//! cache is dropped whenever the router swaps in a new snapshot; inserts are
//! tagged with the snapshot generation they were computed against and are
//! discarded if that snapshot has since been replaced.

use crate::lru::LruList;
use crate::store::StaticRoute;
use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 100;

/// A static route together with the path to send upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRouteMatch {
    pub route: StaticRoute,
    pub target_path: String,
}

/// Memoized outcome of one lookup; `None` records that nothing matched
pub type CachedLookup = Option<StaticRouteMatch>;

pub struct RouteCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    generation: u64,
    entries: LruList<String, CachedLookup>,
}

impl RouteCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                generation: 0,
                entries: LruList::with_capacity(capacity),
            }),
        }
    }

    fn key(host: &str, path: &str) -> String {
        format!("{}\n{}", host, path)
    }

    /// Outer `None` is a cache miss
    pub fn get(&self, host: &str, path: &str) -> Option<CachedLookup> {
        let mut inner = self.inner.lock();
        inner.entries.touch(&Self::key(host, path)).cloned()
    }

    /// Store a lookup computed against snapshot `generation`. Returns false
    /// when the snapshot was superseded and the value was dropped.
    pub fn insert(&self, generation: u64, host: &str, path: &str, lookup: CachedLookup) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }

        let key = Self::key(host, path);
        if !inner.entries.contains(&key) {
            while inner.entries.len() >= self.capacity {
                if inner.entries.pop_lru().is_none() {
                    break;
                }
            }
        }
        inner.entries.insert(key, lookup);
        true
    }

    /// Drop every entry and accept inserts only for `generation` from now on
    pub fn reset(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.generation = generation;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
