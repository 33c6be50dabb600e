//! Sharded LRU cache of whole HTTP responses
//!
//! Each shard owns an independent lock, LRU order and byte budget
//! (`capacity_bytes / shards`). Entries expire after a fixed TTL, lazily on
//! read and proactively by a per-shard sweeper task.

use crate::lru::LruList;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ENTRY_BYTES: usize = 1024 * 1024;

/// A stored response. Headers are an owned copy of what the backend sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Bytes charged against the shard budget
    pub size: usize,
    pub created: Instant,
}

impl CachedResponse {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= ttl
    }
}

/// Bytes an entry is charged for: key, header names and values, body
pub fn entry_size(key: &str, headers: &[(String, String)], body: &[u8]) -> usize {
    key.len()
        + headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum::<usize>()
        + body.len()
}

/// Key for a proxied GET. The host leads so one route's entries can be
/// found again when that route changes.
pub fn request_key(host: &str, backend: &str, target: &str) -> String {
    format!("GET {} {}{}", host, backend, target)
}

/// Status and header rules, independent of size
pub fn is_cacheable(status: u16, headers: &[(String, String)]) -> bool {
    if status != 200 {
        return false;
    }
    !headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("set-cookie")
            || (name.eq_ignore_ascii_case("cache-control")
                && value
                    .split(',')
                    .any(|directive| directive.trim().eq_ignore_ascii_case("no-store")))
    })
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    rejected: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    size_drift: AtomicU64,
}

/// Point-in-time counters, served by the admin endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub shards: usize,
    pub entries: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub rejected: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Times a shard's running byte total disagreed with its entries
    pub size_drift: u64,
}

struct Shard {
    entries: LruList<String, Arc<CachedResponse>>,
    bytes: usize,
}

impl Shard {
    fn remove(&mut self, key: &String) -> Option<Arc<CachedResponse>> {
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

pub struct ResponseCache {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    max_entry_bytes: usize,
    ttl: Duration,
    stats: Stats,
}

impl ResponseCache {
    /// `shards` is rounded up to a power of two
    pub fn new(shards: usize, capacity_bytes: usize, max_entry_bytes: usize, ttl: Duration) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruList::new(),
                    bytes: 0,
                })
            })
            .collect();

        Self {
            shards,
            shard_capacity: capacity_bytes / shard_count,
            max_entry_bytes,
            ttl,
            stats: Stats::default(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_capacity(&self) -> usize {
        self.shard_capacity
    }

    pub fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.shards.len() - 1)
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        &self.shards[self.shard_index(key)]
    }

    /// Fresh entries are promoted to most recently used. Expired ones are
    /// removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<Arc<CachedResponse>> {
        let key = key.to_string();
        let mut shard = self.shard(&key).lock();

        let expired = match shard.entries.touch(&key) {
            Some(entry) if !entry.is_expired(self.ttl, Instant::now()) => {
                let entry = Arc::clone(entry);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            shard.remove(&key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response if it is cacheable and fits. Returns whether it was
    /// stored.
    pub fn set(&self, key: &str, status: u16, headers: &[(String, String)], body: &[u8]) -> bool {
        let size = entry_size(key, headers, body);
        if !is_cacheable(status, headers) || size > self.max_entry_bytes || size > self.shard_capacity {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key, status, size, "Response not cacheable");
            return false;
        }

        let entry = Arc::new(CachedResponse {
            status,
            headers: headers.to_vec(),
            body: body.to_vec(),
            size,
            created: Instant::now(),
        });

        let key = key.to_string();
        let index = self.shard_index(&key);
        let mut shard = self.shards[index].lock();
        shard.remove(&key);

        if shard.bytes + size > self.shard_capacity {
            while shard.bytes + size > self.shard_capacity {
                let Some((_, evicted)) = shard.entries.pop_lru() else {
                    break;
                };
                shard.bytes = shard.bytes.saturating_sub(evicted.size);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.reconcile(index, &mut shard);
        }

        shard.bytes += size;
        shard.entries.insert(key, entry);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Explicit invalidation
    pub fn delete(&self, key: &str) -> bool {
        let key = key.to_string();
        self.shard(&key).lock().remove(&key).is_some()
    }

    /// Drop every entry stored for `host`, whatever backend served it.
    /// Returns the number removed.
    pub fn delete_host(&self, host: &str) -> usize {
        let prefix = format!("GET {} ", host);
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<String> = shard
                .entries
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                shard.remove(key);
            }
            removed += doomed.len();
        }
        if removed > 0 {
            debug!(host, removed, "Invalidated cached responses");
        }
        removed
    }

    /// Recompute the shard's resident bytes from its entries and surface any
    /// disagreement with the running total
    fn reconcile(&self, index: usize, shard: &mut Shard) {
        let actual: usize = shard.entries.iter().map(|(_, e)| e.size).sum();
        if actual != shard.bytes {
            self.stats.size_drift.fetch_add(1, Ordering::Relaxed);
            warn!(
                shard = index,
                tracked = shard.bytes,
                actual,
                "Response cache size accounting drifted, correcting"
            );
            shard.bytes = actual;
        }
    }

    /// Drop expired entries from the cold end of one shard
    pub fn sweep_shard(&self, index: usize) -> usize {
        let Some(shard) = self.shards.get(index) else {
            return 0;
        };
        let mut shard = shard.lock();
        let now = Instant::now();
        let mut removed = 0;

        loop {
            let expired_key = match shard.entries.peek_lru() {
                Some((key, entry)) if entry.is_expired(self.ttl, now) => key.clone(),
                _ => break,
            };
            shard.remove(&expired_key);
            removed += 1;
        }

        if removed > 0 {
            self.stats
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            self.reconcile(index, &mut shard);
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        (0..self.shards.len()).map(|i| self.sweep_shard(i)).sum()
    }

    /// One sweeper task per shard, all stopping on shutdown
    pub fn spawn_sweepers(
        self: &Arc<Self>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.shards.len())
            .map(|index| {
                let cache = Arc::clone(self);
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {
                                let removed = cache.sweep_shard(index);
                                if removed > 0 {
                                    debug!(shard = index, removed, "Swept expired responses");
                                }
                            }
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = self.shards.iter().fold((0, 0), |(n, b), shard| {
            let shard = shard.lock();
            (n + shard.entries.len(), b + shard.bytes)
        });

        CacheStats {
            shards: self.shards.len(),
            entries,
            bytes,
            capacity_bytes: self.shard_capacity * self.shards.len(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            size_drift: self.stats.size_drift.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<(String, String)> {
        vec![("Content-Type".to_string(), "text/plain".to_string())]
    }

    fn single_shard(capacity: usize) -> ResponseCache {
        ResponseCache::new(1, capacity, capacity, Duration::from_secs(60))
    }

    #[test]
    fn test_shards_round_up_to_power_of_two() {
        let cache = ResponseCache::new(5, 8 * 1024, 1024, Duration::from_secs(1));
        assert_eq!(cache.shard_count(), 8);
        assert_eq!(cache.shard_capacity(), 1024);
        assert_eq!(ResponseCache::new(0, 1024, 1024, Duration::from_secs(1)).shard_count(), 1);
    }

    #[test]
    fn test_set_then_get() {
        let cache = ResponseCache::new(16, 1 << 20, 1 << 16, Duration::from_secs(60));
        assert!(cache.set("GET svc:80/a", 200, &headers(), b"hello"));

        let entry = cache.get("GET svc:80/a").unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.body, b"hello");
        assert_eq!(entry.headers, headers());
        assert!(cache.get("GET svc:80/b").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_get_twice_returns_same_entry() {
        let cache = single_shard(4096);
        cache.set("k", 200, &headers(), b"body");
        let first = cache.get("k").unwrap();
        let second = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_oversized_entry_is_noop() {
        let cache = ResponseCache::new(1, 1 << 20, 100, Duration::from_secs(60));
        assert!(!cache.set("k", 200, &[], &[0u8; 200]));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected, 1);
    }

    #[test]
    fn test_uncacheable_responses_are_noop() {
        let cache = single_shard(4096);
        let cookie = vec![("Set-Cookie".to_string(), "session=1".to_string())];
        assert!(!cache.set("a", 200, &cookie, b"x"));

        let no_store = vec![("cache-control".to_string(), "private, No-Store".to_string())];
        assert!(!cache.set("b", 200, &no_store, b"x"));

        assert!(!cache.set("c", 404, &headers(), b"x"));
        assert!(cache.is_empty());

        let max_age = vec![("Cache-Control".to_string(), "max-age=60".to_string())];
        assert!(cache.set("d", 200, &max_age, b"x"));
    }

    #[test]
    fn test_lru_eviction_respects_budget() {
        // Each entry is 1 (key) + 99 (body) = 100 bytes
        let cache = single_shard(300);
        let body = [b'x'; 99];
        cache.set("a", 200, &[], &body);
        cache.set("b", 200, &[], &body);
        cache.set("c", 200, &[], &body);
        assert!(cache.get("a").is_some());

        cache.set("d", 200, &[], &body);
        assert!(cache.resident_bytes() <= 300);
        assert!(cache.get("b").is_none(), "least recently used entry goes first");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().size_drift, 0);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let cache = single_shard(1000);
        for i in 0..50 {
            let body = vec![b'x'; (i * 37) % 300];
            cache.set(&format!("key-{}", i), 200, &headers(), &body);
            assert!(cache.resident_bytes() <= 1000);
        }
    }

    #[test]
    fn test_replace_updates_bytes() {
        let cache = single_shard(1000);
        cache.set("k", 200, &[], &[0u8; 100]);
        cache.set("k", 200, &[], &[0u8; 10]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resident_bytes(), 11);
    }

    #[test]
    fn test_delete() {
        let cache = single_shard(1000);
        cache.set("k", 200, &[], b"v");
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn test_delete_host_spares_other_hosts() {
        let cache = ResponseCache::new(4, 64 * 1024, 4096, Duration::from_secs(60));
        cache.set(&request_key("api.example.com", "a:80", "/x"), 200, &[], b"1");
        cache.set(&request_key("api.example.com", "b:80", "/y"), 200, &[], b"2");
        cache.set(&request_key("api.example.com.evil", "a:80", "/x"), 200, &[], b"3");
        cache.set(&request_key("web.example.com", "a:80", "/x"), 200, &[], b"4");

        assert_eq!(cache.delete_host("api.example.com"), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&request_key("api.example.com", "a:80", "/x")).is_none());
        assert!(cache.get(&request_key("web.example.com", "a:80", "/x")).is_some());
        assert_eq!(cache.delete_host("api.example.com"), 0);
    }

    #[test]
    fn test_request_key_layout() {
        assert_ne!(
            request_key("a.example.com", "svc:80", "/x"),
            request_key("b.example.com", "svc:80", "/x")
        );
        assert_eq!(request_key("a.example.com", "svc:80", "/x"), "GET a.example.com svc:80/x");
    }

    #[test]
    fn test_lazy_expiry_on_get() {
        let cache = ResponseCache::new(1, 1000, 1000, Duration::from_millis(20));
        cache.set("k", 200, &[], b"v");
        std::thread::sleep(Duration::from_millis(40));

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_sweep_removes_expired_tail() {
        let cache = ResponseCache::new(4, 4000, 1000, Duration::from_millis(20));
        for i in 0..10 {
            cache.set(&format!("k{}", i), 200, &[], b"v");
        }
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.sweep(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let cache = single_shard(1000);
        cache.set("k", 200, &[], b"v");
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_is_cacheable() {
        assert!(is_cacheable(200, &headers()));
        assert!(!is_cacheable(301, &headers()));
        assert!(!is_cacheable(
            200,
            &[("SET-COOKIE".to_string(), "a=b".to_string())]
        ));
    }

    #[tokio::test]
    async fn test_sweepers_run_and_stop() {
        let cache = Arc::new(ResponseCache::new(2, 2000, 1000, Duration::from_millis(10)));
        cache.set("a", 200, &[], b"v");
        cache.set("b", 200, &[], b"v");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = cache.spawn_sweepers(Duration::from_millis(20), shutdown_rx);
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("sweeper should stop")
                .unwrap();
        }
    }
}
