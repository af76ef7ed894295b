//! Node cache.
//!
//! A byte-budget LRU shared by every snapshot of a ledger. Entries are
//! resolved index nodes; admission and eviction are serialized behind one
//! lock while lookups clone `Arc`s out. Resolution errors are never
//! admitted.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Floor for the configured byte budget.
pub const MIN_MEMORY_BYTES: u64 = 1 << 20;

/// Values report their own weight for budget accounting.
pub trait Weighted {
    fn weight_bytes(&self) -> u64;
}

/// Size-bounded LRU by byte weight.
pub struct ByteLru<K: Eq + Hash, V> {
    inner: Mutex<ByteLruInner<K, V>>,
    budget: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct ByteLruInner<K: Eq + Hash, V> {
    lru: LruCache<K, Arc<V>>,
    used_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits.saturating_add(self.misses);
        if total == 0 {
            return None;
        }
        Some(self.hits as f64 / total as f64)
    }
}

impl<K, V> std::fmt::Debug for ByteLru<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteLru")
            .field("budget", &self.budget)
            .field("used", &self.inner.lock().used_bytes)
            .finish()
    }
}

impl<K, V> ByteLru<K, V>
where
    K: Eq + Hash,
    V: Weighted,
{
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(ByteLruInner {
                lru: LruCache::unbounded(),
                used_bytes: 0,
            }),
            budget: budget_bytes.max(MIN_MEMORY_BYTES),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let value = self.inner.lock().lru.get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn insert(&self, key: K, value: Arc<V>) {
        let weight = value.weight_bytes();
        let mut guard = self.inner.lock();
        if let Some(old) = guard.lru.put(key, value) {
            guard.used_bytes = guard.used_bytes.saturating_sub(old.weight_bytes());
        }
        guard.used_bytes += weight;
        while guard.used_bytes > self.budget {
            match guard.lru.pop_lru() {
                Some((_, evicted)) => {
                    guard.used_bytes = guard.used_bytes.saturating_sub(evicted.weight_bytes());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.lru.clear();
        guard.used_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: guard.lru.len(),
            used_bytes: guard.used_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Blob(u64);

    impl Weighted for Blob {
        fn weight_bytes(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn budget_floor_is_one_mib() {
        let cache: ByteLru<u32, Blob> = ByteLru::new(0);
        assert_eq!(cache.budget, MIN_MEMORY_BYTES);
    }

    #[test]
    fn eviction_follows_lru_order_by_weight() {
        let cache: ByteLru<u32, Blob> = ByteLru::new(MIN_MEMORY_BYTES);
        let half = MIN_MEMORY_BYTES / 2;
        cache.insert(1, Arc::new(Blob(half)));
        cache.insert(2, Arc::new(Blob(half)));
        // Touch 1 so 2 becomes the eviction candidate.
        assert!(cache.get(&1).is_some());
        cache.insert(3, Arc::new(Blob(half)));
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&3).is_some());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.used_bytes <= MIN_MEMORY_BYTES);
        assert!(stats.hit_rate().expect("rate") > 0.5);
    }

    #[test]
    fn reinsert_replaces_weight() {
        let cache: ByteLru<u32, Blob> = ByteLru::new(MIN_MEMORY_BYTES);
        cache.insert(1, Arc::new(Blob(1000)));
        cache.insert(1, Arc::new(Blob(200)));
        assert_eq!(cache.stats().used_bytes, 200);
        assert_eq!(cache.stats().entries, 1);
    }
}
