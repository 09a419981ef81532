use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use time::OffsetDateTime;

use crate::ForgedLeaf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

/// Bounded per-host cache of forged leaves.
///
/// Keys are hostnames with the port already stripped by the caller; no
/// further normalization happens here. Entries the cache knows to be invalid
/// (expired, or recorded for a different host) are dropped on lookup and
/// counted as misses, so the handshake never sees a stale leaf.
pub struct LeafCache {
    entries: Mutex<LruCache<String, Arc<ForgedLeaf>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LeafCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<ForgedLeaf>> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        match entries.get(host) {
            Some(leaf) if leaf.is_valid_for(host, OffsetDateTime::now_utc()) => {
                let leaf = Arc::clone(leaf);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(leaf)
            }
            Some(_) => {
                entries.pop(host);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces the leaf for `host`, updating recency. A
    /// replacement is not an eviction; only capacity pressure bumps the
    /// eviction counter.
    pub fn put(&self, host: &str, leaf: Arc<ForgedLeaf>) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some((evicted_host, _)) = entries.push(host.to_string(), leaf) {
            if evicted_host != host {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn metrics(&self) -> CacheMetrics {
        let size = self.entries.lock().expect("lock poisoned").len();
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size,
        }
    }
}
