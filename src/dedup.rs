//! In-process TTL cache fronting the store for existence checks.
//!
//! Advisory only: a miss (or stale entry) always falls through to the store,
//! which remains the source of truth. Bounded LRU so a long scraping run
//! cannot grow it without limit.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    exists: bool,
    cached_at: Instant,
}

/// Maps `url_hash -> exists` with TTL and an LRU bound.
pub struct DedupCache {
    entries: Mutex<IndexMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::with_capacity(capacity.min(1024))),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached answer for a hash, or `None` on miss/stale.
    pub fn check(&self, hash: &str) -> Option<bool> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Pop and reinsert so a fresh hit moves to the back of the LRU order.
        if let Some(entry) = entries.shift_remove(hash) {
            if entry.cached_at.elapsed() < self.ttl {
                entries.insert(hash.to_string(), entry);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.exists);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, hash: &str, exists: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Self::insert_locked(&mut entries, self.capacity, hash, exists);
    }

    /// Record a batch of lookups, e.g. after a `batch_exists` round-trip.
    pub fn set_many<'a>(&self, results: impl IntoIterator<Item = (&'a str, bool)>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (hash, exists) in results {
            Self::insert_locked(&mut entries, self.capacity, hash, exists);
        }
    }

    fn insert_locked(
        entries: &mut IndexMap<String, CacheEntry>,
        capacity: usize,
        hash: &str,
        exists: bool,
    ) {
        entries.shift_remove(hash);
        entries.insert(
            hash.to_string(),
            CacheEntry {
                exists,
                cached_at: Instant::now(),
            },
        );
        while entries.len() > capacity {
            entries.shift_remove_index(0);
        }
    }

    /// (hits, misses) since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn log_counters(&self) {
        let (hits, misses) = self.counters();
        debug!(hits, misses, "dedup cache counters");
    }
}
