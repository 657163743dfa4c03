//! Expiring, capacity-bounded key/value cache.
//!
//! Entries live in an insertion-ordered map: the front is the least recently
//! used entry and is evicted first when a new key arrives at capacity. A hit
//! moves the entry to the back. Expired entries are dropped lazily on access
//! and eagerly by [`TtlCache::purge_expired`], which the background sweep
//! subscription calls on a fixed interval.
//!
//! Time comes from `tokio::time::Instant` so tests can pause and advance the clock.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::Instant;

/// Prefixes of derived reads (usage stats, model catalogs) that depend on every
/// provider list and are dropped after any successful mutation.
pub const DERIVED_PREFIXES: &[&str] = &["usage:", "models:"];

/// Cache key scoped to one remote list, e.g. `claude-api-key:stats`.
pub fn scoped_key(endpoint: &str, name: &str) -> String {
    format!("{endpoint}:{name}")
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: Mutex<IndexMap<K, CacheEntry<V>>>,
    capacity: usize,
    default_ttl: Duration,
}

/// The cache shared by the coordinator and derived-read consumers.
pub type ProviderCache = TtlCache<String, serde_json::Value>;

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return a live value and mark it most recently used.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.lock();
        let index = entries.get_index_of(key)?;

        if entries[index].expires_at <= now {
            entries.shift_remove_index(index);
            return None;
        }

        let last = entries.len() - 1;
        entries.move_index(index, last);
        Some(entries[last].value.clone())
    }

    /// Insert or replace `key`. A new key at capacity evicts the least recently used entry.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.lock();

        if let Some(index) = entries.get_index_of(&key) {
            let last = entries.len() - 1;
            entries.move_index(index, last);
            entries[last] = CacheEntry { value, expires_at };
            return;
        }

        if entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(key, CacheEntry { value, expires_at });
    }

    /// `set` with the cache's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().shift_remove(key).is_some()
    }

    /// Drop every entry whose key satisfies `predicate`. Returns how many were dropped.
    pub fn invalidate_pattern<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !predicate(k));
        before - entries.len()
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    /// Remove expired entries regardless of access. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TtlCache<String, serde_json::Value> {
    /// Invalidate everything derived from one remote list.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> usize {
        let prefix = scoped_key(endpoint, "");
        self.invalidate_pattern(|key| {
            key.starts_with(&prefix) || DERIVED_PREFIXES.iter().any(|p| key.starts_with(p))
        })
    }
}
