//! Invalidating read cache — a key→value memo in front of repository reads.
//!
//! Each repository owns one cache and is the only code allowed to mutate it.
//! Policy: invalidate after the store acknowledges a write, never before. A
//! racing reader may see momentarily stale data; the next read after the
//! invalidation re-populates from the store, so nothing stays stale.

use std::collections::HashMap;
use std::sync::Mutex;

struct CacheState<V> {
    entries: HashMap<String, V>,
    /// Whether `entries` holds the full collection. Lets a cached empty
    /// collection be told apart from a cache that was never populated.
    primed: bool,
}

/// Per-repository invalidating cache.
pub struct RepoCache<V> {
    inner: Mutex<CacheState<V>>,
}

impl<V: Clone> RepoCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                primed: false,
            }),
        }
    }

    /// Look up one entry. `None` is a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get(key).cloned()
    }

    /// The full cached collection, if a `prime` happened since the last
    /// invalidation.
    pub fn get_all(&self) -> Option<HashMap<String, V>> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.primed.then(|| state.entries.clone())
    }

    /// Store one entry.
    pub fn set(&self, key: &str, value: V) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(key.to_string(), value);
    }

    /// Replace the cache with the full collection.
    pub fn prime(&self, entries: HashMap<String, V>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries = entries;
        state.primed = true;
    }

    /// Remove one entry (targeted invalidation for single-key reads).
    pub fn delete(&self, key: &str) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.remove(key);
    }

    /// Drop everything. Called after every acknowledged repository write.
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.clear();
        state.primed = false;
    }
}

impl<V: Clone> Default for RepoCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
