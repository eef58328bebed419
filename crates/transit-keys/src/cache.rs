//! In-memory cache of loaded policies.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::lock_manager::PolicyCell;

enum Store {
    Unbounded(HashMap<String, Arc<PolicyCell>>),
    Lru(LruCache<String, Arc<PolicyCell>>),
}

/// Map from cache key to shared policy cell.
///
/// A size of 0 means unbounded; otherwise least-recently-used entries are
/// evicted once `size` is reached. The map mutex is never held across an
/// `.await`.
pub struct PolicyCache {
    store: Mutex<Store>,
    size: usize,
}

impl PolicyCache {
    /// Create a cache holding at most `size` policies, or unbounded for 0.
    pub fn new(size: usize) -> Self {
        let store = match NonZeroUsize::new(size) {
            Some(bound) => Store::Lru(LruCache::new(bound)),
            None => Store::Unbounded(HashMap::new()),
        };
        Self {
            store: Mutex::new(store),
            size,
        }
    }

    /// Configured bound, 0 for unbounded.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Look up a cell, marking it recently used.
    pub fn get(&self, key: &str) -> Option<Arc<PolicyCell>> {
        match &mut *self.store.lock() {
            Store::Unbounded(map) => map.get(key).cloned(),
            Store::Lru(lru) => lru.get(key).cloned(),
        }
    }

    /// Insert or replace a cell.
    pub fn insert(&self, key: String, cell: Arc<PolicyCell>) {
        match &mut *self.store.lock() {
            Store::Unbounded(map) => {
                map.insert(key, cell);
            }
            Store::Lru(lru) => {
                lru.put(key, cell);
            }
        }
    }

    /// Drop a cell. Holders of the `Arc` keep using it safely.
    pub fn remove(&self, key: &str) {
        match &mut *self.store.lock() {
            Store::Unbounded(map) => {
                map.remove(key);
            }
            Store::Lru(lru) => {
                lru.pop(key);
            }
        }
    }

    /// Number of cached policies.
    pub fn len(&self) -> usize {
        match &*self.store.lock() {
            Store::Unbounded(map) => map.len(),
            Store::Lru(lru) => lru.len(),
        }
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_type::KeyKind;
    use crate::policy::Policy;

    fn cell(name: &str) -> Arc<PolicyCell> {
        PolicyCell::new(Policy::new(name, KeyKind::Hmac))
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let cache = PolicyCache::new(0);
        for i in 0..100 {
            cache.insert(format!("k{i}"), cell("k"));
        }
        assert_eq!(cache.len(), 100);
        cache.remove("k5");
        assert!(cache.get("k5").is_none());
        assert!(cache.get("k6").is_some());
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let cache = PolicyCache::new(2);
        cache.insert("a".into(), cell("a"));
        cache.insert("b".into(), cell("b"));
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), cell("c"));

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.size(), 2);
    }
}
