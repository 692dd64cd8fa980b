//! Bounded local cache in front of the distributed store.

use std::{
    num::NonZeroUsize,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use bytes::Bytes;
use lru::LruCache;

/// Default maximum number of cached names.
pub const DEFAULT_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(capacity) => capacity,
    None => panic!("cache capacity must be non zero"),
};

/// Thread-safe name to value cache with least-recently-used eviction.
///
/// Every lookup marks the entry it hit as most recently used, so lookups
/// take the write lock like inserts and removals do. Size queries share the
/// read lock.
///
/// There is no expiration: entries leave the cache only through eviction,
/// [LocalCache::evict] or [LocalCache::clear].
#[derive(Debug)]
pub struct LocalCache {
    entries: RwLock<LruCache<String, Bytes>>,
}

impl LocalCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.read().cap().get()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // === Public Methods ===

    /// Local lookup, never touches the network.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.write().get(name).cloned()
    }

    /// Insert or replace a value, evicting the least recently used entry if
    /// the cache is full.
    pub fn set(&self, name: impl Into<String>, value: Bytes) {
        self.write().put(name.into(), value);
    }

    /// Remove a name, returning its value if it was cached.
    pub fn evict(&self, name: &str) -> Option<Bytes> {
        self.write().pop(name)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    // === Private Methods ===

    fn read(&self) -> RwLockReadGuard<'_, LruCache<String, Bytes>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LruCache<String, Bytes>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use super::*;

    fn cache(capacity: usize) -> LocalCache {
        LocalCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn set_get_evict() {
        let cache = cache(10);

        cache.set("alice.fn", Bytes::from_static(b"10.0.0.5"));

        assert_eq!(cache.get("alice.fn"), Some(Bytes::from_static(b"10.0.0.5")));
        assert_eq!(cache.get("bob.fn"), None);

        assert_eq!(cache.evict("alice.fn"), Some(Bytes::from_static(b"10.0.0.5")));
        assert_eq!(cache.get("alice.fn"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = cache(10);

        cache.set("alice.fn", Bytes::from_static(b"10.0.0.5"));
        cache.set("alice.fn", Bytes::from_static(b"10.0.0.6"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("alice.fn"), Some(Bytes::from_static(b"10.0.0.6")));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = cache(3);

        cache.set("a", Bytes::from_static(b"1"));
        cache.set("b", Bytes::from_static(b"2"));
        cache.set("c", Bytes::from_static(b"3"));

        // "a" is the oldest insertion but the most recent access.
        assert!(cache.get("a").is_some());

        cache.set("d", Bytes::from_static(b"4"));

        assert_eq!(cache.len(), 3);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn contended_lookups_count_as_access() {
        let cache = Arc::new(cache(3));

        cache.set("a", Bytes::from_static(b"1"));
        cache.set("b", Bytes::from_static(b"2"));
        cache.set("c", Bytes::from_static(b"3"));

        let guard = cache.read();
        let reader = {
            let cache = cache.clone();
            thread::spawn(move || cache.get("a"))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);

        assert_eq!(reader.join().unwrap(), Some(Bytes::from_static(b"1")));

        cache.set("d", Bytes::from_static(b"4"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn len_never_exceeds_capacity() {
        let cache = cache(5);

        for i in 0..50 {
            cache.set(format!("name-{i}.fn"), Bytes::from(i.to_string()));
            assert!(cache.len() <= 5);
        }

        assert_eq!(cache.len(), cache.capacity());
    }

    #[test]
    fn clear() {
        let cache = cache(5);

        cache.set("a", Bytes::from_static(b"1"));
        cache.set("b", Bytes::from_static(b"2"));
        cache.clear();

        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(cache(64));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();

                thread::spawn(move || {
                    for i in 0..500 {
                        let name = format!("name-{}.fn", (i + t) % 100);

                        if i % 3 == 0 {
                            cache.set(name, Bytes::from(i.to_string()));
                        } else {
                            let _ = cache.get(&name);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 64);
    }
}
