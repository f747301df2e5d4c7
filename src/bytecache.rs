//! Generic byte-addressed cache (C1). Deliberately TTL-agnostic: callers
//! that need expiry encode it themselves into the first bytes of the
//! stored value (see `hashprefix.rs`, `session.rs`) and check it on read.
//! This mirrors `heimdall::cache::DnsCache`'s DashMap-plus-insertion-order
//! LRU shape, generalized from `CacheEntry` down to raw bytes.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ByteCache {
    map: DashMap<Vec<u8>, Vec<u8>>,
    order: Mutex<VecDeque<Vec<u8>>>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ByteCache {
    /// `max_size` of `0` means unbounded (no eviction).
    pub fn new(max_size: usize) -> Self {
        Self {
            map: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.map.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.touch(key);
                Some(v.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        let is_new = !self.map.contains_key(&key);
        if is_new && self.max_size > 0 && self.map.len() >= self.max_size {
            self.evict_one();
        }
        self.map.insert(key.clone(), value);
        self.touch(&key);
    }

    pub fn del(&self, key: &[u8]) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.order.lock().retain(|k| k.as_slice() != key);
        }
        removed
    }

    pub fn clear(&self) {
        self.map.clear();
        self.order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            count: self.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn touch(&self, key: &[u8]) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| k.as_slice() == key) {
            order.remove(pos);
        }
        order.push_back(key.to_vec());
    }

    fn evict_one(&self) {
        let victim = self.order.lock().pop_front();
        if let Some(key) = victim {
            self.map.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let cache = ByteCache::new(0);
        cache.set(b"k".to_vec(), b"v".to_vec());
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_increments_miss_counter() {
        let cache = ByteCache::new(0);
        assert_eq!(cache.get(b"absent"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn eviction_drops_oldest_when_full() {
        let cache = ByteCache::new(2);
        cache.set(b"a".to_vec(), b"1".to_vec());
        cache.set(b"b".to_vec(), b"2".to_vec());
        cache.set(b"c".to_vec(), b"3".to_vec());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn touching_an_entry_protects_it_from_eviction() {
        let cache = ByteCache::new(2);
        cache.set(b"a".to_vec(), b"1".to_vec());
        cache.set(b"b".to_vec(), b"2".to_vec());
        // Re-reading "a" makes "b" the least-recently-used entry.
        cache.get(b"a");
        cache.set(b"c".to_vec(), b"3".to_vec());
        assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
        assert!(cache.get(b"b").is_none());
    }

    #[test]
    fn del_removes_entry() {
        let cache = ByteCache::new(0);
        cache.set(b"k".to_vec(), b"v".to_vec());
        assert!(cache.del(b"k"));
        assert_eq!(cache.get(b"k"), None);
    }
}
