//! Bounded insertion-ordered cache for duplicate suppression
//!
//! Used by the host to filter repeated advertising reports and by the
//! persistence store to bound the number of unbonded GATT caches kept on
//! disk.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    value: V,
    prev: Option<K>,
    next: Option<K>,
}

/// A fixed-capacity map that remembers insertion order.
///
/// When full, inserting a new key evicts the oldest entry and reports it
/// through the eviction callback. All operations are O(1); order is kept in
/// a doubly-linked list threaded through the map nodes.
pub struct DuplicateCache<K, V> {
    capacity: usize,
    map: HashMap<K, Node<K, V>>,
    head: Option<K>,
    tail: Option<K>,
    on_evict: Option<Box<dyn FnMut(&K, &V) + Send>>,
}

impl<K: Hash + Eq + Clone, V> DuplicateCache<K, V> {
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "DuplicateCache capacity must be nonzero");
        Self {
            capacity,
            map: HashMap::new(),
            head: None,
            tail: None,
            on_evict: None,
        }
    }

    /// Installs the eviction callback, invoked with the evicted entry each
    /// time an insert pushes out the oldest one.
    pub fn set_eviction_callback(&mut self, cb: impl FnMut(&K, &V) + Send + 'static) {
        self.on_evict = Some(Box::new(cb));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts `value` under `key`, replacing and reordering any previous
    /// entry for the same key. Returns true iff the key was not present.
    pub fn add(&mut self, key: K, value: V) -> bool {
        let existed = self.detach(&key).is_some();
        if !existed && self.map.len() == self.capacity {
            if let Some(oldest) = self.head.clone() {
                if let Some(node) = self.detach(&oldest) {
                    if let Some(cb) = self.on_evict.as_mut() {
                        cb(&oldest, &node.value);
                    }
                }
            }
        }
        self.attach(key, value);
        !existed
    }

    /// True if the key is present.
    pub fn is_duplicate(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|node| &node.value)
    }

    /// Removes the entry for `key`, returning its value. Does not fire the
    /// eviction callback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.detach(key).map(|node| node.value)
    }

    /// Keys in insertion order, oldest first.
    pub fn keys_ordered(&self) -> Vec<K> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut cursor = self.head.clone();
        while let Some(key) = cursor {
            cursor = self.map.get(&key).and_then(|n| n.next.clone());
            out.push(key);
        }
        out
    }

    fn attach(&mut self, key: K, value: V) {
        let node = Node {
            value,
            prev: self.tail.clone(),
            next: None,
        };
        if let Some(tail) = self.tail.clone() {
            if let Some(tail_node) = self.map.get_mut(&tail) {
                tail_node.next = Some(key.clone());
            }
        } else {
            self.head = Some(key.clone());
        }
        self.tail = Some(key.clone());
        self.map.insert(key, node);
    }

    fn detach(&mut self, key: &K) -> Option<Node<K, V>> {
        let node = self.map.remove(key)?;
        match node.prev.clone() {
            Some(prev) => {
                if let Some(prev_node) = self.map.get_mut(&prev) {
                    prev_node.next = node.next.clone();
                }
            }
            None => self.head = node.next.clone(),
        }
        match node.next.clone() {
            Some(next) => {
                if let Some(next_node) = self.map.get_mut(&next) {
                    next_node.prev = node.prev.clone();
                }
            }
            None => self.tail = node.prev.clone(),
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn add_reports_new_keys() {
        let mut cache = DuplicateCache::new(4);
        assert!(cache.add("a", 1));
        assert!(cache.add("b", 2));
        assert!(!cache.add("a", 3));
        assert_eq!(cache.get(&"a"), Some(&3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_is_oldest_first() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();

        let mut cache = DuplicateCache::new(3);
        cache.set_eviction_callback(move |k: &&str, _v| log.lock().unwrap().push(*k));

        cache.add("a", 1);
        cache.add("b", 2);
        cache.add("c", 3);
        assert!(evicted.lock().unwrap().is_empty());

        cache.add("d", 4);
        assert_eq!(*evicted.lock().unwrap(), vec!["a"]);
        assert!(!cache.is_duplicate(&"a"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn reinsert_refreshes_order() {
        let mut cache = DuplicateCache::new(2);
        cache.add("a", 1);
        cache.add("b", 2);
        // Touching "a" moves it to the young end, so "b" is now oldest.
        cache.add("a", 1);
        cache.add("c", 3);
        assert!(cache.is_duplicate(&"a"));
        assert!(!cache.is_duplicate(&"b"));
        assert_eq!(cache.keys_ordered(), vec!["a", "c"]);
    }

    #[test]
    fn remove_does_not_fire_eviction() {
        let evicted = Arc::new(Mutex::new(0usize));
        let count = evicted.clone();

        let mut cache = DuplicateCache::new(2);
        cache.set_eviction_callback(move |_k: &u8, _v: &u8| *count.lock().unwrap() += 1);
        cache.add(1, 10);
        assert_eq!(cache.remove(&1), Some(10));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(*evicted.lock().unwrap(), 0);
    }

    #[test]
    fn capacity_one_churn() {
        let mut cache = DuplicateCache::new(1);
        for i in 0..10u32 {
            cache.add(i, i);
            assert_eq!(cache.len(), 1);
            assert!(cache.is_duplicate(&i));
        }
    }
}
