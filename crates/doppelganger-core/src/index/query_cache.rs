//! Small insertion-order cache for query embeddings.
//!
//! Eviction is strict FIFO: a hit does not refresh an entry's position, so
//! a popular query still ages out and gets re-embedded with the current
//! model eventually.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub struct QueryEmbeddingCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    map: HashMap<String, Arc<Vec<f32>>>,
    order: VecDeque<String>,
}

impl QueryEmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let inner = self.inner.lock().ok()?;
        inner.map.get(key).cloned()
    }

    pub fn insert(&self, key: String, vector: Arc<Vec<f32>>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.map.contains_key(&key) {
            inner.map.insert(key, vector);
            return;
        }
        while inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
        inner.order.push_back(key.clone());
        inner.map.insert(key, vector);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32) -> Arc<Vec<f32>> {
        Arc::new(vec![x])
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = QueryEmbeddingCache::new(2);
        cache.insert("a".into(), v(1.0));
        cache.insert("b".into(), v(2.0));
        cache.insert("c".into(), v(3.0));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn hit_does_not_refresh_position() {
        let cache = QueryEmbeddingCache::new(2);
        cache.insert("a".into(), v(1.0));
        cache.insert("b".into(), v(2.0));
        // Touch "a", then insert; "a" must still be the eviction victim.
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), v(3.0));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn reinsert_updates_value_without_duplicating_order() {
        let cache = QueryEmbeddingCache::new(2);
        cache.insert("a".into(), v(1.0));
        cache.insert("a".into(), v(9.0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap()[0], 9.0);
    }
}
