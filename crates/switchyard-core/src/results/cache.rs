//! Bounded, insertion-ordered result store.
//!
//! Eviction is strict FIFO: reading an entry never extends its lifetime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use super::record::ResourceRecord;

/// Default number of retained results.
pub const DEFAULT_CAPACITY: usize = 256;

struct Inner {
    order: VecDeque<String>,
    entries: HashMap<String, Arc<ResourceRecord>>,
}

/// Process-wide store of full tool results, shared behind an `Arc`.
pub struct ResultCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ResultCache {
    /// Create a cache holding at most `capacity` results (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                order: VecDeque::with_capacity(capacity),
                entries: HashMap::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a result and return its id, evicting the oldest entry when full.
    pub fn register(&self, record: ResourceRecord) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                    tracing::debug!("[ResultCache] Evicted {}", oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(id.clone());
        inner.entries.insert(id.clone(), Arc::new(record));
        id
    }

    /// Look up a result. `None` means evicted or never registered.
    pub fn get(&self, id: &str) -> Option<Arc<ResourceRecord>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(id).cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.order.clear();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> ResourceRecord {
        ResourceRecord::text(text)
    }

    #[test]
    fn test_overflow_evicts_first_registered() {
        let cache = ResultCache::new(3);
        let ids: Vec<String> = (0..4).map(|i| cache.register(record(&i.to_string()))).collect();

        assert!(cache.get(&ids[0]).is_none());
        for id in &ids[1..] {
            assert!(cache.get(id).is_some());
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_reads_do_not_extend_lifetime() {
        let cache = ResultCache::new(2);
        let first = cache.register(record("first"));
        let second = cache.register(record("second"));
        // Touch the oldest entry; FIFO must still evict it next.
        assert_eq!(cache.get(&first).unwrap().model_text, "first");
        let third = cache.register(record("third"));

        assert!(cache.get(&first).is_none());
        assert!(cache.get(&second).is_some());
        assert!(cache.get(&third).is_some());
    }

    #[test]
    fn test_clear_and_unknown_ids() {
        let cache = ResultCache::new(4);
        let id = cache.register(record("x"));
        assert!(cache.get("missing").is_none());
        cache.clear();
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = ResultCache::new(0);
        assert_eq!(cache.capacity(), 1);
        let a = cache.register(record("a"));
        let b = cache.register(record("b"));
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
    }

    #[test]
    fn test_concurrent_registration_respects_capacity() {
        let cache = Arc::new(ResultCache::new(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.register(record(&format!("{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 16);
    }
}
