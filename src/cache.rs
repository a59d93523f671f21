// TTL-keyed cache store.
//
// Entries expire lazily: an expired entry is evicted by the read that
// discovers it, never by a background sweeper. The Sync Coordinator and the
// Pagination Manager are the only writers; everything else reads through
// their public operations.

use std::collections::HashMap;
use std::time::Duration;

use log::trace;
use tokio::time::Instant;

struct CacheEntry<T> {
    payload: T,
    inserted_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

pub struct CacheStore<T> {
    entries: HashMap<String, CacheEntry<T>>,
}

impl<T: Clone> CacheStore<T> {
    pub fn new() -> Self {
        CacheStore {
            entries: HashMap::new(),
        }
    }

    /// Fetch a value if it is present and within TTL. An entry past its TTL
    /// is evicted on this read and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<T> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                trace!("cache hit for {}", key);
                Some(entry.payload.clone())
            }
            Some(_) => {
                trace!("cache expired for {}", key);
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh a value. Refreshing restarts the TTL clock.
    pub fn set(&mut self, key: impl Into<String>, payload: T, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                payload,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            trace!("cache invalidated {}", key);
        }
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&mut self, prefix: &str) {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            trace!("cache invalidated {} entries under {}", dropped, prefix);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
