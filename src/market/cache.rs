//! Per-key time-boxed cache. Read-mostly: readers take a shared lock, a miss
//! or expiry is refreshed by the caller and written back.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use crate::plan::Timestamp;

#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl_ms: u64,
    entries: RwLock<HashMap<K, (V, Timestamp)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Fresh value for `key`, if any. An entry stored at `t` is fresh while
    /// `now < t + ttl`.
    pub fn get(&self, key: &K, now: Timestamp) -> Option<V> {
        let guard = self.entries.read().ok()?;
        let (value, stored_at) = guard.get(key)?;
        if now < stored_at.saturating_add(self.ttl_ms) {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: K, value: V, now: Timestamp) {
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(key, (value, now));
        }
    }

    pub fn invalidate(&self, key: &K) {
        if let Ok(mut guard) = self.entries.write() {
            guard.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
