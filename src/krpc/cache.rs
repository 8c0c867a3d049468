use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::Instant;

struct Entry<V> {
    value: V,
    last_access: Instant,
}

/// Map whose entries remember when they were last touched.
///
/// Lookups refresh the access time; [`expire`](Self::expire) drops everything
/// not touched since a cutoff.
pub struct ExpiringCache<K, V> {
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V> ExpiringCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get_or_insert_with(&mut self, key: K, now: Instant, make: impl FnOnce() -> V) -> &V {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            value: make(),
            last_access: now,
        });
        entry.last_access = now;
        &entry.value
    }

    /// Removes entries last accessed strictly before `cutoff`; returns how
    /// many were dropped.
    pub fn expire(&mut self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_access >= cutoff);
        before - self.entries.len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<K: Eq + Hash, V> Default for ExpiringCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
