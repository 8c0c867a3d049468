use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::node::NodeId;

struct StoredValue {
    value: Bytes,
    stored_at: Instant,
}

/// Values this node holds on behalf of the network.
///
/// A key maps to a set of distinct values; storing an existing value again
/// only refreshes its timestamp.
pub struct ValueStore {
    entries: Mutex<HashMap<NodeId, Vec<StoredValue>>>,
    max_values_per_key: usize,
}

impl ValueStore {
    pub fn new(max_values_per_key: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_values_per_key,
        }
    }

    pub fn put(&self, key: NodeId, value: Bytes) {
        self.put_at(key, value, Instant::now());
    }

    pub fn put_at(&self, key: NodeId, value: Bytes, now: Instant) {
        let mut entries = self.entries.lock();
        let values = entries.entry(key).or_default();

        if let Some(existing) = values.iter_mut().find(|v| v.value == value) {
            existing.stored_at = now;
            return;
        }
        if values.len() >= self.max_values_per_key {
            values.sort_by_key(|v| v.stored_at);
            values.remove(0);
        }
        values.push(StoredValue {
            value,
            stored_at: now,
        });
    }

    pub fn get(&self, key: &NodeId) -> Vec<Bytes> {
        self.entries
            .lock()
            .get(key)
            .map(|values| values.iter().map(|v| v.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Drops every value stored before `cutoff`; returns how many went.
    pub fn expire(&self, cutoff: Instant) -> usize {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        entries.retain(|_, values| {
            let before = values.len();
            values.retain(|v| v.stored_at >= cutoff);
            removed += before - values.len();
            !values.is_empty()
        });
        removed
    }

    pub fn key_count(&self) -> usize {
        self.entries.lock().len()
    }
}
