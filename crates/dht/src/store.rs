//! TTL-bounded announcement storage

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use anonet_core::types::MAX_STORE_ENTRIES;

use crate::{DhtError, NodeId};

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct StoreEntry {
    value: Vec<u8>,
    stored_at: Instant,
}

/// Key-value store for announcement bytes with lazy TTL eviction.
///
/// Entries expire after one hour. At capacity, an insert first sweeps
/// expired entries; if every entry is still live the insert is refused.
pub struct AnnouncementStore {
    entries: Mutex<HashMap<NodeId, StoreEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl AnnouncementStore {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_TTL, MAX_STORE_ENTRIES)
    }

    pub fn with_params(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Insert or refresh a value. Re-announcing the same key never creates
    /// a duplicate entry.
    pub fn insert(&self, key: NodeId, value: Vec<u8>) -> Result<(), DhtError> {
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
            if entries.len() >= self.capacity {
                return Err(DhtError::StoreFull);
            }
        }

        entries.insert(
            key,
            StoreEntry {
                value,
                stored_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Fetch a value; expired entries are deleted on access.
    pub fn get(&self, key: &NodeId) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains(&self, key: &NodeId) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &NodeId) -> Option<Vec<u8>> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AnnouncementStore {
    fn default() -> Self {
        Self::new()
    }
}
