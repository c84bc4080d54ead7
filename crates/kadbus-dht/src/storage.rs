//! DHT storage for key-value pairs
//!
//! One key may hold one entry per publisher. Within a `(key, publisher)`
//! pair the entry with the highest `version` wins.

use dashmap::DashMap;
use kadbus_protocol::{DhtEntry, NodeId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{DhtError, Result};
use crate::{MAX_DHT_KEYS, MAX_VALUE_SIZE};

/// A stored value with local metadata
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry: DhtEntry,

    /// True when this node published the entry, false for replicas
    pub original: bool,

    /// When this node last accepted a write for the entry
    pub stored_at: Instant,
}

/// Entries under one key, by publisher
type KeySlot = HashMap<NodeId, StoredEntry>;

/// What a store did to the local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
    /// Held entry has a newer version; nothing changed
    Stale,
}

/// DHT storage layer
#[derive(Debug)]
pub struct DhtStorage {
    /// Stored entries by key
    entries: DashMap<String, KeySlot>,

    /// Maximum number of keys
    max_keys: usize,

    /// Maximum value size in bytes
    max_value_size: usize,
}

impl DhtStorage {
    /// Create new DHT storage
    pub fn new() -> Self {
        Self::with_limits(MAX_DHT_KEYS, MAX_VALUE_SIZE)
    }

    /// Create with custom limits
    pub fn with_limits(max_keys: usize, max_value_size: usize) -> Self {
        DhtStorage {
            entries: DashMap::new(),
            max_keys,
            max_value_size,
        }
    }

    /// Get number of stored keys
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store an entry
    ///
    /// `original` marks entries published by this node; once set it sticks
    /// across later replica writes of the same entry.
    pub fn store(&self, entry: DhtEntry, original: bool) -> Result<StoreOutcome> {
        if entry.value.len() > self.max_value_size {
            return Err(DhtError::ValueTooLarge {
                size: entry.value.len(),
                max: self.max_value_size,
            });
        }

        if !self.entries.contains_key(&entry.key) && self.entries.len() >= self.max_keys {
            // Try to make space by removing expired entries
            self.purge_expired();
            if self.entries.len() >= self.max_keys {
                return Err(DhtError::TooManyKeys(self.max_keys));
            }
        }

        let mut slot = self.entries.entry(entry.key.clone()).or_default();
        let outcome = match slot.get(&entry.publisher) {
            Some(held) if held.entry.version > entry.version => return Ok(StoreOutcome::Stale),
            Some(_) => StoreOutcome::Replaced,
            None => StoreOutcome::Inserted,
        };

        let original = original
            || slot
                .get(&entry.publisher)
                .map(|held| held.original)
                .unwrap_or(false);

        slot.insert(
            entry.publisher,
            StoredEntry {
                entry,
                original,
                stored_at: Instant::now(),
            },
        );

        Ok(outcome)
    }

    /// Newest live entry under `key`
    pub fn get(&self, key: &str) -> Option<DhtEntry> {
        self.get_entries(key)
            .into_iter()
            .max_by_key(|entry| entry.version)
    }

    /// Every live entry under `key`, dropping expired ones on the way
    pub fn get_entries(&self, key: &str) -> Vec<DhtEntry> {
        let live = {
            let Some(mut slot) = self.entries.get_mut(key) else {
                return Vec::new();
            };
            slot.retain(|_, stored| !stored.entry.is_expired());
            slot.values()
                .map(|stored| stored.entry.clone())
                .collect::<Vec<_>>()
        };

        if live.is_empty() {
            self.entries.remove_if(key, |_, slot| slot.is_empty());
        }
        live
    }

    /// Whether a live entry from `publisher` is held under `key`
    pub fn contains(&self, key: &str, publisher: &NodeId) -> bool {
        self.entries
            .get(key)
            .and_then(|slot| slot.get(publisher).map(|s| !s.entry.is_expired()))
            .unwrap_or(false)
    }

    /// Remove every entry under a key
    pub fn remove(&self, key: &str) -> Vec<DhtEntry> {
        self.entries
            .remove(key)
            .map(|(_, slot)| slot.into_values().map(|s| s.entry).collect())
            .unwrap_or_default()
    }

    /// Remove one publisher's entry under a key
    pub fn remove_entry(&self, key: &str, publisher: &NodeId) -> Option<DhtEntry> {
        let removed = self
            .entries
            .get_mut(key)
            .and_then(|mut slot| slot.remove(publisher))
            .map(|s| s.entry);
        self.entries.remove_if(key, |_, slot| slot.is_empty());
        removed
    }

    /// Cleanup expired entries, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            let before = slot.len();
            slot.retain(|_, stored| !stored.entry.is_expired());
            removed += before - slot.len();
            !slot.is_empty()
        });
        removed
    }

    /// Live entries this node published itself
    pub fn originated_entries(&self) -> Vec<DhtEntry> {
        self.collect(|stored| stored.original)
    }

    /// Every live entry, original or replica
    pub fn all_entries(&self) -> Vec<DhtEntry> {
        self.collect(|_| true)
    }

    /// Push the expiration of every originated entry `ttl` into the
    /// future and return the refreshed entries
    pub fn refresh_originated(&self, ttl: Duration) -> Vec<DhtEntry> {
        let mut refreshed = Vec::new();
        for mut slot in self.entries.iter_mut() {
            for stored in slot.values_mut() {
                if stored.original && !stored.entry.is_expired() {
                    stored.entry = stored.entry.refreshed(ttl);
                    refreshed.push(stored.entry.clone());
                }
            }
        }
        refreshed
    }

    /// Clear all storage
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn collect(&self, keep: impl Fn(&StoredEntry) -> bool) -> Vec<DhtEntry> {
        self.entries
            .iter()
            .flat_map(|slot| {
                slot.values()
                    .filter(|stored| !stored.entry.is_expired() && keep(stored))
                    .map(|stored| stored.entry.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl Default for DhtStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn entry(key: &str, value: &[u8], publisher: NodeId) -> DhtEntry {
        DhtEntry::new(key, value.to_vec(), publisher, HOUR)
    }

    #[test]
    fn test_new_storage() {
        let storage = DhtStorage::new();
        assert_eq!(storage.key_count(), 0);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_store_and_retrieve() {
        let storage = DhtStorage::new();
        let publisher = NodeId::random();

        let outcome = storage.store(entry("topic", b"value", publisher), true).unwrap();
        assert_eq!(outcome, StoreOutcome::Inserted);
        assert_eq!(storage.key_count(), 1);

        let retrieved = storage.get("topic").unwrap();
        assert_eq!(retrieved.value, b"value".to_vec());
        assert!(storage.contains("topic", &publisher));
    }

    #[test]
    fn test_store_too_large() {
        let storage = DhtStorage::with_limits(10, 4);
        let result = storage.store(entry("k", b"too long", NodeId::random()), false);
        assert!(matches!(result, Err(DhtError::ValueTooLarge { size: 8, max: 4 })));
    }

    #[test]
    fn test_too_many_keys() {
        let storage = DhtStorage::with_limits(2, 1024);
        let publisher = NodeId::random();
        storage.store(entry("a", b"1", publisher), false).unwrap();
        storage.store(entry("b", b"2", publisher), false).unwrap();

        let result = storage.store(entry("c", b"3", publisher), false);
        assert!(matches!(result, Err(DhtError::TooManyKeys(2))));

        // Existing keys can still be written
        assert!(storage.store(entry("a", b"4", publisher), false).is_ok());
    }

    #[test]
    fn test_last_write_wins() {
        let storage = DhtStorage::new();
        let publisher = NodeId::random();

        let mut older = entry("k", b"old", publisher);
        let mut newer = entry("k", b"new", publisher);
        older.version = 10;
        newer.version = 20;

        storage.store(newer.clone(), false).unwrap();
        assert_eq!(storage.store(older, false).unwrap(), StoreOutcome::Stale);
        assert_eq!(storage.get("k").unwrap().value, b"new".to_vec());

        let mut newest = newer;
        newest.version = 30;
        newest.value = b"newest".to_vec();
        assert_eq!(storage.store(newest, false).unwrap(), StoreOutcome::Replaced);
        assert_eq!(storage.get("k").unwrap().value, b"newest".to_vec());
    }

    #[test]
    fn test_publishers_coexist_under_one_key() {
        let storage = DhtStorage::new();
        let (a, b) = (NodeId::random(), NodeId::random());

        storage.store(entry("topic", b"from a", a), false).unwrap();
        storage.store(entry("topic", b"from b", b), false).unwrap();

        assert_eq!(storage.key_count(), 1);
        assert_eq!(storage.get_entries("topic").len(), 2);

        assert!(storage.remove_entry("topic", &a).is_some());
        assert_eq!(storage.get_entries("topic").len(), 1);
        assert!(storage.remove_entry("topic", &b).is_some());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_expired_entry_is_dropped_on_access() {
        let storage = DhtStorage::new();
        let stale = DhtEntry::new("k", b"v".to_vec(), NodeId::random(), Duration::ZERO);
        storage.store(stale, false).unwrap();

        assert!(storage.get("k").is_none());
        assert_eq!(storage.key_count(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let storage = DhtStorage::new();
        let publisher = NodeId::random();
        storage
            .store(DhtEntry::new("gone", b"x".to_vec(), publisher, Duration::ZERO), false)
            .unwrap();
        storage.store(entry("kept", b"y", publisher), false).unwrap();

        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.key_count(), 1);
        assert!(storage.get("kept").is_some());
    }

    #[test]
    fn test_originated_entries() {
        let storage = DhtStorage::new();
        let local = NodeId::random();
        storage.store(entry("mine", b"1", local), true).unwrap();
        storage.store(entry("theirs", b"2", NodeId::random()), false).unwrap();

        let originated = storage.originated_entries();
        assert_eq!(originated.len(), 1);
        assert_eq!(originated[0].key, "mine");
        assert_eq!(storage.all_entries().len(), 2);

        // A replica write does not clear the original flag
        let mut echoed = originated[0].clone();
        echoed.version += 1;
        storage.store(echoed, false).unwrap();
        assert_eq!(storage.originated_entries().len(), 1);
    }

    #[test]
    fn test_refresh_originated_extends_expiration() {
        let storage = DhtStorage::new();
        let local = NodeId::random();
        let short = DhtEntry::new("mine", b"1".to_vec(), local, Duration::from_secs(5));
        storage.store(short.clone(), true).unwrap();

        let refreshed = storage.refresh_originated(HOUR);
        assert_eq!(refreshed.len(), 1);
        assert!(refreshed[0].expires_at > short.expires_at);
        assert_eq!(refreshed[0].version, short.version);
        assert_eq!(storage.get("mine").unwrap().expires_at, refreshed[0].expires_at);
    }
}
