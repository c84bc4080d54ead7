//! Concurrent cache with per-entry expiration
//!
//! Keys are structured so that entries written by different features never
//! collide, whatever their node ids or keys look like.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Namespaced cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub node: String,
    pub key: String,
    pub correlation: Option<String>,
}

impl CacheKey {
    pub fn new(namespace: &'static str, node: impl Into<String>, key: impl Into<String>) -> Self {
        CacheKey {
            namespace,
            node: node.into(),
            key: key.into(),
            correlation: None,
        }
    }

    pub fn with_correlation(mut self, correlation: impl Into<String>) -> Self {
        self.correlation = Some(correlation.into());
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Shared map whose entries disappear after their time to live
#[derive(Debug)]
pub struct ExpiringCache<V> {
    entries: DashMap<CacheKey, CacheEntry<V>>,
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        ExpiringCache {
            entries: DashMap::new(),
        }
    }
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; the previous live value is returned
    pub fn insert(&self, key: CacheKey, value: V, ttl: Duration) -> Option<V> {
        let now = Instant::now();
        self.entries
            .insert(
                key,
                CacheEntry {
                    value,
                    expires_at: now + ttl,
                },
            )
            .filter(|old| old.expires_at > now)
            .map(|old| old.value)
    }

    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(_, entry)| entry.value)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Entries currently held, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_do_not_collide() {
        let cache = ExpiringCache::new();
        let ttl = Duration::from_secs(60);

        cache.insert(CacheKey::new("request", "n1", "orders"), 1, ttl);
        cache.insert(CacheKey::new("callback", "n1", "orders"), 2, ttl);
        cache.insert(
            CacheKey::new("request", "n1", "orders").with_correlation("c-1"),
            3,
            ttl,
        );

        assert_eq!(cache.get(&CacheKey::new("request", "n1", "orders")), Some(1));
        assert_eq!(cache.get(&CacheKey::new("callback", "n1", "orders")), Some(2));
        assert_eq!(
            cache.get(&CacheKey::new("request", "n1", "orders").with_correlation("c-1")),
            Some(3)
        );
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ExpiringCache::new();
        let short = CacheKey::new("request", "n1", "a");
        let long = CacheKey::new("request", "n1", "b");

        cache.insert(short.clone(), "x".to_string(), Duration::from_secs(1));
        cache.insert(long.clone(), "y".to_string(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.get(&short), None);
        assert_eq!(cache.get(&long), Some("y".to_string()));
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_returns_live_value() {
        let cache = ExpiringCache::new();
        let key = CacheKey::new("waiter", "n1", "k");

        assert_eq!(cache.insert(key.clone(), 5u32, Duration::from_secs(5)), None);
        assert_eq!(cache.insert(key.clone(), 6u32, Duration::from_secs(5)), Some(5));
        assert_eq!(cache.remove(&key), Some(6));
        assert!(!cache.contains(&key));
    }
}
