//! In-memory TTL cache for fetched records.
//!
//! Entries past their TTL are no longer served as fresh hits but are
//! retained, so the fetch layer can fall back to them when a source is
//! down. Old entries are dropped with `evict_older_than`.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

/// Keyed cache with a single TTL. Safe to share across tasks.
pub struct TtlCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Value for `key` if it was written less than one TTL ago.
    pub async fn get_fresh(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    /// Value for `key` regardless of age (stale fallback).
    pub async fn get_any(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: impl Into<String>, value: T) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop entries written more than `max_age` ago. Returns the count removed.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < max_age);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
