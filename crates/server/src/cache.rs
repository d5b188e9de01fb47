// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Fast, TTL-bounded key/value cache for tag-resolved blocks

use crate::error::CacheError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

/// Key/value store with per-entry time-to-live
///
/// Entries may disappear at any moment before their TTL; they never outlive it.
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Returns the live value for `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores `value` under `key`, replacing any previous value, for `ttl`
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;
}

/// Reads and decodes a typed value
pub async fn get_typed<T: DeserializeOwned>(
    cache: &dyn FastCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encodes and stores a typed value
pub async fn set_typed<T: Serialize + Sync>(
    cache: &dyn FastCache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    cache.set(key, serde_json::to_value(value)?, ttl).await
}

/// A cached value with its expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub data: Value,
    /// Instant after which the entry is dead
    pub expires_at: Instant,
    /// Insertion sequence, used for eviction order
    seq: u64,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`FastCache`] with capacity-bounded eviction
///
/// Expired entries are dropped lazily on read and eagerly when the cache is
/// full. Past that, the oldest 10% of entries are evicted to make room.
pub struct MemoryCache {
    cache: RwLock<HashMap<String, CacheEntry>>,
    max_items: usize,
    next_seq: AtomicU64,
}

impl MemoryCache {
    /// Creates an empty cache holding at most `max_items` entries
    pub fn new(max_items: usize) -> Self {
        Self { cache: RwLock::new(HashMap::new()), max_items: max_items.max(1), next_seq: AtomicU64::new(0) }
    }

    /// Number of stored entries, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    /// Drops every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        Self::purge(&mut cache, Instant::now())
    }

    /// Utilization summary for the stats endpoint
    pub async fn detailed_stats(&self) -> Value {
        let cache = self.cache.read().await;
        let now = Instant::now();
        let live = cache.values().filter(|entry| entry.is_live(now)).count();

        serde_json::json!({
            "total_entries": cache.len(),
            "live_entries": live,
            "max_entries": self.max_items,
            "utilization": format!("{:.1}%", (cache.len() as f64 / self.max_items as f64) * 100.0),
        })
    }

    fn purge(cache: &mut HashMap<String, CacheEntry>, now: Instant) -> usize {
        let before = cache.len();
        cache.retain(|_, entry| entry.is_live(now));
        before - cache.len()
    }

    fn evict_oldest(cache: &mut HashMap<String, CacheEntry>) {
        let to_remove = (cache.len() / 10).max(1);

        let mut entries: Vec<(String, u64)> =
            cache.iter().map(|(key, entry)| (key.clone(), entry.seq)).collect();
        entries.sort_by_key(|(_, seq)| *seq);

        for (key, _) in entries.into_iter().take(to_remove) {
            cache.remove(&key);
        }

        debug!("Evicted {} oldest cache entries", to_remove);
    }
}

#[async_trait]
impl FastCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            match cache.get(key) {
                Some(entry) if entry.is_live(now) => {
                    debug!("Cache hit: {}", key);
                    return Ok(Some(entry.data.clone()));
                }
                None => {
                    debug!("Cache miss: {}", key);
                    return Ok(None);
                }
                Some(_) => {}
            }
        }

        // Expired; re-check under the write lock since a writer may have refreshed it
        let mut cache = self.cache.write().await;
        if cache.get(key).is_some_and(|entry| !entry.is_live(now)) {
            cache.remove(key);
            debug!("Cache entry expired: {}", key);
        }
        Ok(cache.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.data.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut cache = self.cache.write().await;

        if !cache.contains_key(key) && cache.len() >= self.max_items {
            Self::purge(&mut cache, now);
            if cache.len() >= self.max_items {
                Self::evict_oldest(&mut cache);
            }
        }

        let entry = CacheEntry {
            data: value,
            expires_at: now + ttl,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        cache.insert(key.to_string(), entry);
        debug!("Cached entry: {} (ttl {:?})", key, ttl);
        Ok(())
    }
}
