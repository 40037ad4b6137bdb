use super::CacheDriver;
use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
struct Entry {
    value: Arc<str>,
    ttl: Option<Duration>,
    block: Option<u64>,
}

/// Expires each entry after its own TTL.
struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _now: Instant) -> Option<Duration> {
        entry.ttl
    }
}

/// Bounded in-process cache driver.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Cache<String, Entry>,
}

impl MemoryCache {
    /// Creates a cache holding at most `max_entries` entries.
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryExpiry)
                .build(),
        }
    }
}

#[async_trait]
impl CacheDriver for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).await.map(|entry| entry.value.to_string())
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>, block: Option<u64>) {
        self.entries.insert(key.to_string(), Entry { value: value.into(), ttl, block }).await;
    }

    async fn flush_above(&self, block: u64) -> u64 {
        let stale: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.block.is_some_and(|b| b > block))
            .map(|(key, _)| key)
            .collect();
        for key in &stale {
            self.entries.invalidate(key.as_str()).await;
        }
        stale.len() as u64
    }
}
