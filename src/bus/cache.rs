//! Shared key-value cache for dedupe guards and handshake markers

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::BusError;

/// Handshake completion marker
pub fn done_key(correlation_id: &str) -> String {
    format!("bus:done:{}", correlation_id)
}

/// Idempotent-consumer guard
pub fn dedupe_key(raw: &str) -> String {
    format!("bus:dedupe:{}", raw)
}

/// Key-value store with per-key TTL
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Set only if absent (or expired). Returns true when this call set it.
    async fn set_nx(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, BusError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), BusError>;

    async fn get(&self, key: &str) -> Result<Option<Value>, BusError>;

    /// Returns true when a live key was removed
    async fn del(&self, key: &str) -> Result<bool, BusError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now.checked_add(ttl).unwrap_or(now + Duration::from_secs(365 * 24 * 3600)),
        }
    }

    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process [`KvCache`]. Expired keys are dropped on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired key, returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweep on a fixed interval until cancelled
    pub async fn run_sweep(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let dropped = self.sweep();
                    if dropped > 0 {
                        debug!(dropped, live = self.entries.len(), "Swept expired cache keys");
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn set_nx(&self, key: &str, value: Value, ttl: Duration) -> Result<bool, BusError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), BusError> {
        self.entries
            .insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, BusError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .map(|e| e.is_live(now).then(|| e.value.clone()));
        match hit {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, BusError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.is_live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_key_formats() {
        assert_eq!(done_key("c-1"), "bus:done:c-1");
        assert_eq!(dedupe_key("payment:o-9"), "bus:dedupe:payment:o-9");
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert!(cache.set_nx("k", json!(1), ttl).await.unwrap());
        assert!(!cache.set_nx("k", json!(2), ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_expired_key_is_gone_and_settable() {
        let cache = MemoryCache::new();
        cache
            .set("k", json!("old"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(
            cache
                .set_nx("k", json!("new"), Duration::from_secs(60))
                .await
                .unwrap()
        );
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn test_del_releases_guard() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set_nx("k", json!(1), ttl).await.unwrap();
        assert!(cache.del("k").await.unwrap());
        assert!(!cache.del("k").await.unwrap());
        assert!(cache.set_nx("k", json!(1), ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_set_nx_single_winner() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .set_nx("race", json!(i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let cache = MemoryCache::new();
        cache.set("a", json!(1), Duration::from_millis(10)).await.unwrap();
        cache.set("b", json!(1), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_run_sweep_bounds_expired_guards() {
        let cache = Arc::new(MemoryCache::new());
        for i in 0..1_000 {
            let key = dedupe_key(&format!("payment:o-{}", i));
            cache
                .set_nx(&key, json!(true), Duration::from_millis(1))
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 1_000);

        let cancel = CancellationToken::new();
        let sweeper = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.run_sweep(Duration::from_millis(10), cancel).await })
        };

        for _ in 0..100 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
