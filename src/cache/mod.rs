//! Typed cache facade over a shared store with TTLs and pub/sub.
//!
//! The [`CacheStore`] trait abstracts the backend. [`RedisStore`] is the
//! production implementation; [`MemoryStore`] backs tests and single-node
//! deployments. Values are serialized as JSON by the facade; TTLs are
//! mandatory on every `set`.
//!
//! Read/write failures degrade gracefully: the facade logs, counts the error
//! and behaves as a miss, so a cache outage never blocks a request. Callers
//! that must distinguish outages (the rate limiter's fail-open path) talk to
//! the store directly.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::Result;

/// One message received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct CacheMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Raw payload (JSON on every channel this crate publishes to).
    pub payload: String,
}

/// Live subscription to a cache channel.
///
/// Dropping the subscription ends the background receive task.
pub struct Subscription {
    /// Channel name this subscription is bound to.
    pub channel: String,
    /// Message stream.
    pub receiver: tokio::sync::mpsc::Receiver<CacheMessage>,
}

impl Subscription {
    /// Receive the next message, or `None` when the backend closed the stream.
    pub async fn recv(&mut self) -> Option<CacheMessage> {
        self.receiver.recv().await
    }
}

/// Trait abstracting the shared cache backend.
///
/// Subscriptions must run on a dedicated backend connection so slow
/// consumers do not block command traffic.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Get the raw string value for `key`.
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` to `value` with a mandatory TTL.
    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete `key`. Returns `true` when the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key under `prefix`. Maintenance paths only; hot paths
    /// must invalidate explicit keys.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Atomically increment `key` and refresh its TTL. Returns the new value.
    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Read a counter (0 when absent).
    async fn get_counter(&self, key: &str) -> Result<i64>;

    /// Decrement a counter, deleting the key when it reaches zero.
    /// Returns the value after the decrement (clamped at 0).
    async fn decr_delete_at_zero(&self, key: &str) -> Result<i64>;

    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel` on a dedicated connection.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}

/// Facade counters, tracked atomically.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of facade counters.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Typed gets that found a live entry.
    pub hits: u64,
    /// Typed gets that found nothing.
    pub misses: u64,
    /// Backend errors absorbed by the facade.
    pub errors: u64,
}

/// Typed get/set/invalidate and pub/sub over a [`CacheStore`].
#[derive(Clone)]
pub struct CacheFacade {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    stats: Arc<CacheStats>,
}

impl CacheFacade {
    /// Wrap a store. When `enabled` is false every read is a miss and every
    /// write a no-op (pub/sub still works).
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool) -> Self {
        Self {
            store,
            enabled,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Direct access to the underlying store, for callers that need to
    /// observe backend errors (rate limiter fail-open).
    #[must_use]
    pub fn store(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.store)
    }

    /// Typed get. Backend errors and deserialization failures count as
    /// misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        match self.store.get_raw(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cache entry failed to deserialize, treating as miss");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Cache get failed, bypassing cache");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Typed set with mandatory TTL. Best-effort: failures are logged and
    /// absorbed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache value failed to serialize");
                return;
            }
        };
        if let Err(e) = self.store.set_raw(key, &raw, ttl).await {
            debug!(key = %key, error = %e, "Cache set failed");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete one key. Best-effort.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            debug!(key = %key, error = %e, "Cache invalidation failed");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Delete every key under `prefix`. Maintenance paths only.
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        match self.store.delete_prefix(prefix).await {
            Ok(count) => count,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Cache prefix invalidation failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Publish a JSON-serialized event. Best-effort.
    pub async fn publish<T: Serialize>(&self, channel: &str, payload: &T) {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Event failed to serialize");
                return;
            }
        };
        if let Err(e) = self.store.publish(channel, &raw).await {
            warn!(channel = %channel, error = %e, "Event publish failed");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to a channel on a dedicated backend connection.
    ///
    /// # Errors
    ///
    /// Returns the backend error when the subscription cannot be
    /// established; unlike reads, subscriptions do not degrade silently.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.store.subscribe(channel).await
    }

    /// Liveness probe against the backend.
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entry {
        name: String,
        count: u32,
    }

    fn facade() -> CacheFacade {
        CacheFacade::new(Arc::new(MemoryStore::new()), true)
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let cache = facade();
        let entry = Entry { name: "a".into(), count: 2 };

        cache.set("k", &entry, Duration::from_secs(60)).await;
        let got: Option<Entry> = cache.get("k").await;

        assert_eq!(got, Some(Entry { name: "a".into(), count: 2 }));
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn miss_counts() {
        let cache = facade();
        let got: Option<Entry> = cache.get("absent").await;
        assert!(got.is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn disabled_facade_never_hits() {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()), false);
        cache.set("k", &1u32, Duration::from_secs(60)).await;
        let got: Option<u32> = cache.get("k").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = facade();
        cache.set("k", &1u32, Duration::from_secs(60)).await;
        cache.invalidate("k").await;
        let got: Option<u32> = cache.get("k").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn prefix_invalidation_scopes_to_prefix() {
        let cache = facade();
        cache.set("ability:u1:a", &1u32, Duration::from_secs(60)).await;
        cache.set("ability:u1:b", &2u32, Duration::from_secs(60)).await;
        cache.set("ability:u2:a", &3u32, Duration::from_secs(60)).await;

        let removed = cache.invalidate_prefix("ability:u1:").await;

        assert_eq!(removed, 2);
        assert_eq!(cache.get::<u32>("ability:u2:a").await, Some(3));
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let cache = facade();
        let mut sub = cache.subscribe("events").await.unwrap();

        cache.publish("events", &Entry { name: "e".into(), count: 1 }).await;

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "events");
        assert!(msg.payload.contains("\"e\""));
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_raw("k", "{not json", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = CacheFacade::new(store, true);

        let got: Option<Entry> = cache.get("k").await;
        assert!(got.is_none());
        assert_eq!(cache.stats().errors, 1);
    }
}
