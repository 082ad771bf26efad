//! In-memory cache store.
//!
//! Backs tests and single-node deployments. Entries are lazily evicted on
//! access; pub/sub is implemented with per-channel broadcast channels.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use super::{CacheMessage, CacheStore, Subscription};
use crate::Result;

/// One stored value with its expiry.
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Thread-safe in-memory [`CacheStore`].
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    counters: DashMap<String, (i64, Instant)>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            counters: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some() | self.counters.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let count = keys.len() as u64;
        for key in keys {
            self.entries.remove(&key);
        }
        Ok(count)
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| (0, Instant::now() + ttl));
        let (count, expires_at) = entry.value_mut();
        if Instant::now() >= *expires_at {
            *count = 0;
        }
        *count += 1;
        *expires_at = Instant::now() + ttl;
        Ok(*count)
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        if let Some(entry) = self.counters.get(key) {
            let (count, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Ok(*count);
            }
            drop(entry);
            self.counters.remove(key);
        }
        Ok(0)
    }

    async fn decr_delete_at_zero(&self, key: &str) -> Result<i64> {
        if let Some(mut entry) = self.counters.get_mut(key) {
            let (count, _) = entry.value_mut();
            *count -= 1;
            let remaining = *count;
            drop(entry);
            if remaining <= 0 {
                self.counters.remove(key);
                return Ok(0);
            }
            return Ok(remaining);
        }
        Ok(0)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error
        let _ = self.channel(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = self.channel(channel).subscribe();
        let (tx, receiver) = mpsc::channel(256);
        let name = channel.to_string();
        let forward_name = name.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx
                            .send(CacheMessage {
                                channel: forward_name.clone(),
                                payload,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription {
            channel: name,
            receiver,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
