//! Redis-backed cache store.
//!
//! Commands go through a [`ConnectionManager`] which reconnects
//! automatically. Subscriptions open a dedicated pub/sub connection per
//! channel so a slow consumer never blocks command traffic. Prefix deletion
//! uses `SCAN` in batches and is intended for maintenance jobs only.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{CacheMessage, CacheStore, Subscription};
use crate::Result;

/// Redis [`CacheStore`] implementation.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CacheUnavailable`] when the URL is invalid or
    /// the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to cache backend");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Cache connection established");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut removed = 0u64;
        let mut cursor = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await?;
                removed += u64::try_from(deleted).unwrap_or(0);
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        // Pipelined MULTI/EXEC keeps INCR+EXPIRE atomic
        let (count, _): (i64, i64) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, i64::try_from(ttl.as_secs().max(1)).unwrap_or(1))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }

    async fn decr_delete_at_zero(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let remaining: i64 = conn.decr(key, 1).await?;
        if remaining <= 0 {
            let _: i64 = conn.del(key).await?;
            return Ok(0);
        }
        Ok(remaining)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        // Dedicated connection: SUBSCRIBE puts a Redis connection into a
        // mode where regular commands are rejected.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, receiver) = mpsc::channel(256);
        let name = channel.to_string();
        let task_name = name.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %task_name, error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx
                    .send(CacheMessage {
                        channel: task_name.clone(),
                        payload,
                    })
                    .await
                    .is_err()
                {
                    debug!(channel = %task_name, "Subscriber dropped, ending receive task");
                    break;
                }
            }
        });

        Ok(Subscription {
            channel: name,
            receiver,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}
