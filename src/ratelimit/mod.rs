//! Distributed sliding-window rate limiting for the request and stream
//! protocols.
//!
//! # Algorithm
//!
//! Two counters per bucket at window resolution: the current window `C` and
//! the previous window `P`. For a request at fraction `f` of the current
//! window, the estimated rate is `C + P * (1 - f)`; the request is admitted
//! iff the estimate is below the limit. Counter increments run as an atomic
//! `INCR`+`EXPIRE` against the cache store.
//!
//! # Failure policy
//!
//! The limiter fails open: when the cache tier is unreachable, requests are
//! admitted and the degraded counter is recorded so operators can see the
//! window during which limits were not enforced.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::config::RateLimitConfig;
use crate::stats::AuthStats;

/// Bucket key strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitKey {
    /// Keyed by caller IP.
    Ip(String),
    /// Keyed by authenticated user id.
    User(String),
    /// Keyed by API key id.
    ApiKey(String),
    /// Caller-supplied key.
    Custom(String),
}

impl RateLimitKey {
    /// The bucket fragment (`ip:…`, `user:…`, `apikey:…`, raw custom).
    #[must_use]
    pub fn bucket(&self) -> String {
        match self {
            Self::Ip(ip) => format!("ip:{ip}"),
            Self::User(user) => format!("user:{user}"),
            Self::ApiKey(key_id) => format!("apikey:{key_id}"),
            Self::Custom(key) => key.clone(),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request/message/connection is admitted.
    pub allowed: bool,
    /// Configured limit for the window consulted.
    pub limit: u64,
    /// Estimated remaining quota.
    pub remaining: u64,
    /// Seconds until the current window rolls over.
    pub reset_secs: u64,
    /// Window size in seconds.
    pub window_secs: u64,
    /// Seconds to wait before retrying (deny only).
    pub retry_after_secs: Option<u64>,
    /// The decision was made with the cache unreachable (fail-open).
    pub degraded: bool,
}

impl RateLimitDecision {
    fn fail_open(limit: u64, window_secs: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_secs: window_secs,
            window_secs,
            retry_after_secs: None,
            degraded: true,
        }
    }

    /// Standard rate-limit headers for the request protocol.
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_secs.to_string()),
            ("X-RateLimit-Window", self.window_secs.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers
    }
}

/// Sliding-window rate limiter over the shared cache store.
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    config: RateLimitConfig,
    stats: Arc<AuthStats>,
}

impl RateLimiter {
    /// Create a limiter over the cache store.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, config: RateLimitConfig, stats: Arc<AuthStats>) -> Self {
        Self {
            store,
            config,
            stats,
        }
    }

    /// Check (and count) one request for `key`.
    pub async fn check(&self, key: &RateLimitKey) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision {
                allowed: true,
                limit: self.config.max_requests,
                remaining: self.config.max_requests,
                reset_secs: self.config.window_ms / 1_000,
                window_secs: self.config.window_ms / 1_000,
                retry_after_secs: None,
                degraded: false,
            };
        }
        self.sliding_check(&key.bucket(), self.config.window_ms, self.config.max_requests)
            .await
    }

    /// Undo one counted request, honoring the `skip_successful_requests` /
    /// `skip_failed_requests` policy. Called after the handler ran.
    pub async fn record_outcome(&self, key: &RateLimitKey, handler_succeeded: bool) {
        let skip = (handler_succeeded && self.config.skip_successful_requests)
            || (!handler_succeeded && self.config.skip_failed_requests);
        if !skip {
            return;
        }
        let counter = self.window_key(&key.bucket(), self.config.window_ms, 0);
        if let Err(e) = self.store.decr_delete_at_zero(&counter).await {
            debug!(error = %e, "Failed to uncount request");
        }
    }

    /// Stream handshake: admit iff the bucket is under `max_connections`.
    pub async fn try_connect(&self, key: &RateLimitKey) -> RateLimitDecision {
        let limit = self.config.stream.max_connections;
        let counter = format!("{}:{}:connections", self.config.prefix, key.bucket());

        let current = match self.store.get_counter(&counter).await {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Rate limit store unreachable, admitting connection");
                self.stats.record_rate_limit_degraded();
                return RateLimitDecision::fail_open(limit, self.config.window_ms / 1_000);
            }
        };

        if u64::try_from(current).unwrap_or(0) >= limit {
            self.stats.record_rate_limit_denial();
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_secs: self.config.stream.connection_retry_after_secs,
                window_secs: self.config.window_ms / 1_000,
                retry_after_secs: Some(self.config.stream.connection_retry_after_secs),
                degraded: false,
            };
        }

        // Refreshed on every connect; a day-long TTL bounds leakage from
        // crashed nodes that never ran the disconnect hook
        if let Err(e) = self
            .store
            .incr_with_expire(&counter, Duration::from_secs(86_400))
            .await
        {
            warn!(error = %e, "Failed to count connection, admitting");
            self.stats.record_rate_limit_degraded();
            return RateLimitDecision::fail_open(limit, self.config.window_ms / 1_000);
        }

        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(u64::try_from(current).unwrap_or(0) + 1),
            reset_secs: 0,
            window_secs: self.config.window_ms / 1_000,
            retry_after_secs: None,
            degraded: false,
        }
    }

    /// Disconnect hook: decrement the connection counter, deleting the key
    /// at zero.
    pub async fn disconnect(&self, key: &RateLimitKey) {
        let counter = format!("{}:{}:connections", self.config.prefix, key.bucket());
        if let Err(e) = self.store.decr_delete_at_zero(&counter).await {
            debug!(error = %e, "Failed to decrement connection counter");
        }
    }

    /// Check (and count) one inbound stream message against the per-minute
    /// and per-hour windows.
    pub async fn check_message(&self, key: &RateLimitKey) -> RateLimitDecision {
        let bucket = key.bucket();
        let minute = self
            .sliding_check(
                &format!("{bucket}:msg_m"),
                60_000,
                self.config.stream.max_messages_per_minute,
            )
            .await;
        if !minute.allowed {
            return minute;
        }
        let hour = self
            .sliding_check(
                &format!("{bucket}:msg_h"),
                3_600_000,
                self.config.stream.max_messages_per_hour,
            )
            .await;
        if hour.allowed { minute } else { hour }
    }

    /// Core sliding-window check against one bucket.
    async fn sliding_check(&self, bucket: &str, window_ms: u64, limit: u64) -> RateLimitDecision {
        let window_secs = window_ms / 1_000;
        let now_ms = epoch_millis();
        let elapsed_ms = now_ms % window_ms;

        let current_key = self.window_key(bucket, window_ms, 0);
        let previous_key = self.window_key(bucket, window_ms, 1);

        let (current, previous) = match (
            self.store.get_counter(&current_key).await,
            self.store.get_counter(&previous_key).await,
        ) {
            (Ok(current), Ok(previous)) => (
                u64::try_from(current).unwrap_or(0),
                u64::try_from(previous).unwrap_or(0),
            ),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Rate limit store unreachable, failing open");
                self.stats.record_rate_limit_degraded();
                return RateLimitDecision::fail_open(limit, window_secs);
            }
        };

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimated = {
            let fraction = elapsed_ms as f64 / window_ms as f64;
            (current as f64 + previous as f64 * (1.0 - fraction)).floor() as u64
        };

        let reset_secs = (window_ms - elapsed_ms).div_ceil(1_000);

        if estimated >= limit {
            self.stats.record_rate_limit_denial();
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_secs,
                window_secs,
                retry_after_secs: Some(reset_secs),
                degraded: false,
            };
        }

        // Count the admitted request; TTL covers two windows so the
        // previous-window counter survives into the next
        let ttl = Duration::from_secs(window_ms.div_ceil(1_000) * 2);
        if let Err(e) = self.store.incr_with_expire(&current_key, ttl).await {
            warn!(error = %e, "Failed to count request, admitting");
            self.stats.record_rate_limit_degraded();
            return RateLimitDecision::fail_open(limit, window_secs);
        }

        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(estimated + 1),
            reset_secs,
            window_secs,
            retry_after_secs: None,
            degraded: false,
        }
    }

    /// Counter key for the window `offset` windows ago.
    fn window_key(&self, bucket: &str, window_ms: u64, offset: u64) -> String {
        let index = (epoch_millis() / window_ms).saturating_sub(offset);
        format!("{}:{}:{}", self.config.prefix, bucket, index)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.config.enabled)
            .field("window_ms", &self.config.window_ms)
            .field("max_requests", &self.config.max_requests)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
