//! Usage counters for the auth core.
//!
//! Tracked atomically and exported as a snapshot through the facade's
//! `get_stats`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for authentication and session activity.
#[derive(Debug, Default)]
pub struct AuthStats {
    token_validations: AtomicU64,
    token_validation_failures: AtomicU64,
    token_cache_hits: AtomicU64,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    rate_limit_denials: AtomicU64,
    rate_limit_degraded: AtomicU64,
    requests: AtomicU64,
}

impl AuthStats {
    /// Create a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one token validation attempt.
    pub fn record_validation(&self, success: bool) {
        self.token_validations.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.token_validation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a validation served from cache.
    pub fn record_token_cache_hit(&self) {
        self.token_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session creation.
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session destruction.
    pub fn record_session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Roll back one session creation (used when creation fails mid-way).
    pub fn rollback_session_created(&self) {
        let _ = self
            .sessions_created
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a rate-limit denial.
    pub fn record_rate_limit_denial(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a degraded (fail-open) rate-limit decision.
    pub fn record_rate_limit_degraded(&self) {
        self.rate_limit_degraded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one handled client request.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AuthStatsSnapshot {
        AuthStatsSnapshot {
            token_validations: self.token_validations.load(Ordering::Relaxed),
            token_validation_failures: self.token_validation_failures.load(Ordering::Relaxed),
            token_cache_hits: self.token_cache_hits.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            rate_limit_denials: self.rate_limit_denials.load(Ordering::Relaxed),
            rate_limit_degraded: self.rate_limit_degraded.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`AuthStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AuthStatsSnapshot {
    /// Token validation attempts.
    pub token_validations: u64,
    /// Failed validations.
    pub token_validation_failures: u64,
    /// Validations served from cache.
    pub token_cache_hits: u64,
    /// Sessions created.
    pub sessions_created: u64,
    /// Sessions destroyed (any reason).
    pub sessions_destroyed: u64,
    /// Requests denied by the rate limiter.
    pub rate_limit_denials: u64,
    /// Requests admitted in degraded (cache-down) mode.
    pub rate_limit_degraded: u64,
    /// Client requests handled.
    pub requests: u64,
}

impl AuthStatsSnapshot {
    /// Active session estimate (created minus destroyed).
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.sessions_created.saturating_sub(self.sessions_destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = AuthStats::new();
        stats.record_validation(true);
        stats.record_validation(false);
        stats.record_token_cache_hit();
        stats.record_session_created();
        stats.record_session_created();
        stats.record_session_destroyed();
        stats.record_rate_limit_denial();
        stats.record_rate_limit_degraded();
        stats.record_request();

        let snap = stats.snapshot();
        assert_eq!(snap.token_validations, 2);
        assert_eq!(snap.token_validation_failures, 1);
        assert_eq!(snap.token_cache_hits, 1);
        assert_eq!(snap.sessions_created, 2);
        assert_eq!(snap.sessions_destroyed, 1);
        assert_eq!(snap.active_sessions(), 1);
        assert_eq!(snap.rate_limit_denials, 1);
        assert_eq!(snap.rate_limit_degraded, 1);
        assert_eq!(snap.requests, 1);
    }

    #[test]
    fn rollback_never_underflows() {
        let stats = AuthStats::new();
        stats.rollback_session_created();
        assert_eq!(stats.snapshot().sessions_created, 0);

        stats.record_session_created();
        stats.rollback_session_created();
        assert_eq!(stats.snapshot().sessions_created, 0);
    }
}
