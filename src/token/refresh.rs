//! Refresh token storage and proactive refresh scheduling.
//!
//! Records live in cache under `refresh:<user_id>:<session_id>` with both
//! tokens encrypted at rest; the record TTL tracks the refresh token expiry.
//! A background loop scans a node-local registry of upcoming access-token
//! expirations and refreshes anything inside the configured buffer.
//!
//! Lifecycle events are published to the `refresh:events` channel so other
//! nodes (and the session synchronizer) can react.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::config::RefreshConfig;
use crate::crypto::EncryptionManager;
use crate::error::log_digest;
use crate::idp::IdpClient;
use crate::principal::TokenBundle;
use crate::{Error, Result};

/// Pub/sub channel for refresh lifecycle events.
pub const REFRESH_EVENTS_CHANNEL: &str = "refresh:events";

/// Fallback record TTL when the IdP does not report a refresh expiry.
const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Refresh lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshEventKind {
    /// New tokens were obtained and stored.
    TokensRefreshed,
    /// A refresh attempt failed upstream.
    RefreshFailed,
    /// The refresh token itself expired.
    RefreshExpired,
    /// Stored tokens were removed.
    TokensRemoved,
}

/// Event published on [`REFRESH_EVENTS_CHANNEL`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshEvent {
    /// Event kind.
    pub event: RefreshEventKind,
    /// User the tokens belong to.
    pub user_id: String,
    /// Session the tokens belong to.
    pub session_id: String,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Cache record: tokens encrypted, expiries in the clear for scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    encrypted_access: String,
    encrypted_refresh: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
}

/// Node-local index entry for the proactive scan.
#[derive(Debug, Clone, Copy)]
struct ScheduleEntry {
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
}

/// Stores encrypted refresh tokens and schedules proactive refresh.
pub struct RefreshTokenManager {
    cache: CacheFacade,
    encryption: Arc<EncryptionManager>,
    idp: Arc<IdpClient>,
    config: RefreshConfig,
    /// `(user_id, session_id)` → expiries, for the scan loop.
    schedule: DashMap<(String, String), ScheduleEntry>,
}

impl RefreshTokenManager {
    /// Create a manager over the shared cache, encryption and IdP client.
    #[must_use]
    pub fn new(
        cache: CacheFacade,
        encryption: Arc<EncryptionManager>,
        idp: Arc<IdpClient>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            cache,
            encryption,
            idp,
            config,
            schedule: DashMap::new(),
        }
    }

    /// Persist `bundle` for `(user_id, session_id)`, encrypted at rest.
    pub async fn store_tokens(
        &self,
        user_id: &str,
        session_id: &str,
        bundle: &TokenBundle,
    ) -> Result<()> {
        let Some(refresh_token) = &bundle.refresh_token else {
            return Err(Error::InvalidRequest("bundle carries no refresh token".into()));
        };
        let refresh_expires_at = bundle
            .refresh_expires_at
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(7));

        let record = StoredTokens {
            encrypted_access: self.encryption.encrypt_str(&bundle.access_token)?,
            encrypted_refresh: self.encryption.encrypt_str(refresh_token)?,
            access_expires_at: bundle.access_expires_at,
            refresh_expires_at,
        };

        let ttl = (refresh_expires_at - Utc::now())
            .to_std()
            .unwrap_or(DEFAULT_RECORD_TTL);
        self.cache
            .set(&record_key(user_id, session_id), &record, ttl)
            .await;

        self.schedule.insert(
            (user_id.to_string(), session_id.to_string()),
            ScheduleEntry {
                access_expires_at: bundle.access_expires_at,
                refresh_expires_at,
            },
        );
        debug!(
            user = %log_digest(user_id),
            session = %log_digest(session_id),
            "Stored refresh tokens"
        );
        Ok(())
    }

    /// Refresh the tokens stored for `(user_id, session_id)`.
    ///
    /// Emits `refresh_expired` and fails when the refresh token is past its
    /// expiry; emits `tokens_refreshed` on success and `refresh_failed` on
    /// upstream errors.
    pub async fn refresh_user_tokens(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<TokenBundle> {
        let key = record_key(user_id, session_id);
        let Some(record) = self.cache.get::<StoredTokens>(&key).await else {
            return Err(Error::Unauthorized("no stored tokens".into()));
        };

        if record.refresh_expires_at <= Utc::now() {
            self.cache.invalidate(&key).await;
            self.schedule
                .remove(&(user_id.to_string(), session_id.to_string()));
            self.publish_event(RefreshEventKind::RefreshExpired, user_id, session_id)
                .await;
            return Err(Error::TokenExpired);
        }

        let refresh_token = self.encryption.decrypt_str(&record.encrypted_refresh)?;
        let bundle = match self.idp.token_refresh(&refresh_token).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(
                    user = %log_digest(user_id),
                    error = %e,
                    "Token refresh failed"
                );
                self.publish_event(RefreshEventKind::RefreshFailed, user_id, session_id)
                    .await;
                return Err(e);
            }
        };

        // The IdP may rotate the refresh token; fall back to the old one
        let mut stored = bundle.clone();
        if stored.refresh_token.is_none() {
            stored.refresh_token = Some(refresh_token);
            stored.refresh_expires_at = Some(record.refresh_expires_at);
        }
        self.store_tokens(user_id, session_id, &stored).await?;

        self.publish_event(RefreshEventKind::TokensRefreshed, user_id, session_id)
            .await;
        Ok(stored)
    }

    /// Remove stored tokens and emit `tokens_removed`.
    pub async fn remove_stored_tokens(&self, user_id: &str, session_id: &str) {
        self.cache.invalidate(&record_key(user_id, session_id)).await;
        self.schedule
            .remove(&(user_id.to_string(), session_id.to_string()));
        self.publish_event(RefreshEventKind::TokensRemoved, user_id, session_id)
            .await;
    }

    /// Whether `(user_id, session_id)` has a refresh token that is not
    /// expired.
    pub async fn has_valid_stored_tokens(&self, user_id: &str, session_id: &str) -> bool {
        self.cache
            .get::<StoredTokens>(&record_key(user_id, session_id))
            .await
            .is_some_and(|record| record.refresh_expires_at > Utc::now())
    }

    /// Spawn the proactive refresh loop. Ticks every `cleanup_interval`,
    /// refreshing entries whose remaining access TTL is inside the buffer.
    /// The task drains and exits when `shutdown` fires.
    pub fn spawn_scheduler(
        manager: &Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            let period = Duration::from_secs(manager.config.cleanup_interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_scan().await,
                    _ = shutdown.recv() => {
                        info!("Refresh scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// One pass over the schedule: refresh near-expiry entries, drop dead
    /// ones.
    async fn run_scan(&self) {
        let now = Utc::now();
        let buffer = chrono::Duration::seconds(
            i64::try_from(self.config.refresh_buffer_secs).unwrap_or(300),
        );

        let due: Vec<(String, String)> = self
            .schedule
            .iter()
            .filter(|entry| entry.value().access_expires_at - buffer <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for (user_id, session_id) in due {
            let entry = self
                .schedule
                .get(&(user_id.clone(), session_id.clone()))
                .map(|e| *e.value());
            if let Some(entry) = entry {
                if entry.refresh_expires_at <= now {
                    self.schedule.remove(&(user_id.clone(), session_id.clone()));
                    self.publish_event(RefreshEventKind::RefreshExpired, &user_id, &session_id)
                        .await;
                    continue;
                }
            }

            debug!(
                user = %log_digest(&user_id),
                session = %log_digest(&session_id),
                "Proactively refreshing near-expiry tokens"
            );
            if let Err(e) = self.refresh_user_tokens(&user_id, &session_id).await {
                debug!(error = %e, "Proactive refresh failed");
            }
        }
    }

    async fn publish_event(&self, event: RefreshEventKind, user_id: &str, session_id: &str) {
        self.cache
            .publish(
                REFRESH_EVENTS_CHANNEL,
                &RefreshEvent {
                    event,
                    user_id: user_id.to_string(),
                    session_id: session_id.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
    }
}

impl std::fmt::Debug for RefreshTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenManager")
            .field("scheduled", &self.schedule.len())
            .finish_non_exhaustive()
    }
}

fn record_key(user_id: &str, session_id: &str) -> String {
    format!("refresh:{user_id}:{session_id}")
}
