//! Session lifecycle: creation, validation, rotation, destruction.
//!
//! Validation is the hot path: it is served from a short-TTL cache, throttles
//! `last_accessed_at` writes, refreshes near-expiry access tokens through the
//! IdP, and applies the optional IP/UA consistency checks. All lifecycle
//! transitions publish events on the session channels so stream connections
//! learn about them via the synchronizer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::store::SessionStore;
use super::sync::{
    SESSION_CREATED_CHANNEL, SESSION_DELETED_CHANNEL, SESSION_EXPIRED_CHANNEL, SessionEvent,
};
use super::Session;
use crate::cache::CacheFacade;
use crate::config::SessionConfig;
use crate::error::log_digest;
use crate::idp::IdpClient;
use crate::principal::{Principal, TokenBundle};
use crate::stats::AuthStats;
use crate::token::TokenManager;
use crate::{Error, Result};

/// Access tokens expiring within this window set `requires_token_refresh`.
const REFRESH_HINT_WINDOW_SECS: i64 = 300;

/// Shorter validation-cache TTL used when a refresh is imminent.
const REFRESH_PENDING_TTL_SECS: u64 = 30;

/// Caller context for session operations.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Caller IP.
    pub ip: String,
    /// Caller user agent.
    pub user_agent: String,
}

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    /// Owning user id.
    pub user_id: String,
    /// Principal snapshot.
    pub principal: Option<Principal>,
    /// IdP-side session id.
    pub idp_session_id: Option<String>,
    /// Tokens issued for this session.
    pub tokens: Option<TokenBundle>,
    /// Caller context.
    pub meta: RequestMeta,
    /// Requested lifetime; clamped to the configured maximum.
    pub max_age_secs: Option<u64>,
    /// Open metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of [`SessionManager::validate_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionValidation {
    /// Whether the session is valid.
    pub valid: bool,
    /// Session snapshot when valid.
    pub session: Option<Session>,
    /// The session has outlived the rotation interval.
    pub requires_rotation: bool,
    /// The access token expires soon; callers should refresh.
    pub requires_token_refresh: bool,
    /// A security check flagged the caller (IP mismatch in strict mode).
    pub suspicious: bool,
    /// Error code when invalid.
    pub error: Option<&'static str>,
}

impl SessionValidation {
    fn failure(error: &'static str) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Positive validation result cached under `session:validation:<sid>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedValidation {
    requires_rotation: bool,
    requires_token_refresh: bool,
    validated_at: DateTime<Utc>,
}

/// Session create/validate/rotate/destroy orchestration.
pub struct SessionManager {
    store: Arc<SessionStore>,
    tokens: Arc<TokenManager>,
    idp: Arc<IdpClient>,
    cache: CacheFacade,
    config: SessionConfig,
    validation_ttl: Duration,
    stats: Arc<AuthStats>,
}

impl SessionManager {
    /// Create a manager over the store and token plumbing.
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        tokens: Arc<TokenManager>,
        idp: Arc<IdpClient>,
        cache: CacheFacade,
        config: SessionConfig,
        validation_ttl_secs: u64,
        stats: Arc<AuthStats>,
    ) -> Self {
        Self {
            store,
            tokens,
            idp,
            cache,
            config,
            validation_ttl: Duration::from_secs(validation_ttl_secs.max(1)),
            stats,
        }
    }

    /// Shared session store.
    #[must_use]
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Create a session, enforcing the per-user concurrent limit.
    pub async fn create_session(&self, opts: CreateSessionOptions) -> Result<Session> {
        let now = Utc::now();
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let session_id = mint_session_id(now_ms);
        let fingerprint = fingerprint(&opts.meta.ip, &opts.meta.user_agent, now_ms);

        // Make room before inserting; the statement is atomic at the store
        let destroyed = self
            .store
            .enforce_concurrent_limit(&opts.user_id, self.config.max_concurrent_sessions)
            .await?;
        for old_sid in &destroyed {
            self.stats.record_session_destroyed();
            self.publish_lifecycle(
                SESSION_DELETED_CHANNEL,
                old_sid,
                Some(&opts.user_id),
                Some("concurrent_limit"),
            )
            .await;
        }

        let max_age = opts
            .max_age_secs
            .unwrap_or(self.config.max_age_secs)
            .min(self.config.max_age_secs);
        let bundle = opts.tokens.as_ref();
        let session = Session {
            session_id: session_id.clone(),
            user_id: opts.user_id.clone(),
            principal: opts.principal,
            idp_session_id: opts.idp_session_id,
            access_token: bundle.map(|b| b.access_token.clone()),
            refresh_token: bundle.and_then(|b| b.refresh_token.clone()),
            id_token: bundle.and_then(|b| b.id_token.clone()),
            token_expires_at: bundle.map(|b| b.access_expires_at),
            refresh_expires_at: bundle.and_then(|b| b.refresh_expires_at),
            fingerprint,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + chrono::Duration::seconds(i64::try_from(max_age).unwrap_or(0)),
            ip_address: opts.meta.ip,
            user_agent: opts.meta.user_agent,
            metadata: opts.metadata,
            is_active: true,
        };

        self.stats.record_session_created();
        self.store.store(&session).await.inspect_err(|_| {
            self.stats.rollback_session_created();
        })?;

        // Post-store steps; undo the session on failure
        if let Err(e) = self.after_create(&session, bundle).await {
            warn!(
                session = %log_digest(&session_id),
                error = %e,
                "Session creation failed after store, rolling back"
            );
            let _ = self.store.destroy(&session_id, "creation_failed").await;
            self.stats.rollback_session_created();
            self.stats.record_session_destroyed();
            return Err(Error::Internal("session creation failed".into()));
        }

        info!(
            session = %log_digest(&session_id),
            user = %log_digest(&session.user_id),
            "Session created"
        );
        Ok(session)
    }

    async fn after_create(&self, session: &Session, bundle: Option<&TokenBundle>) -> Result<()> {
        if let Some(bundle) = bundle {
            if bundle.refresh_token.is_some() && self.tokens.refresh_manager().is_some() {
                self.tokens
                    .store_tokens(&session.user_id, &session.session_id, bundle)
                    .await?;
            }
        }
        self.publish_lifecycle(
            SESSION_CREATED_CHANNEL,
            &session.session_id,
            Some(&session.user_id),
            None,
        )
        .await;
        Ok(())
    }

    /// Validate a session against the caller context.
    pub async fn validate_session(&self, session_id: &str, meta: &RequestMeta) -> SessionValidation {
        if !session_id_is_valid(session_id) || meta.ip.is_empty() || meta.user_agent.is_empty() {
            return SessionValidation::failure("invalid_request");
        }

        // Positive validations are cached briefly
        if let Some(cached) = self
            .cache
            .get::<CachedValidation>(&validation_key(session_id))
            .await
        {
            if let Ok(Some(session)) = self.store.retrieve(session_id).await {
                return SessionValidation {
                    valid: true,
                    session: Some(session),
                    requires_rotation: cached.requires_rotation,
                    requires_token_refresh: cached.requires_token_refresh,
                    suspicious: false,
                    error: None,
                };
            }
        }

        let session = match self.store.retrieve(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return SessionValidation::failure("session_not_found"),
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                return SessionValidation::failure("session_not_found");
            }
        };

        if session.is_expired() {
            let _ = self.store.destroy(session_id, "expired").await;
            self.stats.record_session_destroyed();
            self.publish_lifecycle(
                SESSION_EXPIRED_CHANNEL,
                session_id,
                Some(&session.user_id),
                Some("expired"),
            )
            .await;
            return SessionValidation::failure("session_expired");
        }

        // Security checks
        if self.config.enforce_ip_consistency && session.ip_address != meta.ip {
            warn!(
                session = %log_digest(session_id),
                "Session IP mismatch in strict mode, destroying"
            );
            let _ = self.store.destroy(session_id, "security_violation").await;
            self.stats.record_session_destroyed();
            self.publish_lifecycle(
                SESSION_DELETED_CHANNEL,
                session_id,
                Some(&session.user_id),
                Some("security_violation"),
            )
            .await;
            return SessionValidation {
                suspicious: true,
                ..SessionValidation::failure("session_security_violation")
            };
        }
        if self.config.enforce_user_agent_consistency && session.user_agent != meta.user_agent {
            // UAs legitimately change on client upgrades; observe only
            debug!(session = %log_digest(session_id), "Session user-agent changed");
        }

        let (mut session, requires_token_refresh) = match self.check_tokens(session).await {
            Ok(outcome) => outcome,
            Err(code) => return SessionValidation::failure(code),
        };

        // Throttled last-access write
        let now = Utc::now();
        let touch_after =
            chrono::Duration::seconds(i64::try_from(self.config.touch_interval_secs).unwrap_or(60));
        if now - session.last_accessed_at > touch_after {
            session.last_accessed_at = now;
            if let Err(e) = self.store.store(&session).await {
                debug!(error = %e, "Deferred last-access write failed");
            }
        }

        let rotation_after = chrono::Duration::seconds(
            i64::try_from(self.config.rotation_interval_secs).unwrap_or(3600),
        );
        let requires_rotation = now - session.created_at > rotation_after;

        let ttl = if requires_token_refresh {
            Duration::from_secs(REFRESH_PENDING_TTL_SECS.min(self.validation_ttl.as_secs()))
        } else {
            self.validation_ttl
        };
        self.cache
            .set(
                &validation_key(session_id),
                &CachedValidation {
                    requires_rotation,
                    requires_token_refresh,
                    validated_at: now,
                },
                ttl,
            )
            .await;

        SessionValidation {
            valid: true,
            session: Some(session),
            requires_rotation,
            requires_token_refresh,
            suspicious: false,
            error: None,
        }
    }

    /// Validate (and refresh when needed) the session's access token.
    /// Returns the possibly-updated session and the refresh hint.
    async fn check_tokens(&self, mut session: Session) -> std::result::Result<(Session, bool), &'static str> {
        let Some(access_token) = session.access_token.clone().filter(|t| !t.is_empty()) else {
            return Ok((session, false));
        };

        match self.tokens.validate_token(&access_token, false).await {
            Ok(result) => {
                let expires_at = result.expires_at.or(session.token_expires_at);
                let refresh_soon = expires_at.is_some_and(|exp| {
                    exp - Utc::now() < chrono::Duration::seconds(REFRESH_HINT_WINDOW_SECS)
                });
                Ok((session, refresh_soon))
            }
            Err(validation_error) => {
                let Some(refresh_token) = session.refresh_token.clone() else {
                    debug!(error = %validation_error, "Access token invalid and no refresh token held");
                    return Err("token_invalid");
                };

                match self.idp.token_refresh(&refresh_token).await {
                    Ok(bundle) => {
                        session.access_token = Some(bundle.access_token.clone());
                        session.token_expires_at = Some(bundle.access_expires_at);
                        if bundle.refresh_token.is_some() {
                            session.refresh_token = bundle.refresh_token.clone();
                            session.refresh_expires_at = bundle.refresh_expires_at;
                        }
                        if let Err(e) = self.store.store(&session).await {
                            warn!(error = %e, "Failed to persist refreshed tokens");
                            return Err("session_not_found");
                        }
                        // The store write invalidated the validation cache;
                        // re-validate the fresh access token
                        match self
                            .tokens
                            .validate_token(&bundle.access_token, false)
                            .await
                        {
                            Ok(_) => Ok((session, false)),
                            Err(e) => {
                                warn!(error = %e, "Refreshed access token failed validation");
                                Err("token_invalid")
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Token refresh during validation failed");
                        Err("token_expired")
                    }
                }
            }
        }
    }

    /// Rotate a session: same identity and tokens, fresh id and fingerprint.
    pub async fn rotate_session(&self, session_id: &str, meta: &RequestMeta) -> Result<Session> {
        let old = self
            .store
            .retrieve(session_id)
            .await?
            .ok_or(Error::SessionNotFound)?;

        let now = Utc::now();
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let mut rotated = old.clone();
        rotated.session_id = mint_session_id(now_ms);
        rotated.fingerprint = fingerprint(&meta.ip, &meta.user_agent, now_ms);
        rotated.created_at = now;
        rotated.last_accessed_at = now;
        rotated.ip_address.clone_from(&meta.ip);
        rotated.user_agent.clone_from(&meta.user_agent);

        self.store.store(&rotated).await?;
        self.store.destroy(session_id, "rotated").await?;
        self.publish_lifecycle(
            SESSION_DELETED_CHANNEL,
            session_id,
            Some(&old.user_id),
            Some("rotated"),
        )
        .await;
        self.publish_lifecycle(
            SESSION_CREATED_CHANNEL,
            &rotated.session_id,
            Some(&rotated.user_id),
            None,
        )
        .await;

        info!(
            old = %log_digest(session_id),
            new = %log_digest(&rotated.session_id),
            "Session rotated"
        );
        Ok(rotated)
    }

    /// Destroy one session. Returns `true` when a live session was destroyed.
    pub async fn destroy_session(&self, session_id: &str, reason: &str) -> Result<bool> {
        let session = self.store.retrieve(session_id).await?;
        let existed = self.store.destroy(session_id, reason).await?;
        if existed {
            self.stats.record_session_destroyed();
            self.publish_lifecycle(
                SESSION_DELETED_CHANNEL,
                session_id,
                session.as_ref().map(|s| s.user_id.as_str()),
                Some(reason),
            )
            .await;
        }
        Ok(existed)
    }

    /// Destroy every active session of a user. Returns the count destroyed.
    pub async fn destroy_all_user_sessions(&self, user_id: &str) -> Result<u64> {
        let sessions = self.store.get_user_sessions(user_id).await?;
        let mut destroyed = 0u64;
        for session in sessions {
            if self
                .destroy_session(&session.session_id, "all_sessions_destroyed")
                .await?
            {
                destroyed += 1;
            }
        }
        Ok(destroyed)
    }

    async fn publish_lifecycle(
        &self,
        channel: &str,
        session_id: &str,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) {
        self.cache
            .publish(
                channel,
                &SessionEvent {
                    session_id: session_id.to_string(),
                    user_id: user_id.map(String::from),
                    updates: None,
                    reason: reason.map(String::from),
                    source: "http".to_string(),
                    origin_connection_id: None,
                    timestamp: Utc::now(),
                },
            )
            .await;
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

/// `<uuid>.<base36 millis>`: unique, unguessable, creation-time ordered.
fn mint_session_id(now_ms: u64) -> String {
    format!("{}.{}", uuid::Uuid::new_v4(), base36(now_ms))
}

/// Whether `sid` has the shape this manager mints.
fn session_id_is_valid(sid: &str) -> bool {
    let Some((head, tail)) = sid.split_once('.') else {
        return false;
    };
    uuid::Uuid::parse_str(head).is_ok()
        && !tail.is_empty()
        && tail.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Session-theft heuristic: hash of caller context and creation time.
fn fingerprint(ip: &str, user_agent: &str, now_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{ip}:{user_agent}:{now_ms}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase base36 rendering.
fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

fn validation_key(session_id: &str) -> String {
    format!("session:validation:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheFacade, MemoryStore};
    use crate::config::{IdpConfig, JwtConfig, SessionConfig};
    use crate::crypto::EncryptionManager;
    use crate::middleware::RetryPolicy;
    use crate::session::store::MemorySessionRepository;
    use crate::token::{JwtValidator, TokenIntrospector, TokenManager};

    fn meta() -> RequestMeta {
        RequestMeta {
            ip: "10.0.0.1".to_string(),
            user_agent: "UA/1".to_string(),
        }
    }

    fn manager_with(config: SessionConfig) -> SessionManager {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
        let encryption = Arc::new(
            EncryptionManager::new(&EncryptionManager::generate_master_key(), 1_000).unwrap(),
        );
        let store = Arc::new(SessionStore::new(
            Arc::new(MemorySessionRepository::new()),
            cache.clone(),
            encryption,
            config.clone(),
        ));
        let idp = Arc::new(
            IdpClient::new(
                IdpConfig {
                    server_url: "https://id.example.com".to_string(),
                    client_id: "gw".to_string(),
                    ..IdpConfig::default()
                },
                RetryPolicy::disabled(),
            )
            .unwrap(),
        );
        let jwt = Arc::new(JwtValidator::new(
            &JwtConfig::default(),
            "https://id.example.com/certs".to_string(),
            reqwest::Client::new(),
        ));
        let introspector = Arc::new(TokenIntrospector::new(Arc::clone(&idp)));
        let stats = Arc::new(AuthStats::new());
        let tokens = Arc::new(TokenManager::new(
            jwt,
            introspector,
            cache.clone(),
            crate::config::CacheTtlConfig::default(),
            Arc::clone(&stats),
        ));
        SessionManager::new(store, tokens, idp, cache, config, 60, stats)
    }

    fn manager() -> SessionManager {
        manager_with(SessionConfig::default())
    }

    fn create_opts(user_id: &str) -> CreateSessionOptions {
        CreateSessionOptions {
            user_id: user_id.to_string(),
            principal: None,
            idp_session_id: Some("idp-sid".to_string()),
            tokens: None,
            meta: meta(),
            max_age_secs: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn minted_ids_validate_and_random_strings_do_not() {
        let sid = mint_session_id(1_700_000_000_000);
        assert!(session_id_is_valid(&sid));
        assert!(!session_id_is_valid("not-a-session"));
        assert!(!session_id_is_valid("9e9c1m8w"));
        assert!(!session_id_is_valid(""));
    }

    #[test]
    fn base36_renders_lowercase() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[tokio::test]
    async fn create_then_validate() {
        let manager = manager();
        let session = manager.create_session(create_opts("u1")).await.unwrap();

        assert_eq!(session.user_id, "u1");
        assert!(session.is_active);
        assert!(session.expires_at > session.created_at);

        let outcome = manager.validate_session(&session.session_id, &meta()).await;
        assert!(outcome.valid, "error: {:?}", outcome.error);
        assert!(!outcome.requires_rotation);
        assert_eq!(outcome.session.unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn validate_rejects_malformed_ids_and_missing_context() {
        let manager = manager();
        let outcome = manager.validate_session("garbage", &meta()).await;
        assert_eq!(outcome.error, Some("invalid_request"));

        let session = manager.create_session(create_opts("u1")).await.unwrap();
        let empty = RequestMeta {
            ip: String::new(),
            user_agent: "UA/1".to_string(),
        };
        let outcome = manager.validate_session(&session.session_id, &empty).await;
        assert_eq!(outcome.error, Some("invalid_request"));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let manager = manager();
        let sid = mint_session_id(1);
        let outcome = manager.validate_session(&sid, &meta()).await;
        assert_eq!(outcome.error, Some("session_not_found"));
    }

    #[tokio::test]
    async fn expired_session_is_destroyed_on_validate() {
        let manager = manager();
        let session = manager
            .create_session(CreateSessionOptions {
                max_age_secs: Some(0),
                ..create_opts("u1")
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcome = manager.validate_session(&session.session_id, &meta()).await;
        assert_eq!(outcome.error, Some("session_expired"));

        // A second validate observes the destruction
        let outcome = manager.validate_session(&session.session_id, &meta()).await;
        assert_eq!(outcome.error, Some("session_not_found"));
    }

    #[tokio::test]
    async fn strict_ip_mismatch_destroys_and_flags() {
        let manager = manager_with(SessionConfig {
            enforce_ip_consistency: true,
            ..SessionConfig::default()
        });
        let session = manager.create_session(create_opts("u1")).await.unwrap();

        let attacker = RequestMeta {
            ip: "192.0.2.66".to_string(),
            user_agent: "UA/1".to_string(),
        };
        let outcome = manager.validate_session(&session.session_id, &attacker).await;
        assert!(!outcome.valid);
        assert!(outcome.suspicious);
        assert_eq!(outcome.error, Some("session_security_violation"));

        let outcome = manager.validate_session(&session.session_id, &meta()).await;
        assert_eq!(outcome.error, Some("session_not_found"));
    }

    #[tokio::test]
    async fn lenient_ip_mismatch_is_tolerated() {
        let manager = manager();
        let session = manager.create_session(create_opts("u1")).await.unwrap();

        let roaming = RequestMeta {
            ip: "192.0.2.66".to_string(),
            user_agent: "UA/2".to_string(),
        };
        let outcome = manager.validate_session(&session.session_id, &roaming).await;
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn rotation_preserves_identity_with_fresh_id() {
        let manager = manager();
        let original = manager.create_session(create_opts("u1")).await.unwrap();

        let rotated = manager
            .rotate_session(&original.session_id, &meta())
            .await
            .unwrap();

        assert_eq!(rotated.user_id, original.user_id);
        assert_eq!(rotated.idp_session_id, original.idp_session_id);
        assert_ne!(rotated.session_id, original.session_id);
        assert_ne!(rotated.fingerprint, original.fingerprint);

        // Old sid is gone, new one validates
        let outcome = manager.validate_session(&original.session_id, &meta()).await;
        assert_eq!(outcome.error, Some("session_not_found"));
        let outcome = manager.validate_session(&rotated.session_id, &meta()).await;
        assert!(outcome.valid);
    }

    #[tokio::test]
    async fn concurrent_limit_evicts_oldest() {
        let manager = manager_with(SessionConfig {
            max_concurrent_sessions: 2,
            ..SessionConfig::default()
        });

        let first = manager.create_session(create_opts("u2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager.create_session(create_opts("u2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = manager.create_session(create_opts("u2")).await.unwrap();

        // Oldest evicted with reason concurrent_limit
        let outcome = manager.validate_session(&first.session_id, &meta()).await;
        assert!(!outcome.valid);
        assert!(manager.validate_session(&second.session_id, &meta()).await.valid);
        assert!(manager.validate_session(&third.session_id, &meta()).await.valid);

        let active = manager.store().get_user_sessions("u2").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn destroy_all_user_sessions_counts() {
        let manager = manager();
        manager.create_session(create_opts("u3")).await.unwrap();
        manager.create_session(create_opts("u3")).await.unwrap();
        manager.create_session(create_opts("other")).await.unwrap();

        let destroyed = manager.destroy_all_user_sessions("u3").await.unwrap();
        assert_eq!(destroyed, 2);
        assert!(manager.store().get_user_sessions("u3").await.unwrap().is_empty());
        assert_eq!(manager.store().get_user_sessions("other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let manager = manager();
        let session = manager.create_session(create_opts("u1")).await.unwrap();

        assert!(manager.destroy_session(&session.session_id, "logout").await.unwrap());
        assert!(!manager.destroy_session(&session.session_id, "logout").await.unwrap());
    }
}
