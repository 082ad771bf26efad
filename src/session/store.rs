//! Session persistence: repository trait, Postgres and in-memory
//! implementations, and the cache-through [`SessionStore`].
//!
//! Tokens are encrypted before they reach a repository or the cache;
//! plaintext never leaves the store/manager pair. Concurrent-session
//! enforcement is a single atomic statement in the Postgres implementation
//! (CTE + `UPDATE … RETURNING`) so racing creations cannot over-admit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use tracing::{debug, warn};

use super::Session;
use crate::cache::CacheFacade;
use crate::config::SessionConfig;
use crate::crypto::EncryptionManager;
use crate::error::log_digest;
use crate::principal::Principal;
use crate::{Error, Result};

/// Session as persisted: token fields hold encrypted blobs.
pub type SessionRecord = Session;

/// Trait abstracting session persistence.
#[async_trait]
pub trait SessionRepository: Send + Sync + 'static {
    /// Insert or update by `session_id`. On conflict the token fields,
    /// `last_accessed_at`, metadata and `is_active` are updated.
    async fn upsert(&self, record: &SessionRecord) -> Result<()>;

    /// Fetch an active record by `session_id`.
    async fn find_active(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Deactivate one session, tagging the reason. Returns `true` when a
    /// live row was updated.
    async fn deactivate(&self, session_id: &str, reason: &str) -> Result<bool>;

    /// Deactivate every expired session. Returns the number deactivated.
    async fn deactivate_expired(&self) -> Result<u64>;

    /// Atomically deactivate the oldest sessions so that after admitting
    /// one more the user holds at most `max`. Returns deactivated ids.
    async fn enforce_concurrent_limit(&self, user_id: &str, max: u32) -> Result<Vec<String>>;

    /// Active, unexpired sessions for `user_id`, most recently used first.
    async fn find_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}

// ── Postgres implementation ───────────────────────────────────────────────────

/// Row shape for `user_sessions`.
#[derive(sqlx::FromRow)]
struct SessionRow {
    user_id: String,
    session_id: String,
    keycloak_session_id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    id_token: Option<String>,
    token_expires_at: Option<chrono::DateTime<Utc>>,
    refresh_expires_at: Option<chrono::DateTime<Utc>>,
    fingerprint: String,
    last_accessed_at: chrono::DateTime<Utc>,
    created_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
    ip_address: String,
    user_agent: String,
    metadata: serde_json::Value,
    is_active: bool,
}

impl SessionRow {
    fn into_record(self) -> SessionRecord {
        let principal = self
            .metadata
            .get("principal")
            .and_then(|v| serde_json::from_value::<Principal>(v.clone()).ok());
        let metadata = match self.metadata {
            serde_json::Value::Object(mut map) => {
                map.remove("principal");
                map
            }
            _ => serde_json::Map::new(),
        };
        SessionRecord {
            session_id: self.session_id,
            user_id: self.user_id,
            principal,
            idp_session_id: self.keycloak_session_id,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            token_expires_at: self.token_expires_at,
            refresh_expires_at: self.refresh_expires_at,
            fingerprint: self.fingerprint,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            expires_at: self.expires_at,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            metadata,
            is_active: self.is_active,
        }
    }
}

/// Postgres-backed [`SessionRepository`].
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn metadata_json(record: &SessionRecord) -> serde_json::Value {
        let mut metadata = record.metadata.clone();
        if let Some(principal) = &record.principal {
            if let Ok(value) = serde_json::to_value(principal) {
                metadata.insert("principal".to_string(), value);
            }
        }
        serde_json::Value::Object(metadata)
    }
}

const SELECT_COLUMNS: &str = "user_id, session_id, keycloak_session_id, access_token, \
     refresh_token, id_token, token_expires_at, refresh_expires_at, fingerprint, \
     last_accessed_at, created_at, expires_at, ip_address, user_agent, metadata, is_active";

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let sql = "INSERT INTO user_sessions (id, user_id, session_id, keycloak_session_id, \
             access_token, refresh_token, id_token, token_expires_at, refresh_expires_at, \
             fingerprint, last_accessed_at, created_at, updated_at, expires_at, ip_address, \
             user_agent, metadata, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), $13, $14, $15, $16, $17) \
             ON CONFLICT (session_id) DO UPDATE SET \
               access_token = EXCLUDED.access_token, \
               refresh_token = EXCLUDED.refresh_token, \
               id_token = EXCLUDED.id_token, \
               token_expires_at = EXCLUDED.token_expires_at, \
               refresh_expires_at = EXCLUDED.refresh_expires_at, \
               last_accessed_at = EXCLUDED.last_accessed_at, \
               metadata = EXCLUDED.metadata, \
               is_active = EXCLUDED.is_active, \
               updated_at = NOW()";
        sqlx::query(sql)
            .bind(uuid::Uuid::new_v4())
            .bind(&record.user_id)
            .bind(&record.session_id)
            .bind(&record.idp_session_id)
            .bind(&record.access_token)
            .bind(&record.refresh_token)
            .bind(&record.id_token)
            .bind(record.token_expires_at)
            .bind(record.refresh_expires_at)
            .bind(&record.fingerprint)
            .bind(record.last_accessed_at)
            .bind(record.created_at)
            .bind(record.expires_at)
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(Self::metadata_json(record))
            .bind(record.is_active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_active(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM user_sessions WHERE session_id = $1 AND is_active = TRUE"
        );
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SessionRow::into_record))
    }

    async fn deactivate(&self, session_id: &str, reason: &str) -> Result<bool> {
        let sql = "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW(), \
             metadata = metadata || jsonb_build_object('destroy_reason', $2::text) \
             WHERE session_id = $1 AND is_active = TRUE";
        let result = sqlx::query(sql)
            .bind(session_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_expired(&self) -> Result<u64> {
        let sql = "UPDATE user_sessions SET is_active = FALSE, updated_at = NOW(), \
             metadata = metadata || jsonb_build_object('destroy_reason', 'expired') \
             WHERE is_active = TRUE AND expires_at < NOW() RETURNING id";
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.len() as u64)
    }

    async fn enforce_concurrent_limit(&self, user_id: &str, max: u32) -> Result<Vec<String>> {
        // Single statement: count and deactivate in one snapshot so two
        // racing logins cannot both observe room and over-admit.
        let sql = "WITH active AS ( \
               SELECT session_id FROM user_sessions \
               WHERE user_id = $1 AND is_active = TRUE AND expires_at > NOW() \
               ORDER BY created_at ASC \
             ), excess AS ( \
               SELECT session_id FROM active \
               LIMIT GREATEST(0, (SELECT COUNT(*) FROM active) - $2 + 1) \
             ) \
             UPDATE user_sessions s SET is_active = FALSE, updated_at = NOW(), \
               metadata = s.metadata || jsonb_build_object('destroy_reason', 'concurrent_limit') \
             FROM excess WHERE s.session_id = excess.session_id \
             RETURNING s.session_id";
        let rows: Vec<(String,)> = sqlx::query_as(sql)
            .bind(user_id)
            .bind(i64::from(max))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(sid,)| sid).collect())
    }

    async fn find_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM user_sessions \
             WHERE user_id = $1 AND is_active = TRUE AND expires_at > NOW() \
             ORDER BY last_accessed_at DESC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SessionRow::into_record).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// In-memory [`SessionRepository`] for tests and single-node deployments.
///
/// Limit enforcement serializes on a mutex, which is the in-process
/// equivalent of the single-statement guarantee.
pub struct MemorySessionRepository {
    sessions: DashMap<String, SessionRecord>,
    limit_lock: tokio::sync::Mutex<()>,
}

impl MemorySessionRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            limit_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl Default for MemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn find_active(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .get(session_id)
            .filter(|r| r.is_active)
            .map(|r| r.clone()))
    }

    async fn deactivate(&self, session_id: &str, reason: &str) -> Result<bool> {
        if let Some(mut record) = self.sessions.get_mut(session_id) {
            if record.is_active {
                record.is_active = false;
                record.metadata.insert(
                    "destroy_reason".to_string(),
                    serde_json::Value::String(reason.to_string()),
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn deactivate_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut count = 0u64;
        for mut entry in self.sessions.iter_mut() {
            if entry.is_active && entry.expires_at < now {
                entry.is_active = false;
                entry.metadata.insert(
                    "destroy_reason".to_string(),
                    serde_json::Value::String("expired".to_string()),
                );
                count += 1;
            }
        }
        Ok(count)
    }

    async fn enforce_concurrent_limit(&self, user_id: &str, max: u32) -> Result<Vec<String>> {
        let _guard = self.limit_lock.lock().await;
        let now = Utc::now();

        let mut active: Vec<(String, chrono::DateTime<Utc>)> = self
            .sessions
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active && r.expires_at > now)
            .map(|r| (r.session_id.clone(), r.created_at))
            .collect();
        active.sort_by_key(|(_, created_at)| *created_at);

        let excess = (active.len() + 1).saturating_sub(max as usize);
        let mut destroyed = Vec::with_capacity(excess);
        for (session_id, _) in active.into_iter().take(excess) {
            if let Some(mut record) = self.sessions.get_mut(&session_id) {
                record.is_active = false;
                record.metadata.insert(
                    "destroy_reason".to_string(),
                    serde_json::Value::String("concurrent_limit".to_string()),
                );
            }
            destroyed.push(session_id);
        }
        Ok(destroyed)
    }

    async fn find_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let now = Utc::now();
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|r| r.user_id == user_id && r.is_active && r.expires_at > now)
            .map(|r| r.clone())
            .collect();
        sessions.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        Ok(sessions)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ── Cache-through store ───────────────────────────────────────────────────────

/// Cache-through session store with token encryption at the boundary.
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    cache: CacheFacade,
    encryption: Arc<EncryptionManager>,
    config: SessionConfig,
}

impl SessionStore {
    /// Create a store over a repository.
    #[must_use]
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        cache: CacheFacade,
        encryption: Arc<EncryptionManager>,
        config: SessionConfig,
    ) -> Self {
        if !config.token_encryption {
            // The flag exists for migrations; it never disables encryption
            // of new writes.
            warn!("session.token_encryption is disabled in config; new writes are encrypted regardless");
        }
        Self {
            repo,
            cache,
            encryption,
            config,
        }
    }

    /// Persist `session`, encrypting tokens, then refresh the value cache
    /// and drop any stale validation entry.
    pub async fn store(&self, session: &Session) -> Result<()> {
        let record = self.seal(session)?;
        self.repo.upsert(&record).await?;

        let ttl = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.cache
            .set(&value_key(&record.session_id), &record, ttl)
            .await;
        self.cache
            .invalidate(&validation_key(&record.session_id))
            .await;
        Ok(())
    }

    /// Fetch a session, cache first, decrypting tokens.
    pub async fn retrieve(&self, session_id: &str) -> Result<Option<Session>> {
        if let Some(record) = self.cache.get::<SessionRecord>(&value_key(session_id)).await {
            if record.is_active {
                return Ok(Some(self.unseal(record)));
            }
        }

        let Some(record) = self.repo.find_active(session_id).await? else {
            return Ok(None);
        };
        let ttl = (record.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        self.cache.set(&value_key(session_id), &record, ttl).await;
        Ok(Some(self.unseal(record)))
    }

    /// Deactivate a session and drop both cache entries.
    pub async fn destroy(&self, session_id: &str, reason: &str) -> Result<bool> {
        let existed = self.repo.deactivate(session_id, reason).await?;
        self.invalidate_cached(session_id).await;
        if existed {
            debug!(
                session = %log_digest(session_id),
                reason,
                "Session destroyed"
            );
        }
        Ok(existed)
    }

    /// Bulk-deactivate expired sessions.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.repo.deactivate_expired().await
    }

    /// Atomically make room for one more session for `user_id`.
    /// Cache entries of the deactivated sessions are dropped after commit.
    pub async fn enforce_concurrent_limit(&self, user_id: &str, max: u32) -> Result<Vec<String>> {
        let destroyed = self.repo.enforce_concurrent_limit(user_id, max).await?;
        for session_id in &destroyed {
            self.invalidate_cached(session_id).await;
        }
        Ok(destroyed)
    }

    /// Active sessions for a user, most recently used first.
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let records = self.repo.find_user_sessions(user_id).await?;
        Ok(records.into_iter().map(|r| self.unseal(r)).collect())
    }

    /// Repository liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.repo.ping().await
    }

    async fn invalidate_cached(&self, session_id: &str) {
        self.cache.invalidate(&value_key(session_id)).await;
        self.cache.invalidate(&validation_key(session_id)).await;
    }

    /// Encrypt token fields for storage.
    fn seal(&self, session: &Session) -> Result<SessionRecord> {
        let mut record = session.clone();
        record.access_token = session
            .access_token
            .as_deref()
            .map(|t| self.encryption.encrypt_str(t))
            .transpose()
            .map_err(Error::from)?;
        record.refresh_token = session
            .refresh_token
            .as_deref()
            .map(|t| self.encryption.encrypt_str(t))
            .transpose()
            .map_err(Error::from)?;
        record.id_token = session
            .id_token
            .as_deref()
            .map(|t| self.encryption.encrypt_str(t))
            .transpose()
            .map_err(Error::from)?;
        Ok(record)
    }

    /// Decrypt token fields, tolerating legacy plaintext during migration.
    fn unseal(&self, mut record: SessionRecord) -> Session {
        record.access_token = record
            .access_token
            .take()
            .map(|blob| self.open_token(blob, "access"));
        record.refresh_token = record
            .refresh_token
            .take()
            .map(|blob| self.open_token(blob, "refresh"));
        record.id_token = record
            .id_token
            .take()
            .map(|blob| self.open_token(blob, "id"));
        record
    }

    fn open_token(&self, blob: String, kind: &str) -> String {
        match self.encryption.decrypt_str(&blob) {
            Ok(token) => token,
            Err(_) => {
                // Legacy plaintext looks like a JWT (dots) or is suspiciously
                // short; tolerate only when the migration flag is on.
                if self.config.allow_legacy_plaintext && (blob.contains('.') || blob.len() < 64) {
                    warn!(kind, "Stored token failed decryption, treating as legacy plaintext");
                    blob
                } else {
                    warn!(kind, "Stored token failed decryption, dropping");
                    String::new()
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

fn value_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

fn validation_key(session_id: &str) -> String {
    format!("session:validation:{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn store() -> SessionStore {
        let repo = Arc::new(MemorySessionRepository::new());
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
        let encryption = Arc::new(
            EncryptionManager::new(&EncryptionManager::generate_master_key(), 1_000).unwrap(),
        );
        SessionStore::new(repo, cache, encryption, SessionConfig::default())
    }

    fn session(session_id: &str, user_id: &str) -> Session {
        let now = Utc::now();
        Session {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            principal: None,
            idp_session_id: Some("idp-1".to_string()),
            access_token: Some("eyJ.access.token".to_string()),
            refresh_token: Some("refresh-token".to_string()),
            id_token: None,
            token_expires_at: Some(now + chrono::Duration::seconds(300)),
            refresh_expires_at: Some(now + chrono::Duration::hours(8)),
            fingerprint: "fp".to_string(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + chrono::Duration::hours(1),
            ip_address: "10.0.0.1".to_string(),
            user_agent: "UA/1".to_string(),
            metadata: serde_json::Map::new(),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn store_and_retrieve_round_trips_plaintext_tokens() {
        let store = store();
        store.store(&session("s1", "u1")).await.unwrap();

        let got = store.retrieve("s1").await.unwrap().unwrap();
        assert_eq!(got.access_token.as_deref(), Some("eyJ.access.token"));
        assert_eq!(got.refresh_token.as_deref(), Some("refresh-token"));
    }

    #[tokio::test]
    async fn tokens_are_encrypted_at_rest() {
        let store = store();
        store.store(&session("s1", "u1")).await.unwrap();

        // Look at the raw repository record
        let raw = store.repo.find_active("s1").await.unwrap().unwrap();
        let stored_access = raw.access_token.unwrap();
        assert_ne!(stored_access, "eyJ.access.token");
        assert!(!stored_access.contains("access"));
    }

    #[tokio::test]
    async fn destroy_deactivates_and_hides() {
        let store = store();
        store.store(&session("s1", "u1")).await.unwrap();

        assert!(store.destroy("s1", "logout").await.unwrap());
        assert!(store.retrieve("s1").await.unwrap().is_none());
        // Second destroy is a no-op
        assert!(!store.destroy("s1", "logout").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_limit_deactivates_oldest_first() {
        let store = store();
        let mut first = session("s1", "u2");
        first.created_at = Utc::now() - chrono::Duration::seconds(100);
        let mut second = session("s2", "u2");
        second.created_at = Utc::now() - chrono::Duration::seconds(50);
        store.store(&first).await.unwrap();
        store.store(&second).await.unwrap();

        // Limit 2 and one incoming: the oldest must make room
        let destroyed = store.enforce_concurrent_limit("u2", 2).await.unwrap();
        assert_eq!(destroyed, vec!["s1".to_string()]);

        let remaining = store.get_user_sessions("u2").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "s2");
    }

    #[tokio::test]
    async fn concurrent_limit_never_admits_more_than_max() {
        let store = store();
        for i in 0..5 {
            let mut s = session(&format!("s{i}"), "u3");
            s.created_at = Utc::now() - chrono::Duration::seconds(100 - i);
            let destroyed = store.enforce_concurrent_limit("u3", 3).await.unwrap();
            store.store(&s).await.unwrap();
            // After each admit, at most 3 active
            let active = store.get_user_sessions("u3").await.unwrap();
            assert!(active.len() <= 3, "over-admitted: {} (destroyed {destroyed:?})", active.len());
        }
    }

    #[tokio::test]
    async fn cleanup_expired_counts() {
        let store = store();
        let mut stale = session("old", "u4");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(10);
        store.store(&stale).await.unwrap();
        store.store(&session("fresh", "u4")).await.unwrap();

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        let remaining = store.get_user_sessions("u4").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "fresh");
    }

    #[tokio::test]
    async fn user_sessions_sorted_by_recent_use() {
        let store = store();
        let mut a = session("a", "u5");
        a.last_accessed_at = Utc::now() - chrono::Duration::seconds(100);
        let mut b = session("b", "u5");
        b.last_accessed_at = Utc::now();
        store.store(&a).await.unwrap();
        store.store(&b).await.unwrap();

        let sessions = store.get_user_sessions("u5").await.unwrap();
        assert_eq!(sessions[0].session_id, "b");
        assert_eq!(sessions[1].session_id, "a");
    }
}
