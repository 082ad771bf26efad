//! Long-lived API key credentials: issuance, validation, revocation.
//!
//! Plaintext keys are returned exactly once at creation and never stored;
//! at rest only an Argon2id hash and a short preview survive. Validation
//! scans the candidate rows and verifies each hash (acceptable because the
//! active set is policy-bounded) and caches successes under a hashed key.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordVerifier, Version,
    password_hash::{PasswordHasher as _, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::config::{ApiKeyConfig, SecurityConfig};
use crate::error::log_digest;
use crate::{Error, Result};

/// Validation-result cache TTL.
const VALIDATION_TTL: Duration = Duration::from_secs(300);

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-._~]{20,128}$").expect("valid key regex"));

/// One API key row, hash included (scrubbed before leaving the manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Key id.
    pub id: uuid::Uuid,
    /// Display name.
    pub name: String,
    /// Argon2id hash of the plaintext key.
    pub key_hash: String,
    /// `first8...last4` preview for listings.
    pub key_preview: String,
    /// Owning user.
    pub user_id: String,
    /// Optional store scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    /// Permission strings.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Scope strings.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Last successful validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Successful validations so far.
    pub usage_count: i64,
    /// Whether the key is live.
    pub is_active: bool,
    /// Optional expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last update instant.
    pub updated_at: DateTime<Utc>,
    /// Revocation instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Who revoked the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<String>,
    /// Open metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ApiKey {
    /// Copy with the hash scrubbed; the only shape callers may expose.
    #[must_use]
    pub fn scrubbed(&self) -> Self {
        Self {
            key_hash: String::new(),
            ..self.clone()
        }
    }
}

/// Result of a successful generation: the plaintext appears here and
/// nowhere else, ever.
#[derive(Debug)]
pub struct GeneratedKey {
    /// The plaintext API key. Shown once.
    pub api_key: String,
    /// The stored row (hash scrubbed).
    pub key_data: ApiKey,
}

/// Options for [`ApiKeyManager::generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Display name.
    pub name: String,
    /// Owning user.
    pub user_id: String,
    /// Optional store scope.
    pub store_id: Option<String>,
    /// Permissions granted to the key.
    pub permissions: Vec<String>,
    /// Scopes; defaults to the configured default scopes when empty.
    pub scopes: Vec<String>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Trait abstracting API key persistence.
#[async_trait]
pub trait ApiKeyRepository: Send + Sync + 'static {
    /// Insert a new key row.
    async fn insert(&self, key: &ApiKey) -> Result<()>;

    /// Rows that could match a presented plaintext: active, unexpired,
    /// not revoked.
    async fn find_candidates(&self) -> Result<Vec<ApiKey>>;

    /// Record a successful validation (`usage_count`, `last_used_at`).
    async fn record_usage(&self, id: uuid::Uuid) -> Result<()>;

    /// Revoke a key.
    async fn revoke(&self, id: uuid::Uuid, revoked_by: &str, reason: Option<&str>) -> Result<bool>;

    /// All keys belonging to `user_id`.
    async fn find_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;
}

// ── Postgres implementation ───────────────────────────────────────────────────

/// Row shape for `api_keys`.
#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: uuid::Uuid,
    name: String,
    key_hash: String,
    key_preview: String,
    user_id: String,
    store_id: Option<String>,
    permissions: serde_json::Value,
    scopes: Vec<String>,
    last_used_at: Option<DateTime<Utc>>,
    usage_count: i32,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_by: Option<String>,
    metadata: serde_json::Value,
}

impl ApiKeyRow {
    fn into_key(self) -> ApiKey {
        ApiKey {
            id: self.id,
            name: self.name,
            key_hash: self.key_hash,
            key_preview: self.key_preview,
            user_id: self.user_id,
            store_id: self.store_id,
            permissions: serde_json::from_value(self.permissions).unwrap_or_default(),
            scopes: self.scopes,
            last_used_at: self.last_used_at,
            usage_count: i64::from(self.usage_count),
            is_active: self.is_active,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            revoked_at: self.revoked_at,
            revoked_by: self.revoked_by,
            metadata: match self.metadata {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        }
    }
}

const API_KEY_COLUMNS: &str = "id, name, key_hash, key_preview, user_id, store_id, permissions, \
     scopes, last_used_at, usage_count, is_active, expires_at, created_at, updated_at, \
     revoked_at, revoked_by, metadata";

/// Postgres-backed [`ApiKeyRepository`].
pub struct PgApiKeyRepository {
    pool: PgPool,
}

impl PgApiKeyRepository {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn insert(&self, key: &ApiKey) -> Result<()> {
        let sql = "INSERT INTO api_keys (id, name, key_hash, key_preview, user_id, store_id, \
             permissions, scopes, last_used_at, usage_count, is_active, expires_at, \
             created_at, updated_at, revoked_at, revoked_by, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, 0, TRUE, $9, NOW(), NOW(), NULL, NULL, $10)";
        sqlx::query(sql)
            .bind(key.id)
            .bind(&key.name)
            .bind(&key.key_hash)
            .bind(&key.key_preview)
            .bind(&key.user_id)
            .bind(&key.store_id)
            .bind(serde_json::to_value(&key.permissions)?)
            .bind(&key.scopes)
            .bind(key.expires_at)
            .bind(serde_json::Value::Object(key.metadata.clone()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_candidates(&self) -> Result<Vec<ApiKey>> {
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys \
             WHERE is_active = TRUE AND revoked_at IS NULL \
               AND (expires_at IS NULL OR expires_at > NOW())"
        );
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ApiKeyRow::into_key).collect())
    }

    async fn record_usage(&self, id: uuid::Uuid) -> Result<()> {
        let sql = "UPDATE api_keys SET usage_count = usage_count + 1, last_used_at = NOW(), \
             updated_at = NOW() WHERE id = $1";
        sqlx::query(sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn revoke(&self, id: uuid::Uuid, revoked_by: &str, reason: Option<&str>) -> Result<bool> {
        let sql = "UPDATE api_keys SET is_active = FALSE, revoked_at = NOW(), revoked_by = $2, \
             updated_at = NOW(), \
             metadata = metadata || jsonb_build_object('revocation_reason', $3::text) \
             WHERE id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(sql)
            .bind(id)
            .bind(revoked_by)
            .bind(reason.unwrap_or("unspecified"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        let sql = format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ApiKeyRow::into_key).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// In-memory [`ApiKeyRepository`] for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryApiKeyRepository {
    keys: DashMap<uuid::Uuid, ApiKey>,
}

impl MemoryApiKeyRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyRepository {
    async fn insert(&self, key: &ApiKey) -> Result<()> {
        self.keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn find_candidates(&self) -> Result<Vec<ApiKey>> {
        let now = Utc::now();
        Ok(self
            .keys
            .iter()
            .filter(|k| {
                k.is_active
                    && k.revoked_at.is_none()
                    && k.expires_at.is_none_or(|exp| exp > now)
            })
            .map(|k| k.clone())
            .collect())
    }

    async fn record_usage(&self, id: uuid::Uuid) -> Result<()> {
        if let Some(mut key) = self.keys.get_mut(&id) {
            key.usage_count += 1;
            key.last_used_at = Some(Utc::now());
            key.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn revoke(&self, id: uuid::Uuid, revoked_by: &str, reason: Option<&str>) -> Result<bool> {
        if let Some(mut key) = self.keys.get_mut(&id) {
            if key.revoked_at.is_some() {
                return Ok(false);
            }
            key.is_active = false;
            key.revoked_at = Some(Utc::now());
            key.revoked_by = Some(revoked_by.to_string());
            key.updated_at = Utc::now();
            key.metadata.insert(
                "revocation_reason".to_string(),
                serde_json::Value::String(reason.unwrap_or("unspecified").to_string()),
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn find_by_user(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Principal summary attached after API key validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyIdentity {
    /// Key id.
    pub key_id: uuid::Uuid,
    /// Owning user.
    pub user_id: String,
    /// Permissions granted to the key.
    pub permissions: Vec<String>,
    /// Scopes granted to the key.
    pub scopes: Vec<String>,
    /// Optional store scope.
    pub store_id: Option<String>,
}

/// Issues, validates and revokes API keys.
pub struct ApiKeyManager {
    repo: Arc<dyn ApiKeyRepository>,
    cache: CacheFacade,
    hasher: Argon2<'static>,
    config: ApiKeyConfig,
}

impl ApiKeyManager {
    /// Create a manager over a repository.
    #[must_use]
    pub fn new(
        repo: Arc<dyn ApiKeyRepository>,
        cache: CacheFacade,
        config: ApiKeyConfig,
        security: &SecurityConfig,
    ) -> Self {
        let params = Params::new(
            security.api_key_hash_memory_kib,
            security.api_key_hash_rounds,
            4,
            None,
        )
        .unwrap_or_default();
        Self {
            repo,
            cache,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            config,
        }
    }

    /// Generate a new key. The plaintext is observable exactly once, in the
    /// returned [`GeneratedKey`].
    pub async fn generate(&self, opts: GenerateOptions) -> Result<GeneratedKey> {
        let random: [u8; 32] = rand::rng().random();
        let plaintext = format!("{}_{}", self.config.prefix, URL_SAFE_NO_PAD.encode(random));

        let salt = SaltString::generate(&mut OsRng);
        let key_hash = self
            .hasher
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("key hashing failed: {e}")))?
            .to_string();

        let preview = format!(
            "{}...{}",
            &plaintext[..8.min(plaintext.len())],
            &plaintext[plaintext.len().saturating_sub(4)..]
        );

        let now = Utc::now();
        let key = ApiKey {
            id: uuid::Uuid::new_v4(),
            name: opts.name,
            key_hash,
            key_preview: preview,
            user_id: opts.user_id,
            store_id: opts.store_id,
            permissions: opts.permissions,
            scopes: if opts.scopes.is_empty() {
                self.config.default_scopes.clone()
            } else {
                opts.scopes
            },
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            expires_at: opts.expires_at,
            created_at: now,
            updated_at: now,
            revoked_at: None,
            revoked_by: None,
            metadata: serde_json::Map::new(),
        };

        self.repo.insert(&key).await?;
        info!(key_id = %key.id, user = %log_digest(&key.user_id), "API key issued");

        Ok(GeneratedKey {
            api_key: plaintext,
            key_data: key.scrubbed(),
        })
    }

    /// Validate a presented plaintext key.
    ///
    /// Successful validations are cached for five minutes under a hashed
    /// key; the plaintext never appears in the cache either.
    pub async fn validate(&self, plaintext: &str) -> Result<ApiKeyIdentity> {
        if !KEY_RE.is_match(plaintext)
            || !plaintext.starts_with(&format!("{}_", self.config.prefix))
        {
            return Err(Error::Unauthorized("malformed API key".into()));
        }

        let cache_key = format!("api_key_validation:{}", plaintext_hash(plaintext));
        if let Some(identity) = self.cache.get::<ApiKeyIdentity>(&cache_key).await {
            return Ok(identity);
        }

        let candidates = self.repo.find_candidates().await?;
        for candidate in candidates {
            let Ok(parsed) = PasswordHash::new(&candidate.key_hash) else {
                warn!(key_id = %candidate.id, "Skipping API key with unparseable hash");
                continue;
            };
            if self
                .hasher
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok()
            {
                self.repo.record_usage(candidate.id).await?;
                let identity = ApiKeyIdentity {
                    key_id: candidate.id,
                    user_id: candidate.user_id.clone(),
                    permissions: candidate.permissions.clone(),
                    scopes: candidate.scopes.clone(),
                    store_id: candidate.store_id.clone(),
                };
                self.cache.set(&cache_key, &identity, VALIDATION_TTL).await;
                debug!(key_id = %candidate.id, "API key validated");
                return Ok(identity);
            }
        }

        Err(Error::Unauthorized("unknown API key".into()))
    }

    /// Revoke a key. The validation cache entry (if any) dies with its TTL;
    /// revocation takes effect immediately for uncached validations.
    pub async fn revoke(
        &self,
        id: uuid::Uuid,
        revoked_by: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let revoked = self.repo.revoke(id, revoked_by, reason).await?;
        if revoked {
            info!(key_id = %id, "API key revoked");
        }
        Ok(revoked)
    }

    /// List a user's keys, hashes scrubbed.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        let keys = self.repo.find_by_user(user_id).await?;
        Ok(keys.iter().map(ApiKey::scrubbed).collect())
    }

    /// Repository health plus a stats summary.
    pub async fn health_check(&self) -> Result<serde_json::Value> {
        self.repo.ping().await?;
        Ok(serde_json::json!({ "status": "ok" }))
    }
}

impl std::fmt::Debug for ApiKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyManager")
            .field("prefix", &self.config.prefix)
            .finish_non_exhaustive()
    }
}

/// First 16 hex chars of `sha256(plaintext)`.
fn plaintext_hash(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}
