//! Configuration management
//!
//! The envelope is loaded from a YAML file overlaid with `AUTHGATE_*`
//! environment variables. Every section has serde defaults so a minimal file
//! (IdP coordinates plus database/cache URLs) is enough to boot.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Identity provider coordinates.
    pub idp: IdpConfig,
    /// JWT validation settings.
    pub jwt: JwtConfig,
    /// Cache tier settings.
    pub cache: CacheConfig,
    /// Relational store settings.
    pub database: DatabaseConfig,
    /// Session lifecycle settings.
    pub session: SessionConfig,
    /// At-rest encryption settings.
    pub encryption: EncryptionConfig,
    /// Security toggles.
    pub security: SecurityConfig,
    /// PKCE ceremony settings.
    pub pkce: PkceConfig,
    /// Refresh scheduling settings.
    pub refresh: RefreshConfig,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Middleware chain resilience settings.
    pub middleware: MiddlewareConfig,
    /// API key issuance settings.
    pub api_keys: ApiKeyConfig,
}

/// Identity provider (OIDC) coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Base URL of the IdP (e.g. `https://id.example.com`).
    pub server_url: String,
    /// Realm selected at startup.
    pub realm: String,
    /// OAuth client id this gateway authenticates as.
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME` indirection).
    pub client_secret: Option<String>,
    /// Scopes requested on token grants.
    pub scopes: Vec<String>,
    /// Deadline for IdP endpoints.
    pub timeout_secs: u64,
    /// Deadline for the introspection endpoint (shorter; it sits on hot paths).
    pub introspection_timeout_secs: u64,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            realm: "master".to_string(),
            client_id: String::new(),
            client_secret: None,
            scopes: vec!["openid".to_string(), "profile".to_string()],
            timeout_secs: 5,
            introspection_timeout_secs: 2,
        }
    }
}

impl IdpConfig {
    /// Resolve the client secret (expand `env:VAR_NAME` indirection).
    #[must_use]
    pub fn resolve_client_secret(&self) -> Option<String> {
        self.client_secret.as_ref().map(|secret| {
            if let Some(var_name) = secret.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| secret.clone())
            } else {
                secret.clone()
            }
        })
    }

    /// Realm-scoped discovery URL.
    #[must_use]
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/realms/{}/.well-known/openid-configuration",
            self.server_url.trim_end_matches('/'),
            self.realm
        )
    }

    /// Deadline for general IdP endpoints.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Deadline for the introspection endpoint.
    #[must_use]
    pub fn introspection_timeout(&self) -> Duration {
        Duration::from_secs(self.introspection_timeout_secs)
    }
}

/// JWT validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Expected `iss` claim.
    pub issuer: String,
    /// Expected `aud` claim.
    pub audience: String,
    /// Explicit JWKS URL; derived from discovery when absent.
    pub jwks_url: Option<String>,
    /// Clock skew tolerance in seconds.
    pub clock_tolerance_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            jwks_url: None,
            clock_tolerance_secs: 60,
        }
    }
}

/// Cache tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the shared cache tier (validation results degrade to direct
    /// computation when disabled).
    pub enabled: bool,
    /// Redis connection URL.
    pub url: String,
    /// Per-kind TTLs in seconds.
    pub ttl: CacheTtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://127.0.0.1:6379".to_string(),
            ttl: CacheTtlConfig::default(),
        }
    }
}

/// Per-kind cache TTLs, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// Cached JWT validation results.
    pub jwt: u64,
    /// Cached introspection results.
    pub introspect: u64,
    /// Cached API key validations.
    pub api_key: u64,
    /// Cached session validation results.
    pub session: u64,
    /// Cached userinfo documents.
    pub user_info: u64,
    /// Cached RBAC decisions and abilities.
    pub rbac: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            jwt: 300,
            introspect: 60,
            api_key: 300,
            session: 60,
            user_info: 300,
            rbac: 300,
        }
    }
}

/// Relational store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres connection URL (supports `env:VAR_NAME`).
    pub url: String,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the database URL (expand `env:VAR_NAME` indirection).
    #[must_use]
    pub fn resolve_url(&self) -> String {
        if let Some(var_name) = self.url.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.url.clone())
        } else {
            self.url.clone()
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum active sessions per user; oldest are evicted atomically.
    pub max_concurrent_sessions: u32,
    /// Hard cap on session lifetime in seconds.
    pub max_age_secs: u64,
    /// Seconds after which `validate` flags the session for rotation.
    pub rotation_interval_secs: u64,
    /// Reject sessions whose caller IP differs from the creating IP.
    pub enforce_ip_consistency: bool,
    /// Log (but do not reject) user-agent changes.
    pub enforce_user_agent_consistency: bool,
    /// Encrypt stored tokens. Disabling is ignored with a warning; new
    /// writes are always encrypted.
    pub token_encryption: bool,
    /// Tolerate legacy plaintext tokens on read during migration.
    pub allow_legacy_plaintext: bool,
    /// Minimum seconds between `last_accessed_at` writes.
    pub touch_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            max_age_secs: 8 * 3600,
            rotation_interval_secs: 3600,
            enforce_ip_consistency: false,
            enforce_user_agent_consistency: false,
            token_encryption: true,
            allow_legacy_plaintext: false,
            touch_interval_secs: 60,
        }
    }
}

/// At-rest encryption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Base64url master key. Generated at startup (and logged as such) when
    /// absent; sessions then do not survive restarts.
    pub key: Option<String>,
    /// PBKDF2 iteration count for per-encryption key derivation.
    pub key_derivation_iterations: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_derivation_iterations: 1_000,
        }
    }
}

/// Security toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Compare secrets in constant time.
    pub constant_time_comparison: bool,
    /// Argon2 memory cost (KiB) for API key hashing.
    pub api_key_hash_memory_kib: u32,
    /// Argon2 iteration count for API key hashing.
    pub api_key_hash_rounds: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            constant_time_comparison: true,
            api_key_hash_memory_kib: 64 * 1024,
            api_key_hash_rounds: 3,
        }
    }
}

/// PKCE ceremony settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkceConfig {
    /// Code verifier length (43–128).
    pub verifier_length: usize,
    /// Pair lifetime in seconds.
    pub ttl_secs: u64,
    /// Soft cap on concurrent pending pairs per user (logged only).
    pub max_pending_per_user: u32,
}

impl Default for PkceConfig {
    fn default() -> Self {
        Self {
            verifier_length: 128,
            ttl_secs: 600,
            max_pending_per_user: 10,
        }
    }
}

/// Refresh scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Period of the proactive refresh scan in seconds.
    pub cleanup_interval_secs: u64,
    /// Refresh tokens whose remaining access TTL is below this many seconds.
    pub refresh_buffer_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 300,
            refresh_buffer_secs: 300,
        }
    }
}

/// Rate limiter settings, shared by the request and stream variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,
    /// Key namespace prefix.
    pub prefix: String,
    /// Sliding window size in milliseconds.
    pub window_ms: u64,
    /// Maximum requests per window.
    pub max_requests: u64,
    /// Emit `X-RateLimit-*` headers on the request protocol.
    pub standard_headers: bool,
    /// Do not count requests whose handler succeeded.
    pub skip_successful_requests: bool,
    /// Do not count requests whose handler failed.
    pub skip_failed_requests: bool,
    /// Stream-specific limits.
    pub stream: StreamRateLimitConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "rate_limit".to_string(),
            window_ms: 60_000,
            max_requests: 100,
            standard_headers: true,
            skip_successful_requests: false,
            skip_failed_requests: false,
            stream: StreamRateLimitConfig::default(),
        }
    }
}

/// Stream-protocol rate limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRateLimitConfig {
    /// Maximum concurrent connections per bucket.
    pub max_connections: u64,
    /// Maximum inbound messages per minute per bucket.
    pub max_messages_per_minute: u64,
    /// Maximum inbound messages per hour per bucket.
    pub max_messages_per_hour: u64,
    /// Retry-After hint on connection rejection, in seconds.
    pub connection_retry_after_secs: u64,
}

impl Default for StreamRateLimitConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_messages_per_minute: 120,
            max_messages_per_hour: 3_600,
            connection_retry_after_secs: 300,
        }
    }
}

/// Middleware chain resilience settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Per-middleware circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Per-middleware retry policy.
    pub retry: RetryConfig,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable the breaker.
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successes in half-open before the circuit closes.
    pub success_threshold: u32,
    /// Seconds the circuit stays open before a half-open probe.
    pub reset_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    /// Reset timeout as a [`Duration`].
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,
    /// Maximum attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Initial backoff as a [`Duration`].
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff cap as a [`Duration`].
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// API key issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Plaintext key prefix (greppable, secret-scanner friendly).
    pub prefix: String,
    /// Default scopes granted to new keys.
    pub default_scopes: Vec<String>,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            prefix: "ak".to_string(),
            default_scopes: vec!["read".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from a YAML file overlaid with `AUTHGATE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when the file cannot be parsed or
    /// required fields are missing after the overlay.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("AUTHGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::InvalidRequest(format!("configuration: {e}")))?;

        config.load_env_files();
        config.validate()?;
        Ok(config)
    }

    /// Load declared env files into the process environment.
    fn load_env_files(&self) {
        for file in &self.env_files {
            if let Err(e) = dotenvy::from_path(file) {
                tracing::warn!(file = %file, error = %e, "Failed to load env file");
            }
        }
    }

    /// Validate cross-field constraints the type system cannot express.
    fn validate(&self) -> Result<()> {
        if self.idp.server_url.is_empty() {
            return Err(Error::InvalidRequest("idp.server_url is required".into()));
        }
        if self.idp.client_id.is_empty() {
            return Err(Error::InvalidRequest("idp.client_id is required".into()));
        }
        if !(43..=128).contains(&self.pkce.verifier_length) {
            return Err(Error::InvalidRequest(
                "pkce.verifier_length must be within 43..=128".into(),
            ));
        }
        if self.session.max_concurrent_sessions == 0 {
            return Err(Error::InvalidRequest(
                "session.max_concurrent_sessions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.cache.ttl.jwt, 300);
        assert_eq!(config.cache.ttl.introspect, 60);
        assert_eq!(config.pkce.verifier_length, 128);
        assert_eq!(config.pkce.ttl_secs, 600);
        assert_eq!(config.refresh.refresh_buffer_secs, 300);
        assert_eq!(config.middleware.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.middleware.retry.initial_backoff_ms, 100);
        assert_eq!(config.rate_limit.prefix, "rate_limit");
        assert!(config.session.token_encryption);
    }

    #[test]
    fn client_secret_env_indirection_falls_back_when_unset() {
        let idp = IdpConfig {
            client_secret: Some("env:AUTHGATE_DOES_NOT_EXIST".to_string()),
            ..IdpConfig::default()
        };
        // Unset variable: the raw value is kept rather than silently dropped
        assert_eq!(
            idp.resolve_client_secret().as_deref(),
            Some("env:AUTHGATE_DOES_NOT_EXIST")
        );
    }

    #[test]
    fn client_secret_literal_passthrough() {
        let idp = IdpConfig {
            client_secret: Some("plain".to_string()),
            ..IdpConfig::default()
        };
        assert_eq!(idp.resolve_client_secret().as_deref(), Some("plain"));
    }

    #[test]
    fn discovery_url_is_realm_scoped() {
        let idp = IdpConfig {
            server_url: "https://id.example.com/".to_string(),
            realm: "acme".to_string(),
            ..IdpConfig::default()
        };
        assert_eq!(
            idp.discovery_url(),
            "https://id.example.com/realms/acme/.well-known/openid-configuration"
        );
    }

    #[test]
    fn validation_rejects_out_of_range_verifier_length() {
        let config = Config {
            idp: IdpConfig {
                server_url: "https://id.example.com".to_string(),
                client_id: "gw".to_string(),
                ..IdpConfig::default()
            },
            pkce: PkceConfig {
                verifier_length: 42,
                ..PkceConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_idp_coordinates() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
