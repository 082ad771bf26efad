//! PKCE ceremony (RFC 7636): verifier/challenge/state generation, cache
//! binding, and single-use validation.
//!
//! Pairs are stored under `pkce:<sha256(state)[:32]>` so the raw state value
//! never appears as a cache key. A pair becomes unusable after its first
//! successful validation; the cache entry is deleted before the pair is
//! returned.

use std::sync::LazyLock;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheFacade;
use crate::config::PkceConfig;
use crate::{Error, Result};

/// RFC 7636 unreserved characters allowed in a code verifier.
const VERIFIER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

static VERIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-._~]{43,128}$").expect("valid verifier regex"));

/// A generated PKCE pair, bound in cache until validated or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkcePair {
    /// Code verifier (43–128 unreserved characters).
    pub verifier: String,
    /// S256 challenge (base64url of `sha256(verifier)`).
    pub challenge: String,
    /// Challenge method; always `S256`.
    pub method: String,
    /// CSRF state (256-bit random, base64url).
    pub state: String,
    /// User this handshake belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// OAuth client id, when pinned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Opaque handshake session id.
    pub session_id: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

impl PkcePair {
    /// Whether the pair is past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Options for [`PkceManager::generate_pair`].
#[derive(Debug, Clone, Default)]
pub struct PkceOptions {
    /// Associate the pair with a user.
    pub user_id: Option<String>,
    /// Pin the pair to an OAuth client.
    pub client_id: Option<String>,
}

/// Outcome of [`PkceManager::validate`].
#[derive(Debug)]
pub struct PkceValidation {
    /// Whether the `(state, verifier)` pair checked out.
    pub valid: bool,
    /// The consumed pair on success.
    pub pair: Option<PkcePair>,
    /// OAuth error code on failure (`invalid_grant` / `invalid_request`).
    pub error_code: Option<&'static str>,
}

impl PkceValidation {
    fn failure(error_code: &'static str) -> Self {
        Self {
            valid: false,
            pair: None,
            error_code: Some(error_code),
        }
    }
}

/// Generates and validates PKCE pairs.
pub struct PkceManager {
    cache: CacheFacade,
    config: PkceConfig,
}

impl PkceManager {
    /// Create a manager over the shared cache.
    #[must_use]
    pub fn new(cache: CacheFacade, config: PkceConfig) -> Self {
        Self { cache, config }
    }

    /// Generate a verifier/challenge/state triple and bind it in cache.
    pub async fn generate_pair(&self, options: PkceOptions) -> Result<PkcePair> {
        let verifier = generate_verifier(self.config.verifier_length);
        let challenge = compute_challenge(&verifier);
        let state = generate_state();
        let now = Utc::now();
        let ttl_secs =
            i64::try_from(self.config.ttl_secs).map_err(|_| Error::Internal("pkce ttl".into()))?;

        let pair = PkcePair {
            verifier,
            challenge,
            method: "S256".to_string(),
            state: state.clone(),
            user_id: options.user_id.clone(),
            client_id: options.client_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl_secs),
        };

        self.cache
            .set(
                &cache_key(&state),
                &pair,
                std::time::Duration::from_secs(self.config.ttl_secs),
            )
            .await;

        if let Some(user_id) = &options.user_id {
            self.note_pending(user_id).await;
        }

        debug!(session = %crate::error::log_digest(&pair.session_id), "PKCE pair generated");
        Ok(pair)
    }

    /// Validate a `(state, verifier)` pair. Single-use: the cache binding is
    /// deleted on success.
    pub async fn validate(&self, state: &str, verifier: &str) -> PkceValidation {
        if !VERIFIER_RE.is_match(verifier) {
            return PkceValidation::failure("invalid_request");
        }

        let key = cache_key(state);
        let Some(pair) = self.cache.get::<PkcePair>(&key).await else {
            debug!("PKCE validation failed: unknown or expired state");
            return PkceValidation::failure("invalid_grant");
        };

        if pair.is_expired() {
            self.cache.invalidate(&key).await;
            return PkceValidation::failure("invalid_grant");
        }

        let expected = compute_challenge(verifier);
        let matches: bool = expected
            .as_bytes()
            .ct_eq(pair.challenge.as_bytes())
            .into();
        if !matches {
            warn!(
                session = %crate::error::log_digest(&pair.session_id),
                "PKCE challenge mismatch"
            );
            return PkceValidation::failure("invalid_grant");
        }

        // Consume before returning: a replayed state must not validate twice
        self.cache.invalidate(&key).await;

        PkceValidation {
            valid: true,
            pair: Some(pair),
            error_code: None,
        }
    }

    /// Append `code_challenge`, `code_challenge_method` and `state` (plus
    /// caller extras) to an authorization endpoint URL.
    pub fn authorization_url(
        &self,
        authorization_endpoint: &str,
        pair: &PkcePair,
        extra: &[(&str, &str)],
    ) -> Result<String> {
        let mut url = Url::parse(authorization_endpoint)
            .map_err(|e| Error::InvalidRequest(format!("authorization endpoint: {e}")))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("code_challenge", &pair.challenge);
            params.append_pair("code_challenge_method", &pair.method);
            params.append_pair("state", &pair.state);
            for (name, value) in extra {
                params.append_pair(name, value);
            }
        }
        Ok(url.to_string())
    }

    /// Soft per-user concurrency check: counted and logged, never enforced.
    async fn note_pending(&self, user_id: &str) {
        let key = format!("pkce:pending:{user_id}");
        match self
            .cache
            .store()
            .incr_with_expire(&key, std::time::Duration::from_secs(self.config.ttl_secs))
            .await
        {
            Ok(pending) if pending > i64::from(self.config.max_pending_per_user) => {
                warn!(
                    user = %crate::error::log_digest(user_id),
                    pending,
                    limit = self.config.max_pending_per_user,
                    "User exceeds pending PKCE handshake soft limit"
                );
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Pending PKCE counter unavailable"),
        }
    }
}

/// Random verifier of `length` characters from the RFC 7636 charset.
fn generate_verifier(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..VERIFIER_CHARSET.len());
            char::from(VERIFIER_CHARSET[idx])
        })
        .collect()
}

/// S256 challenge: base64url of `sha256(verifier)`.
fn compute_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// 256-bit random state, base64url.
fn generate_state() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Cache key: the state is hashed so it never appears verbatim in the store.
fn cache_key(state: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(state.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("pkce:{}", &digest[..32])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryStore;

    fn manager() -> PkceManager {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
        PkceManager::new(cache, PkceConfig::default())
    }

    #[test]
    fn verifier_has_configured_length_and_charset() {
        let verifier = generate_verifier(128);
        assert_eq!(verifier.len(), 128);
        assert!(VERIFIER_RE.is_match(&verifier));
    }

    #[test]
    fn challenge_is_s256_of_verifier() {
        let verifier = generate_verifier(64);
        let challenge = compute_challenge(&verifier);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        assert_eq!(challenge, URL_SAFE_NO_PAD.encode(hasher.finalize()));
    }

    #[test]
    fn states_are_unique_and_base64url() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert!(a.len() >= 43);
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
    }

    #[tokio::test]
    async fn round_trip_validates_once() {
        let mgr = manager();
        let pair = mgr.generate_pair(PkceOptions::default()).await.unwrap();

        // First validation succeeds and consumes the pair
        let first = mgr.validate(&pair.state, &pair.verifier).await;
        assert!(first.valid);
        assert_eq!(first.pair.unwrap().session_id, pair.session_id);

        // Second validation with the same state fails single-use
        let second = mgr.validate(&pair.state, &pair.verifier).await;
        assert!(!second.valid);
        assert_eq!(second.error_code, Some("invalid_grant"));
    }

    #[tokio::test]
    async fn wrong_verifier_is_invalid_grant() {
        let mgr = manager();
        let pair = mgr.generate_pair(PkceOptions::default()).await.unwrap();
        let other = generate_verifier(128);

        let result = mgr.validate(&pair.state, &other).await;
        assert!(!result.valid);
        assert_eq!(result.error_code, Some("invalid_grant"));
    }

    #[tokio::test]
    async fn malformed_verifier_is_invalid_request() {
        let mgr = manager();
        let pair = mgr.generate_pair(PkceOptions::default()).await.unwrap();

        // Too short
        let result = mgr.validate(&pair.state, "short").await;
        assert_eq!(result.error_code, Some("invalid_request"));

        // Illegal character
        let bad = format!("{}!", generate_verifier(60));
        let result = mgr.validate(&pair.state, &bad).await;
        assert_eq!(result.error_code, Some("invalid_request"));
    }

    #[tokio::test]
    async fn unknown_state_is_invalid_grant() {
        let mgr = manager();
        let result = mgr.validate("nonexistent-state", &generate_verifier(43)).await;
        assert!(!result.valid);
        assert_eq!(result.error_code, Some("invalid_grant"));
    }

    #[tokio::test]
    async fn authorization_url_carries_pkce_params() {
        let mgr = manager();
        let pair = mgr.generate_pair(PkceOptions::default()).await.unwrap();

        let url = mgr
            .authorization_url(
                "https://id.example.com/auth",
                &pair,
                &[("client_id", "gw"), ("redirect_uri", "https://app/cb")],
            )
            .unwrap();

        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("state="));
        assert!(url.contains("client_id=gw"));
    }

    #[tokio::test]
    async fn pair_binds_user_id() {
        let mgr = manager();
        let pair = mgr
            .generate_pair(PkceOptions {
                user_id: Some("u3".to_string()),
                client_id: None,
            })
            .await
            .unwrap();
        assert_eq!(pair.user_id.as_deref(), Some("u3"));
        assert_eq!(pair.method, "S256");
    }
}
