//! JWT validation against the IdP's JWKS.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Look the key up in the JWKS cache; on miss, refresh once (rate-limited
//!    so a flood of unknown `kid`s cannot hammer the IdP).
//! 3. Verify the signature and `exp`/`nbf`/`iat` within the configured skew.
//! 4. Check `iss` and `aud` (single string or array) manually.
//! 5. Assemble a [`Principal`] from the claims.
//!
//! The JWKS refresh is single-flight: one task fetches while concurrent
//! missers await the same refresh.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::JwtConfig;
use crate::principal::{AuthMethod, AuthResult, IdpClaims};

/// JWKS cache TTL.
const JWKS_TTL: Duration = Duration::from_secs(600);

/// Minimum spacing between forced (unknown-`kid`) refreshes.
const FORCED_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Error variants for JWT validation failures.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    /// The token is not three base64url parts or the payload is garbage.
    #[error("malformed token")]
    Malformed,

    /// Signature verification failed.
    #[error("invalid signature")]
    SignatureInvalid,

    /// The token is expired (or not yet valid) beyond the allowed skew.
    #[error("token expired")]
    Expired,

    /// The `iss` claim does not match the configured issuer.
    #[error("issuer mismatch")]
    IssuerInvalid,

    /// The `aud` claim does not contain the configured audience.
    #[error("audience mismatch")]
    AudienceInvalid,

    /// The JWKS could not be fetched or contains no usable key.
    #[error("JWKS unavailable: {0}")]
    JwksUnavailable(String),
}

impl JwtError {
    /// Stable error code for logs and counters.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "token_malformed",
            Self::SignatureInvalid => "token_signature_invalid",
            Self::Expired => "token_expired",
            Self::IssuerInvalid => "token_issuer_invalid",
            Self::AudienceInvalid => "token_audience_invalid",
            Self::JwksUnavailable(_) => "jwks_unavailable",
        }
    }
}

impl From<JwtError> for crate::Error {
    fn from(e: JwtError) -> Self {
        match e {
            JwtError::Expired => Self::TokenExpired,
            JwtError::JwksUnavailable(msg) => Self::UpstreamUnavailable(msg),
            other => Self::TokenInvalid(other.code().to_string()),
        }
    }
}

/// Cached JWKS with fetch bookkeeping.
struct CachedJwks {
    keys: DashMap<String, (DecodingKey, Algorithm)>,
    fetched_at: RwLock<Option<Instant>>,
    last_forced: RwLock<Option<Instant>>,
}

/// Validates IdP-issued JWTs.
pub struct JwtValidator {
    jwks_url: RwLock<String>,
    issuer: String,
    audience: String,
    leeway_secs: u64,
    http: reqwest::Client,
    cache: CachedJwks,
    /// Serializes refreshes: only one in-flight fetch per validator.
    refresh_lock: Mutex<()>,
}

impl JwtValidator {
    /// Create a validator for one JWKS endpoint.
    #[must_use]
    pub fn new(config: &JwtConfig, jwks_url: String, http: reqwest::Client) -> Self {
        Self {
            jwks_url: RwLock::new(jwks_url),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            leeway_secs: config.clock_tolerance_secs,
            http,
            cache: CachedJwks {
                keys: DashMap::new(),
                fetched_at: RwLock::new(None),
                last_forced: RwLock::new(None),
            },
            refresh_lock: Mutex::new(()),
        }
    }

    /// Point the validator at a (discovered) JWKS URL.
    pub fn set_jwks_url(&self, url: String) {
        *self.jwks_url.write() = url;
    }

    /// Warm the JWKS cache. Called at startup so the first request does not
    /// pay the fetch.
    pub async fn warm(&self) -> Result<(), JwtError> {
        self.refresh_jwks().await
    }

    /// Validate `token` and produce an [`AuthResult`].
    pub async fn validate(&self, token: &str) -> Result<AuthResult, JwtError> {
        let header = jsonwebtoken::decode_header(token).map_err(|_| JwtError::Malformed)?;
        let kid = header.kid.ok_or(JwtError::Malformed)?;

        let (key, alg) = self.find_key(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = self.leeway_secs;
        validation.validate_nbf = true;
        // Audience is matched manually below: the claim may be a string or
        // an array, and we want a distinct error code.
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);

        let token_data = jsonwebtoken::decode::<IdpClaims>(token, &key, &validation)
            .map_err(|e| map_jwt_error(&e))?;
        let claims = token_data.claims;

        if !self.audience.is_empty() && !audience_matches(&claims.aud, &self.audience) {
            return Err(JwtError::AudienceInvalid);
        }

        let expires_at = chrono::DateTime::from_timestamp(
            i64::try_from(claims.exp).map_err(|_| JwtError::Malformed)?,
            0,
        );

        Ok(AuthResult {
            principal: claims.to_principal(),
            method: AuthMethod::Jwt,
            expires_at,
            scopes: claims.scopes(),
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS if needed.
    async fn find_key(&self, kid: &str) -> Result<(DecodingKey, Algorithm), JwtError> {
        if self.cache_is_fresh() {
            if let Some(entry) = self.cache.keys.get(kid) {
                return Ok(entry.value().clone());
            }
        }

        // Stale cache or unknown kid: refresh, rate-limited for the
        // unknown-kid case so bad tokens cannot force a fetch storm.
        let stale = !self.cache_is_fresh();
        if stale || self.forced_refresh_allowed() {
            self.refresh_jwks().await?;
        }

        self.cache
            .keys
            .get(kid)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                debug!(kid = %kid, "Key not present after JWKS refresh");
                JwtError::SignatureInvalid
            })
    }

    fn cache_is_fresh(&self) -> bool {
        self.cache
            .fetched_at
            .read()
            .is_some_and(|at| at.elapsed() < JWKS_TTL)
    }

    fn forced_refresh_allowed(&self) -> bool {
        self.cache
            .last_forced
            .read()
            .is_none_or(|at| at.elapsed() >= FORCED_REFRESH_INTERVAL)
    }

    /// Fetch the JWKS and rebuild the key index. Single-flight: concurrent
    /// callers serialize on the lock and the late ones see a fresh cache.
    async fn refresh_jwks(&self) -> Result<(), JwtError> {
        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we waited
        if self
            .cache
            .fetched_at
            .read()
            .is_some_and(|at| at.elapsed() < FORCED_REFRESH_INTERVAL)
        {
            return Ok(());
        }

        let url = self.jwks_url.read().clone();
        debug!(url = %url, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| JwtError::JwksUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| JwtError::JwksUnavailable(e.to_string()))?;

        self.cache.keys.clear();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            let converted = match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                    .ok()
                    .map(|key| (key, Algorithm::RS256)),
                AlgorithmParameters::EllipticCurve(ec) => {
                    DecodingKey::from_ec_components(&ec.x, &ec.y)
                        .ok()
                        .map(|key| (key, Algorithm::ES256))
                }
                AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
            };
            match converted {
                Some(entry) => {
                    self.cache.keys.insert(kid, entry);
                }
                None => warn!(kid = %kid, "Skipping JWK with unsupported key type"),
            }
        }

        let now = Instant::now();
        *self.cache.fetched_at.write() = Some(now);
        *self.cache.last_forced.write() = Some(now);
        debug!(keys = self.cache.keys.len(), "JWKS cache refreshed");
        Ok(())
    }
}

/// Map `jsonwebtoken` errors to the validator taxonomy.
fn map_jwt_error(e: &jsonwebtoken::errors::Error) -> JwtError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => JwtError::Expired,
        ErrorKind::InvalidSignature => JwtError::SignatureInvalid,
        ErrorKind::InvalidIssuer => JwtError::IssuerInvalid,
        ErrorKind::InvalidAudience => JwtError::AudienceInvalid,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            JwtError::Malformed
        }
        _ => JwtError::SignatureInvalid,
    }
}

/// Whether an `aud` claim (string or array) contains `expected`.
fn audience_matches(aud: &serde_json::Value, expected: &str) -> bool {
    match aud {
        serde_json::Value::String(s) => s == expected,
        serde_json::Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| s == expected)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_matches_string_form() {
        assert!(audience_matches(&serde_json::json!("gateway"), "gateway"));
        assert!(!audience_matches(&serde_json::json!("other"), "gateway"));
    }

    #[test]
    fn audience_matches_array_form() {
        assert!(audience_matches(
            &serde_json::json!(["account", "gateway"]),
            "gateway"
        ));
        assert!(!audience_matches(&serde_json::json!(["account"]), "gateway"));
        assert!(!audience_matches(&serde_json::json!([]), "gateway"));
    }

    #[test]
    fn audience_rejects_other_shapes() {
        assert!(!audience_matches(&serde_json::json!(42), "gateway"));
        assert!(!audience_matches(&serde_json::json!(null), "gateway"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(JwtError::Malformed.code(), "token_malformed");
        assert_eq!(JwtError::SignatureInvalid.code(), "token_signature_invalid");
        assert_eq!(JwtError::Expired.code(), "token_expired");
        assert_eq!(JwtError::IssuerInvalid.code(), "token_issuer_invalid");
        assert_eq!(JwtError::AudienceInvalid.code(), "token_audience_invalid");
        assert_eq!(JwtError::JwksUnavailable("x".into()).code(), "jwks_unavailable");
    }

    #[tokio::test]
    async fn malformed_tokens_fail_before_any_fetch() {
        let validator = JwtValidator::new(
            &JwtConfig {
                issuer: "https://id.example.com/realms/acme".to_string(),
                audience: "gateway".to_string(),
                jwks_url: None,
                clock_tolerance_secs: 60,
            },
            "https://id.invalid/certs".to_string(),
            reqwest::Client::new(),
        );

        assert!(matches!(
            validator.validate("not-a-jwt").await,
            Err(JwtError::Malformed)
        ));
        // Header decodes but has no kid
        assert!(matches!(
            validator.validate("eyJhbGciOiJSUzI1NiJ9.e30.sig").await,
            Err(JwtError::Malformed)
        ));
    }

    #[test]
    fn jwt_error_converts_to_taxonomy() {
        let err: crate::Error = JwtError::Expired.into();
        assert_eq!(err.code(), "token_expired");
        let err: crate::Error = JwtError::AudienceInvalid.into();
        assert_eq!(err.code(), "token_invalid");
        let err: crate::Error = JwtError::JwksUnavailable("down".into()).into();
        assert_eq!(err.code(), "upstream_unavailable");
    }
}
