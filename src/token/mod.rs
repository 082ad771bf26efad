//! Token validation orchestration.
//!
//! [`TokenManager`] fans out to the JWT validator and the introspector,
//! caches successful results under hashed keys, and owns refresh delegation
//! when a [`RefreshTokenManager`] is attached.

mod introspect;
mod jwt;
mod refresh;

pub use introspect::TokenIntrospector;
pub use jwt::{JwtError, JwtValidator};
pub use refresh::{REFRESH_EVENTS_CHANNEL, RefreshEvent, RefreshEventKind, RefreshTokenManager};

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::CacheFacade;
use crate::config::CacheTtlConfig;
use crate::principal::{AuthResult, TokenBundle};
use crate::rbac::permission_matches;
use crate::stats::AuthStats;
use crate::{Error, Result};

/// Unified token validation over JWT and introspection paths.
pub struct TokenManager {
    jwt: Arc<JwtValidator>,
    introspector: Arc<TokenIntrospector>,
    cache: CacheFacade,
    ttl: CacheTtlConfig,
    stats: Arc<AuthStats>,
    refresh: Option<Arc<RefreshTokenManager>>,
}

impl TokenManager {
    /// Create a manager over the two validation paths.
    #[must_use]
    pub fn new(
        jwt: Arc<JwtValidator>,
        introspector: Arc<TokenIntrospector>,
        cache: CacheFacade,
        ttl: CacheTtlConfig,
        stats: Arc<AuthStats>,
    ) -> Self {
        Self {
            jwt,
            introspector,
            cache,
            ttl,
            stats,
            refresh: None,
        }
    }

    /// Attach a refresh manager, enabling the delegation methods.
    #[must_use]
    pub fn with_refresh(mut self, refresh: Arc<RefreshTokenManager>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    /// The attached refresh manager, when present.
    #[must_use]
    pub fn refresh_manager(&self) -> Option<Arc<RefreshTokenManager>> {
        self.refresh.clone()
    }

    /// Validate a JWT, serving from cache when possible.
    pub async fn validate_jwt(&self, token: &str) -> Result<AuthResult> {
        let key = format!("jwt:{}", token_hash(token));
        if let Some(cached) = self.cache.get::<AuthResult>(&key).await {
            self.stats.record_token_cache_hit();
            return Ok(cached);
        }

        match self.jwt.validate(token).await {
            Ok(result) => {
                self.stats.record_validation(true);
                self.cache
                    .set(&key, &result, Duration::from_secs(self.ttl.jwt))
                    .await;
                Ok(result)
            }
            Err(e) => {
                self.stats.record_validation(false);
                debug!(code = e.code(), "JWT validation failed");
                Err(e.into())
            }
        }
    }

    /// Validate an opaque token via introspection, with a shorter cache TTL.
    pub async fn introspect_token(&self, token: &str) -> Result<AuthResult> {
        let key = format!("introspect:{}", token_hash(token));
        if let Some(cached) = self.cache.get::<AuthResult>(&key).await {
            self.stats.record_token_cache_hit();
            return Ok(cached);
        }

        match self.introspector.validate(token).await {
            Ok(result) => {
                self.stats.record_validation(true);
                self.cache
                    .set(&key, &result, Duration::from_secs(self.ttl.introspect))
                    .await;
                Ok(result)
            }
            Err(e) => {
                self.stats.record_validation(false);
                Err(e)
            }
        }
    }

    /// Validate a token, falling back to the other path on failure.
    ///
    /// The JWT path is primary unless `prefer_introspection` is set.
    pub async fn validate_token(
        &self,
        token: &str,
        prefer_introspection: bool,
    ) -> Result<AuthResult> {
        if prefer_introspection {
            match self.introspect_token(token).await {
                Ok(result) => Ok(result),
                Err(primary) => {
                    debug!(error = %primary, "Introspection failed, falling back to JWT path");
                    self.validate_jwt(token).await.map_err(|_| primary)
                }
            }
        } else {
            match self.validate_jwt(token).await {
                Ok(result) => Ok(result),
                Err(primary) => {
                    debug!(error = %primary, "JWT validation failed, falling back to introspection");
                    self.introspect_token(token).await.map_err(|_| primary)
                }
            }
        }
    }

    /// Extract the token from a strict `Bearer <token>` authorization
    /// header. Case-sensitive scheme; surrounding whitespace tolerated;
    /// `None` on any other violation.
    #[must_use]
    pub fn extract_bearer(authorization: &str) -> Option<String> {
        let trimmed = authorization.trim();
        let token = trimmed.strip_prefix("Bearer ")?.trim();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return None;
        }
        Some(token.to_string())
    }

    /// Whether `result` carries `role` (bare names match either the
    /// `realm:` or `client:` origin).
    #[must_use]
    pub fn has_role(result: &AuthResult, role: &str) -> bool {
        result.principal.has_role(role)
    }

    /// Whether `result` grants `resource:action`, honoring wildcards.
    #[must_use]
    pub fn has_permission(result: &AuthResult, required: &str) -> bool {
        let (resource, action) = match required.split_once(':') {
            Some(parts) => parts,
            None => (required, "*"),
        };
        result
            .principal
            .permissions
            .iter()
            .any(|granted| permission_matches(granted, resource, action))
    }

    // ── Refresh delegation ────────────────────────────────────────────────

    /// Store a token bundle for proactive refresh.
    pub async fn store_tokens(
        &self,
        user_id: &str,
        session_id: &str,
        bundle: &TokenBundle,
    ) -> Result<()> {
        self.refresh_required()?
            .store_tokens(user_id, session_id, bundle)
            .await
    }

    /// Refresh the stored tokens for `(user_id, session_id)`.
    pub async fn refresh_user_tokens(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<TokenBundle> {
        self.refresh_required()?
            .refresh_user_tokens(user_id, session_id)
            .await
    }

    /// Drop the stored tokens for `(user_id, session_id)`.
    pub async fn remove_stored_tokens(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.refresh_required()?
            .remove_stored_tokens(user_id, session_id)
            .await;
        Ok(())
    }

    /// Whether `(user_id, session_id)` still has a usable refresh token.
    pub async fn has_valid_stored_tokens(&self, user_id: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .refresh_required()?
            .has_valid_stored_tokens(user_id, session_id)
            .await)
    }

    fn refresh_required(&self) -> Result<&Arc<RefreshTokenManager>> {
        self.refresh
            .as_ref()
            .ok_or_else(|| Error::Internal("no refresh token manager attached".into()))
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("refresh_attached", &self.refresh.is_some())
            .finish_non_exhaustive()
    }
}

/// First 16 hex chars of `sha256(token)`; tokens never appear as cache keys.
fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::principal::{AuthMethod, Principal};

    fn result_with(roles: &[&str], permissions: &[&str]) -> AuthResult {
        AuthResult {
            principal: Principal {
                id: "u1".to_string(),
                username: "alice".to_string(),
                email: None,
                roles: roles.iter().map(|s| (*s).to_string()).collect(),
                permissions: permissions.iter().map(|s| (*s).to_string()).collect(),
                attributes: HashMap::new(),
            },
            method: AuthMethod::Jwt,
            expires_at: None,
            scopes: vec![],
        }
    }

    #[test]
    fn extract_bearer_strict_scheme() {
        assert_eq!(
            TokenManager::extract_bearer("Bearer abc.def.ghi").as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(
            TokenManager::extract_bearer("  Bearer abc  ").as_deref(),
            Some("abc")
        );
        // Case-sensitive scheme
        assert_eq!(TokenManager::extract_bearer("bearer abc"), None);
        assert_eq!(TokenManager::extract_bearer("BEARER abc"), None);
        // Missing or malformed token
        assert_eq!(TokenManager::extract_bearer("Bearer "), None);
        assert_eq!(TokenManager::extract_bearer("Bearer a b"), None);
        assert_eq!(TokenManager::extract_bearer("Basic dXNlcg=="), None);
        assert_eq!(TokenManager::extract_bearer(""), None);
    }

    #[test]
    fn role_helper_honors_prefixes() {
        let result = result_with(&["realm:user"], &[]);
        assert!(TokenManager::has_role(&result, "user"));
        assert!(TokenManager::has_role(&result, "realm:user"));
        assert!(!TokenManager::has_role(&result, "client:user"));
        assert!(!TokenManager::has_role(&result, "admin"));
    }

    #[test]
    fn permission_helper_honors_wildcards() {
        let result = result_with(&[], &["orders:read", "reports:*"]);
        assert!(TokenManager::has_permission(&result, "orders:read"));
        assert!(TokenManager::has_permission(&result, "reports:export"));
        assert!(!TokenManager::has_permission(&result, "orders:write"));

        let superuser = result_with(&[], &["*"]);
        assert!(TokenManager::has_permission(&superuser, "anything:at_all"));
    }

    #[test]
    fn token_hash_is_short_and_deterministic() {
        let a = token_hash("eyJhbGciOiJSUzI1NiJ9.x.y");
        let b = token_hash("eyJhbGciOiJSUzI1NiJ9.x.y");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, token_hash("other-token"));
    }
}
