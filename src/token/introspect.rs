//! Opaque-token validation via the IdP introspection endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::idp::IdpClient;
use crate::principal::{AuthMethod, AuthResult, Principal};
use crate::{Error, Result};

/// Validates opaque tokens by asking the IdP.
pub struct TokenIntrospector {
    idp: Arc<IdpClient>,
}

impl TokenIntrospector {
    /// Create an introspector over the shared IdP client.
    #[must_use]
    pub fn new(idp: Arc<IdpClient>) -> Self {
        Self { idp }
    }

    /// Validate `token` and produce an [`AuthResult`].
    ///
    /// # Errors
    ///
    /// - [`Error::TokenInvalid`] when the IdP reports the token inactive.
    /// - [`Error::TokenExpired`] when `exp` is in the past.
    /// - [`Error::UpstreamUnavailable`] / [`Error::UpstreamTimeout`] when the
    ///   introspection endpoint cannot be reached.
    pub async fn validate(&self, token: &str) -> Result<AuthResult> {
        let response = self.idp.introspect(token).await?;

        if !response.active {
            debug!("Introspection reported inactive token");
            return Err(Error::TokenInvalid("token inactive".into()));
        }

        let expires_at = response
            .exp
            .and_then(|exp| i64::try_from(exp).ok())
            .and_then(|exp| chrono::DateTime::from_timestamp(exp, 0));
        if let Some(exp) = expires_at {
            if exp <= chrono::Utc::now() {
                return Err(Error::TokenExpired);
            }
        }

        let sub = response
            .sub
            .ok_or_else(|| Error::TokenInvalid("introspection returned no subject".into()))?;

        let mut roles: Vec<String> = response
            .realm_access
            .roles
            .iter()
            .map(|r| format!("realm:{r}"))
            .collect();
        for access in response.resource_access.values() {
            roles.extend(access.roles.iter().map(|r| format!("client:{r}")));
        }

        let scopes: Vec<String> = response
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect();

        Ok(AuthResult {
            principal: Principal {
                username: response.username.clone().unwrap_or_else(|| sub.clone()),
                id: sub,
                email: None,
                roles,
                permissions: Vec::new(),
                attributes: HashMap::new(),
            },
            method: AuthMethod::Introspection,
            expires_at,
            scopes,
        })
    }
}

impl std::fmt::Debug for TokenIntrospector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIntrospector").finish_non_exhaustive()
    }
}
