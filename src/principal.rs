//! Core identity data model: principals, token bundles, validation results.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a principal was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Signature-verified JWT.
    Jwt,
    /// IdP introspection of an opaque token.
    Introspection,
    /// Long-lived API key.
    ApiKey,
    /// Server-side session.
    Session,
    /// Provisional PKCE handshake (awaiting code exchange).
    Pkce,
    /// No credentials; synthesized when anonymous access is allowed.
    Anonymous,
}

impl AuthMethod {
    /// Lowercase label used in log fields and stream frames.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::Introspection => "introspection",
            Self::ApiKey => "api_key",
            Self::Session => "session",
            Self::Pkce => "pkce",
            Self::Anonymous => "anonymous",
        }
    }
}

/// Authenticated user summary, immutable for the duration of a request or
/// message.
///
/// Roles carry their origin prefix (`realm:` or `client:`); matching helpers
/// accept either the bare or the prefixed form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// Opaque subject identifier (`sub` claim).
    pub id: String,
    /// Preferred username.
    pub username: String,
    /// Email, when the IdP exposes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Prefixed roles (`realm:user`, `client:orders-admin`).
    #[serde(default)]
    pub roles: Vec<String>,
    /// Permission strings (`resource:action`).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Open-world attributes used by attribute-based conditions.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Principal {
    /// Synthesize the anonymous principal (no roles, no permissions).
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            username: "anonymous".to_string(),
            email: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    /// Whether the principal carries `role`.
    ///
    /// A bare name matches either origin: `user` matches `realm:user` and
    /// `client:user`. A prefixed name matches exactly.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        if role.contains(':') {
            return self.roles.iter().any(|r| r == role);
        }
        self.roles.iter().any(|r| {
            r == role
                || r.strip_prefix("realm:") == Some(role)
                || r.strip_prefix("client:") == Some(role)
        })
    }

    /// Roles with their origin prefix stripped.
    #[must_use]
    pub fn bare_roles(&self) -> Vec<String> {
        self.roles
            .iter()
            .map(|r| {
                r.strip_prefix("realm:")
                    .or_else(|| r.strip_prefix("client:"))
                    .unwrap_or(r)
                    .to_string()
            })
            .collect()
    }
}

/// Token set returned by the IdP on authentication and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    /// Bearer access token.
    pub access_token: String,
    /// Refresh token, when the grant issued one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// OIDC id token, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Access token expiry.
    pub access_expires_at: DateTime<Utc>,
    /// Refresh token expiry, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Token type (always `bearer` in practice).
    pub token_type: String,
    /// Granted scopes, in issuance order.
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl TokenBundle {
    /// Whether the access token is past its expiry.
    #[must_use]
    pub fn is_access_expired(&self) -> bool {
        self.access_expires_at <= Utc::now()
    }

    /// Seconds until the access token expires (0 when already expired).
    #[must_use]
    pub fn access_ttl_secs(&self) -> u64 {
        (self.access_expires_at - Utc::now())
            .num_seconds()
            .try_into()
            .unwrap_or(0)
    }
}

/// Result of a successful credential validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResult {
    /// The validated principal.
    pub principal: Principal,
    /// Validation path that produced this result.
    pub method: AuthMethod,
    /// Token expiry, when the credential carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes granted to the credential.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// `realm_access` claim shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RealmAccess {
    /// Realm-level role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// One entry of the `resource_access` claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAccess {
    /// Client-level role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims the core reads from IdP-issued tokens.
///
/// `aud` may be a single string or an array; it is kept as a raw value and
/// matched manually.
#[derive(Debug, Clone, Deserialize)]
pub struct IdpClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    pub sub: String,
    /// Audience (string or array).
    #[serde(default)]
    pub aud: serde_json::Value,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Issued-at (Unix seconds).
    #[serde(default)]
    pub iat: u64,
    /// Not-before (Unix seconds).
    #[serde(default)]
    pub nbf: Option<u64>,
    /// Preferred username.
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Realm roles.
    #[serde(default)]
    pub realm_access: RealmAccess,
    /// Per-client roles. `BTreeMap` keeps expansion order deterministic.
    #[serde(default)]
    pub resource_access: BTreeMap<String, ClientAccess>,
    /// Explicit permissions claim, when the IdP maps one.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Space-separated scope string.
    #[serde(default)]
    pub scope: Option<String>,
}

impl IdpClaims {
    /// Prefixed roles from `realm_access` and every `resource_access` client.
    #[must_use]
    pub fn prefixed_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .realm_access
            .roles
            .iter()
            .map(|r| format!("realm:{r}"))
            .collect();
        for access in self.resource_access.values() {
            roles.extend(access.roles.iter().map(|r| format!("client:{r}")));
        }
        roles
    }

    /// Scopes split out of the space-separated `scope` claim.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    /// Build a [`Principal`] from these claims.
    #[must_use]
    pub fn to_principal(&self) -> Principal {
        Principal {
            id: self.sub.clone(),
            username: self
                .preferred_username
                .clone()
                .unwrap_or_else(|| self.sub.clone()),
            email: self.email.clone(),
            roles: self.prefixed_roles(),
            permissions: self.permissions.clone(),
            attributes: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims_json() -> serde_json::Value {
        json!({
            "iss": "https://id.example.com/realms/acme",
            "sub": "u1",
            "aud": "gateway",
            "exp": 4_102_444_800u64,
            "iat": 1_700_000_000u64,
            "preferred_username": "alice",
            "email": "alice@example.com",
            "realm_access": {"roles": ["user", "auditor"]},
            "resource_access": {
                "gateway": {"roles": ["admin"]},
                "billing": {"roles": ["viewer"]}
            },
            "scope": "openid profile"
        })
    }

    #[test]
    fn prefixed_roles_union_realm_and_clients() {
        let claims: IdpClaims = serde_json::from_value(claims_json()).unwrap();
        let roles = claims.prefixed_roles();
        assert!(roles.contains(&"realm:user".to_string()));
        assert!(roles.contains(&"realm:auditor".to_string()));
        assert!(roles.contains(&"client:admin".to_string()));
        assert!(roles.contains(&"client:viewer".to_string()));
    }

    #[test]
    fn principal_from_claims() {
        let claims: IdpClaims = serde_json::from_value(claims_json()).unwrap();
        let principal = claims.to_principal();
        assert_eq!(principal.id, "u1");
        assert_eq!(principal.username, "alice");
        assert_eq!(principal.email.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn bare_role_matches_either_origin() {
        let principal = Principal {
            roles: vec!["realm:user".to_string(), "client:admin".to_string()],
            ..Principal::anonymous()
        };
        assert!(principal.has_role("user"));
        assert!(principal.has_role("admin"));
        assert!(principal.has_role("realm:user"));
        assert!(!principal.has_role("client:user"));
        assert!(!principal.has_role("operator"));
    }

    #[test]
    fn anonymous_principal_is_empty() {
        let principal = Principal::anonymous();
        assert!(principal.roles.is_empty());
        assert!(principal.permissions.is_empty());
        assert_eq!(principal.id, "anonymous");
    }

    #[test]
    fn scopes_split_on_whitespace() {
        let claims: IdpClaims = serde_json::from_value(claims_json()).unwrap();
        assert_eq!(claims.scopes(), vec!["openid", "profile"]);
    }

    #[test]
    fn token_bundle_expiry_accounting() {
        let bundle = TokenBundle {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: None,
            access_expires_at: Utc::now() + chrono::Duration::seconds(300),
            refresh_expires_at: None,
            token_type: "bearer".to_string(),
            scopes: vec![],
        };
        assert!(!bundle.is_access_expired());
        let ttl = bundle.access_ttl_secs();
        assert!((295..=300).contains(&ttl));
    }
}
