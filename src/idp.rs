//! Identity provider (OIDC) HTTP client.
//!
//! Consumes the provider's discovery document and drives the token,
//! userinfo, introspection, end-session and admin endpoints. Discovery,
//! refresh and introspection calls are retried with backoff; credential
//! grants (password, code) are reported as-is.
//!
//! The initial discovery fetch is fatal: a gateway that cannot see its IdP
//! must not start.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IdpConfig;
use crate::middleware::{RetryPolicy, with_retry};
use crate::principal::{ClientAccess, RealmAccess, TokenBundle};
use crate::{Error, Result};

/// OIDC discovery document, reduced to the fields this core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Issuer URL; must match the `iss` claim of issued tokens.
    pub issuer: String,
    /// Authorization endpoint (code flow).
    pub authorization_endpoint: String,
    /// Token endpoint (all grants).
    pub token_endpoint: String,
    /// Userinfo endpoint.
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    /// JWKS URL.
    pub jwks_uri: String,
    /// Introspection endpoint.
    #[serde(default)]
    pub introspection_endpoint: Option<String>,
    /// RP-initiated logout endpoint.
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    /// Signing algorithms for id tokens; must include RS256.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Token endpoint response shape.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_bundle(self) -> TokenBundle {
        let now = Utc::now();
        let access_secs = i64::try_from(self.expires_in.unwrap_or(300)).unwrap_or(300);
        TokenBundle {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            access_expires_at: now + chrono::Duration::seconds(access_secs),
            refresh_expires_at: self
                .refresh_expires_in
                .and_then(|s| i64::try_from(s).ok())
                .map(|s| now + chrono::Duration::seconds(s)),
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            scopes: self
                .scope
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(String::from)
                .collect(),
        }
    }
}

/// Userinfo document.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Subject identifier.
    pub sub: String,
    /// Preferred username.
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Realm roles.
    #[serde(default)]
    pub realm_access: RealmAccess,
    /// Per-client roles.
    #[serde(default)]
    pub resource_access: BTreeMap<String, ClientAccess>,
}

/// Raw introspection response (RFC 7662).
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active.
    pub active: bool,
    /// Subject, present for active tokens.
    #[serde(default)]
    pub sub: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Space-separated scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// Expiry (Unix seconds).
    #[serde(default)]
    pub exp: Option<u64>,
    /// Realm roles.
    #[serde(default)]
    pub realm_access: RealmAccess,
    /// Per-client roles.
    #[serde(default)]
    pub resource_access: BTreeMap<String, ClientAccess>,
}

/// User record returned by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUser {
    /// User id.
    pub id: String,
    /// Username.
    pub username: String,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Whether the account is enabled.
    #[serde(default)]
    pub enabled: bool,
}

/// Request body for admin user creation.
#[derive(Debug, Clone, Serialize)]
pub struct NewUser {
    /// Username.
    pub username: String,
    /// Email.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Whether the account starts enabled.
    pub enabled: bool,
}

/// Cached client-credentials token for admin calls.
struct AdminToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

/// HTTP client for the identity provider.
pub struct IdpClient {
    http: reqwest::Client,
    introspection_http: reqwest::Client,
    config: IdpConfig,
    retry: RetryPolicy,
    discovery: RwLock<Option<DiscoveryDocument>>,
    admin_token: RwLock<Option<AdminToken>>,
}

impl IdpClient {
    /// Build a client; call [`initialize`](Self::initialize) before use.
    pub fn new(config: IdpConfig, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        let introspection_http = reqwest::Client::builder()
            .timeout(config.introspection_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            introspection_http,
            config,
            retry,
            discovery: RwLock::new(None),
            admin_token: RwLock::new(None),
        })
    }

    /// Fetch and cache the discovery document.
    ///
    /// # Errors
    ///
    /// Surfaces the fetch failure; callers treat this as fatal at startup.
    pub async fn initialize(&self) -> Result<DiscoveryDocument> {
        let url = self.config.discovery_url();
        let doc = with_retry(&self.retry, "idp_discovery", || async {
            let response = self.http.get(&url).send().await.map_err(map_transport)?;
            if !response.status().is_success() {
                return Err(Error::UpstreamUnavailable(format!(
                    "discovery returned HTTP {}",
                    response.status()
                )));
            }
            response
                .json::<DiscoveryDocument>()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("discovery parse: {e}")))
        })
        .await?;

        if !doc
            .id_token_signing_alg_values_supported
            .iter()
            .any(|alg| alg == "RS256")
        {
            warn!(issuer = %doc.issuer, "IdP does not advertise RS256 id-token signing");
        }

        info!(issuer = %doc.issuer, "IdP discovery complete");
        *self.discovery.write() = Some(doc.clone());
        Ok(doc)
    }

    /// The cached discovery document.
    pub fn discovery(&self) -> Result<DiscoveryDocument> {
        self.discovery
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("IdP client not initialized".into()))
    }

    /// Resource-owner-password grant.
    pub async fn token_password(&self, username: &str, password: &str) -> Result<TokenBundle> {
        let mut form = self.base_form();
        form.push(("grant_type", "password".to_string()));
        form.push(("username", username.to_string()));
        form.push(("password", password.to_string()));
        if !self.config.scopes.is_empty() {
            form.push(("scope", self.config.scopes.join(" ")));
        }
        self.token_grant(form).await
    }

    /// Authorization-code grant, PKCE-bound when `code_verifier` is present.
    pub async fn token_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenBundle> {
        let mut form = self.base_form();
        form.push(("grant_type", "authorization_code".to_string()));
        form.push(("code", code.to_string()));
        form.push(("redirect_uri", redirect_uri.to_string()));
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier.to_string()));
        }
        self.token_grant(form).await
    }

    /// Refresh-token grant. Retried with backoff on transport failures.
    pub async fn token_refresh(&self, refresh_token: &str) -> Result<TokenBundle> {
        with_retry(&self.retry, "idp_refresh", || async {
            let mut form = self.base_form();
            form.push(("grant_type", "refresh_token".to_string()));
            form.push(("refresh_token", refresh_token.to_string()));
            self.token_grant(form).await
        })
        .await
    }

    /// Client-credentials grant (service account).
    pub async fn token_client_credentials(&self) -> Result<TokenBundle> {
        let mut form = self.base_form();
        form.push(("grant_type", "client_credentials".to_string()));
        self.token_grant(form).await
    }

    /// Fetch the userinfo document for a bearer token.
    pub async fn userinfo(&self, access_token: &str) -> Result<UserInfo> {
        let doc = self.discovery()?;
        let endpoint = doc
            .userinfo_endpoint
            .ok_or_else(|| Error::Internal("IdP exposes no userinfo endpoint".into()))?;

        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(map_transport)?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(Error::TokenInvalid("userinfo rejected token".into())),
            status if !status.is_success() => Err(Error::UpstreamUnavailable(format!(
                "userinfo returned HTTP {status}"
            ))),
            _ => response
                .json::<UserInfo>()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("userinfo parse: {e}"))),
        }
    }

    /// Introspect an opaque token. Retried with backoff; runs on the short
    /// introspection deadline.
    pub async fn introspect(&self, token: &str) -> Result<IntrospectionResponse> {
        let doc = self.discovery()?;
        let endpoint = doc
            .introspection_endpoint
            .ok_or_else(|| Error::UpstreamUnavailable("IdP exposes no introspection endpoint".into()))?;
        let secret = self.config.resolve_client_secret().unwrap_or_default();

        with_retry(&self.retry, "idp_introspect", || async {
            let response = self
                .introspection_http
                .post(&endpoint)
                .basic_auth(&self.config.client_id, Some(&secret))
                .form(&[("token", token)])
                .send()
                .await
                .map_err(map_transport)?;

            if !response.status().is_success() {
                return Err(Error::UpstreamUnavailable(format!(
                    "introspection returned HTTP {}",
                    response.status()
                )));
            }
            response
                .json::<IntrospectionResponse>()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("introspection parse: {e}")))
        })
        .await
    }

    /// RP-initiated logout: invalidate the IdP-side session for this
    /// refresh token. Best-effort at call sites.
    pub async fn end_session(&self, refresh_token: &str) -> Result<()> {
        let doc = self.discovery()?;
        let Some(endpoint) = doc.end_session_endpoint else {
            debug!("IdP exposes no end-session endpoint, skipping upstream logout");
            return Ok(());
        };

        let mut form = self.base_form();
        form.push(("refresh_token", refresh_token.to_string()));

        let response = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(map_transport)?;

        if !response.status().is_success() && response.status() != StatusCode::NO_CONTENT {
            return Err(Error::UpstreamUnavailable(format!(
                "end-session returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Create a user through the admin API. Returns the new user id.
    pub async fn create_user(&self, user: &NewUser) -> Result<String> {
        let token = self.admin_token().await?;
        let url = format!(
            "{}/admin/realms/{}/users",
            self.config.server_url.trim_end_matches('/'),
            self.config.realm
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(user)
            .send()
            .await
            .map_err(map_transport)?;

        match response.status() {
            StatusCode::CREATED => {
                // Location: .../users/<id>
                let id = response
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| loc.rsplit('/').next())
                    .map(String::from)
                    .ok_or_else(|| {
                        Error::UpstreamUnavailable("admin create returned no Location".into())
                    })?;
                Ok(id)
            }
            StatusCode::CONFLICT => Err(Error::InvalidRequest("user already exists".into())),
            status => Err(Error::UpstreamUnavailable(format!(
                "admin create returned HTTP {status}"
            ))),
        }
    }

    /// Fetch a user by id through the admin API.
    pub async fn get_user(&self, user_id: &str) -> Result<AdminUser> {
        let token = self.admin_token().await?;
        let url = format!(
            "{}/admin/realms/{}/users/{}",
            self.config.server_url.trim_end_matches('/'),
            self.config.realm,
            user_id
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(map_transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::InvalidRequest("user not found".into())),
            status if !status.is_success() => Err(Error::UpstreamUnavailable(format!(
                "admin get returned HTTP {status}"
            ))),
            _ => response
                .json::<AdminUser>()
                .await
                .map_err(|e| Error::UpstreamUnavailable(format!("admin get parse: {e}"))),
        }
    }

    /// Reachability probe: fetch the discovery document without caching.
    pub async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(self.config.discovery_url())
            .send()
            .await
            .map_err(map_transport)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::UpstreamUnavailable(format!(
                "discovery returned HTTP {}",
                response.status()
            )))
        }
    }

    /// Base form fields every grant carries.
    fn base_form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("client_id", self.config.client_id.clone())];
        if let Some(secret) = self.config.resolve_client_secret() {
            form.push(("client_secret", secret));
        }
        form
    }

    /// POST a grant to the token endpoint and map the response.
    async fn token_grant(&self, form: Vec<(&'static str, String)>) -> Result<TokenBundle> {
        let doc = self.discovery()?;

        let response = self
            .http
            .post(&doc.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(map_transport)?;

        match response.status() {
            StatusCode::OK => {
                let parsed: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::UpstreamUnavailable(format!("token parse: {e}")))?;
                Ok(parsed.into_bundle())
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                // The body names the OAuth error; do not echo it to callers
                let body = response.text().await.unwrap_or_default();
                debug!(body = %body, "Token grant rejected");
                Err(Error::Unauthorized("invalid credentials".into()))
            }
            status => Err(Error::UpstreamUnavailable(format!(
                "token endpoint returned HTTP {status}"
            ))),
        }
    }

    /// Client-credentials token for admin calls, cached until near expiry.
    async fn admin_token(&self) -> Result<String> {
        {
            let guard = self.admin_token.read();
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Utc::now() + chrono::Duration::seconds(30) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let bundle = self.token_client_credentials().await?;
        let token = bundle.access_token.clone();
        *self.admin_token.write() = Some(AdminToken {
            token: token.clone(),
            expires_at: bundle.access_expires_at,
        });
        Ok(token)
    }
}

impl std::fmt::Debug for IdpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdpClient")
            .field("realm", &self.config.realm)
            .finish_non_exhaustive()
    }
}

/// Map reqwest transport errors onto the taxonomy.
fn map_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(e.to_string())
    } else {
        Error::Http(e)
    }
}
