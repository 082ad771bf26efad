//! Request-protocol authentication interceptor.
//!
//! Extracts credentials in a fixed order (bearer token, API key, session
//! cookie/query, PKCE handshake parameters, anonymous fallback) and
//! attaches the resulting principal to the request context. An axum
//! middleware adapter is provided for deployments that mount the core
//! directly into an axum router.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next as AxumNext,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RequestContext;
use crate::apikey::ApiKeyManager;
use crate::error::ErrorEnvelope;
use crate::middleware::{Middleware, Next};
use crate::pkce::PkceManager;
use crate::principal::{AuthMethod, AuthResult, Principal};
use crate::session::{RequestMeta, SessionManager};
use crate::token::TokenManager;
use crate::{Error, Result};

/// Interceptor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Header carrying an API key.
    pub api_key_header: String,
    /// Cookie (and query parameter) carrying the session id.
    pub session_cookie: String,
    /// Synthesize an anonymous principal when no credentials are present.
    pub allow_anonymous: bool,
    /// Paths that bypass authentication entirely.
    pub public_paths: Vec<String>,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            api_key_header: "x-api-key".to_string(),
            session_cookie: "session_id".to_string(),
            allow_anonymous: false,
            public_paths: vec!["/health".to_string()],
        }
    }
}

/// Request-protocol credential extraction and validation.
pub struct AuthInterceptor {
    tokens: Arc<TokenManager>,
    api_keys: Arc<ApiKeyManager>,
    sessions: Arc<SessionManager>,
    pkce: Arc<PkceManager>,
    config: InterceptorConfig,
}

impl AuthInterceptor {
    /// Create an interceptor over the credential subsystems.
    #[must_use]
    pub fn new(
        tokens: Arc<TokenManager>,
        api_keys: Arc<ApiKeyManager>,
        sessions: Arc<SessionManager>,
        pkce: Arc<PkceManager>,
        config: InterceptorConfig,
    ) -> Self {
        Self {
            tokens,
            api_keys,
            sessions,
            pkce,
            config,
        }
    }

    /// Whether `path` bypasses authentication.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.config.public_paths.iter().any(|p| path.starts_with(p))
    }

    /// Run the extraction order against `ctx` and return the principal.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] when no extraction succeeds and anonymous
    /// access is disabled; the specific failure of an attempted credential
    /// (expired token, bad key) propagates instead when one was presented.
    pub async fn authenticate(&self, ctx: &mut RequestContext) -> Result<AuthResult> {
        // 1. Bearer token
        if let Some(authorization) = ctx.header("authorization") {
            if let Some(token) = TokenManager::extract_bearer(authorization) {
                let result = self.tokens.validate_token(&token, false).await?;
                debug!(path = %ctx.path, "Authenticated via bearer token");
                return Ok(result);
            }
        }

        // 2. API key, header first, then query
        let api_key = ctx
            .header(&self.config.api_key_header)
            .map(String::from)
            .or_else(|| ctx.query.get("api_key").cloned());
        if let Some(api_key) = api_key {
            let identity = self.api_keys.validate(&api_key).await?;
            debug!(path = %ctx.path, "Authenticated via API key");
            return Ok(AuthResult {
                principal: Principal {
                    id: identity.user_id.clone(),
                    username: identity.user_id.clone(),
                    email: None,
                    roles: Vec::new(),
                    permissions: identity.permissions.clone(),
                    attributes: HashMap::new(),
                },
                method: AuthMethod::ApiKey,
                expires_at: None,
                scopes: identity.scopes,
            });
        }

        // 3. Session cookie or query parameter
        let session_id = ctx
            .cookies
            .get(&self.config.session_cookie)
            .cloned()
            .or_else(|| ctx.query.get("session_id").cloned());
        if let Some(session_id) = session_id {
            let meta = RequestMeta {
                ip: ctx.ip.clone(),
                user_agent: ctx.user_agent.clone(),
            };
            let outcome = self.sessions.validate_session(&session_id, &meta).await;
            if !outcome.valid {
                return Err(match outcome.error {
                    Some("session_expired") => Error::SessionExpired,
                    Some("session_security_violation") => {
                        Error::SessionSecurityViolation("context mismatch".into())
                    }
                    Some("invalid_request") => Error::InvalidRequest("malformed session id".into()),
                    _ => Error::SessionNotFound,
                });
            }
            let session = outcome.session.ok_or(Error::SessionNotFound)?;
            ctx.session_id = Some(session_id);
            let principal = session.principal.clone().unwrap_or(Principal {
                id: session.user_id.clone(),
                username: session.user_id.clone(),
                email: None,
                roles: Vec::new(),
                permissions: Vec::new(),
                attributes: HashMap::new(),
            });
            debug!(path = %ctx.path, "Authenticated via session");
            return Ok(AuthResult {
                principal,
                method: AuthMethod::Session,
                expires_at: Some(session.expires_at),
                scopes: Vec::new(),
            });
        }

        // 4. PKCE handshake parameters: provisional, pending code exchange
        if let (Some(_challenge), Some(state)) =
            (ctx.query.get("code_challenge"), ctx.query.get("state"))
        {
            debug!(path = %ctx.path, "Provisional PKCE principal attached");
            let mut principal = Principal::anonymous();
            principal
                .attributes
                .insert("pkce_state".to_string(), serde_json::json!(state));
            let _ = &self.pkce; // pair validation happens at code exchange
            return Ok(AuthResult {
                principal,
                method: AuthMethod::Pkce,
                expires_at: None,
                scopes: Vec::new(),
            });
        }

        // 5. Anonymous fallback
        if self.config.allow_anonymous {
            return Ok(AuthResult {
                principal: Principal::anonymous(),
                method: AuthMethod::Anonymous,
                expires_at: None,
                scopes: Vec::new(),
            });
        }

        Err(Error::Unauthorized("missing credentials".into()))
    }
}

#[async_trait]
impl Middleware<RequestContext> for AuthInterceptor {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn skip_paths(&self) -> Vec<String> {
        self.config
            .public_paths
            .iter()
            .map(|p| format!("{p}*"))
            .collect()
    }

    async fn execute(&self, ctx: &mut RequestContext, next: Next<'_, RequestContext>) -> Result<()> {
        let result = self.authenticate(ctx).await?;
        ctx.auth = Some(result);
        next.run(ctx).await
    }
}

impl std::fmt::Debug for AuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInterceptor")
            .field("allow_anonymous", &self.config.allow_anonymous)
            .finish_non_exhaustive()
    }
}

/// Axum middleware adapter: authenticates the request, attaches the
/// [`AuthResult`] to request extensions, and renders the sanitized 401/403
/// envelope on failure.
pub async fn axum_auth_middleware(
    State(interceptor): State<Arc<AuthInterceptor>>,
    request: Request<Body>,
    next: AxumNext,
) -> Response {
    let path = request.uri().path().to_string();
    if interceptor.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let mut ctx = context_from_request(&request);
    match interceptor.authenticate(&mut ctx).await {
        Ok(result) => {
            let mut request = request;
            request.extensions_mut().insert(result);
            if let Some(session_id) = ctx.session_id {
                request.extensions_mut().insert(SessionIdExt(session_id));
            }
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, code = e.code(), "Request authentication failed");
            error_response(&e, &ctx.request_id)
        }
    }
}

/// Session id attached to request extensions after session auth.
#[derive(Debug, Clone)]
pub struct SessionIdExt(pub String);

fn context_from_request(request: &Request<Body>) -> RequestContext {
    let query = request
        .uri()
        .query()
        .map(parse_query)
        .unwrap_or_default();
    let headers = request.headers().clone();
    let cookies = headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .map(parse_cookies)
        .unwrap_or_default();

    let ip = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);

    RequestContext {
        request_id,
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        headers,
        query,
        cookies,
        ip,
        user_agent,
        auth: None,
        session_id: None,
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn parse_cookies(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn error_response(error: &Error, request_id: &str) -> Response {
    let envelope = ErrorEnvelope::from_error(error, request_id);
    let status = StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(envelope)).into_response();
    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert("WWW-Authenticate", "Bearer".parse().expect("static header"));
    }
    response
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Offline wiring of the interceptor and its collaborators, shared by
    //! the interceptor test modules.

    use std::sync::Arc;

    use super::{AuthInterceptor, InterceptorConfig};
    use crate::apikey::{ApiKeyManager, MemoryApiKeyRepository};
    use crate::cache::{CacheFacade, MemoryStore};
    use crate::config::{
        ApiKeyConfig, CacheTtlConfig, IdpConfig, JwtConfig, PkceConfig, SecurityConfig,
        SessionConfig,
    };
    use crate::crypto::EncryptionManager;
    use crate::idp::IdpClient;
    use crate::middleware::RetryPolicy;
    use crate::pkce::PkceManager;
    use crate::session::{MemorySessionRepository, SessionManager, SessionStore};
    use crate::stats::AuthStats;
    use crate::token::{JwtValidator, TokenIntrospector, TokenManager};

    pub(crate) fn build_with(
        config: InterceptorConfig,
    ) -> (Arc<AuthInterceptor>, Arc<SessionManager>, Arc<ApiKeyManager>) {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()), true);
        let encryption = Arc::new(
            EncryptionManager::new(&EncryptionManager::generate_master_key(), 1_000).unwrap(),
        );
        let stats = Arc::new(AuthStats::new());
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
        let tokens = Arc::new(TokenManager::new(
            jwt,
            Arc::new(TokenIntrospector::new(Arc::clone(&idp))),
            cache.clone(),
            CacheTtlConfig::default(),
            Arc::clone(&stats),
        ));
        let store = Arc::new(SessionStore::new(
            Arc::new(MemorySessionRepository::new()),
            cache.clone(),
            encryption,
            SessionConfig::default(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            Arc::clone(&tokens),
            Arc::clone(&idp),
            cache.clone(),
            SessionConfig::default(),
            60,
            Arc::clone(&stats),
        ));
        let api_keys = Arc::new(ApiKeyManager::new(
            Arc::new(MemoryApiKeyRepository::new()),
            cache.clone(),
            ApiKeyConfig::default(),
            &SecurityConfig {
                api_key_hash_memory_kib: 8,
                api_key_hash_rounds: 1,
                ..SecurityConfig::default()
            },
        ));
        let pkce = Arc::new(PkceManager::new(cache, PkceConfig::default()));
        let interceptor = Arc::new(AuthInterceptor::new(
            tokens,
            Arc::clone(&api_keys),
            Arc::clone(&sessions),
            pkce,
            config,
        ));
        (interceptor, sessions, api_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::build_with;
    use super::*;
    use crate::apikey::GenerateOptions;
    use crate::session::CreateSessionOptions;

    fn build() -> (
        Arc<AuthInterceptor>,
        Arc<SessionManager>,
        Arc<ApiKeyManager>,
    ) {
        build_with(InterceptorConfig::default())
    }

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new("GET", path, "10.0.0.1", "UA/1")
    }

    #[tokio::test]
    async fn no_credentials_is_unauthorized() {
        let (interceptor, _, _) = build();
        let mut ctx = ctx("/api/orders");
        let result = interceptor.authenticate(&mut ctx).await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[tokio::test]
    async fn anonymous_fallback_when_enabled() {
        let (interceptor, _, _) = build_with(InterceptorConfig {
            allow_anonymous: true,
            ..InterceptorConfig::default()
        });

        let mut ctx = ctx("/api/orders");
        let result = interceptor.authenticate(&mut ctx).await.unwrap();
        assert_eq!(result.method, AuthMethod::Anonymous);
        assert!(result.principal.roles.is_empty());
    }

    #[tokio::test]
    async fn api_key_in_header_authenticates() {
        let (interceptor, _, api_keys) = build();
        let generated = api_keys
            .generate(GenerateOptions {
                name: "test".to_string(),
                user_id: "u1".to_string(),
                permissions: vec!["orders:read".to_string()],
                ..GenerateOptions::default()
            })
            .await
            .unwrap();

        let mut ctx = ctx("/api/orders");
        ctx.headers
            .insert("x-api-key", generated.api_key.parse().unwrap());

        let result = interceptor.authenticate(&mut ctx).await.unwrap();
        assert_eq!(result.method, AuthMethod::ApiKey);
        assert_eq!(result.principal.id, "u1");
        assert_eq!(result.principal.permissions, vec!["orders:read"]);
    }

    #[tokio::test]
    async fn api_key_in_query_authenticates() {
        let (interceptor, _, api_keys) = build();
        let generated = api_keys
            .generate(GenerateOptions {
                name: "test".to_string(),
                user_id: "u1".to_string(),
                ..GenerateOptions::default()
            })
            .await
            .unwrap();

        let mut ctx = ctx("/api/orders");
        ctx.query.insert("api_key".to_string(), generated.api_key);

        let result = interceptor.authenticate(&mut ctx).await.unwrap();
        assert_eq!(result.method, AuthMethod::ApiKey);
    }

    #[tokio::test]
    async fn bad_api_key_propagates_failure_not_fallthrough() {
        let (interceptor, _, _) = build();
        let mut ctx = ctx("/api/orders");
        ctx.headers
            .insert("x-api-key", "ak_totally-invalid-key-material-1234".parse().unwrap());

        let result = interceptor.authenticate(&mut ctx).await;
        assert!(matches!(result, Err(Error::Unauthorized(_))));
    }

    #[tokio::test]
    async fn session_cookie_authenticates() {
        let (interceptor, sessions, _) = build();
        let session = sessions
            .create_session(CreateSessionOptions {
                user_id: "u7".to_string(),
                principal: Some(Principal {
                    id: "u7".to_string(),
                    username: "gina".to_string(),
                    email: None,
                    roles: vec!["realm:user".to_string()],
                    permissions: vec![],
                    attributes: HashMap::new(),
                }),
                idp_session_id: None,
                tokens: None,
                meta: RequestMeta {
                    ip: "10.0.0.1".to_string(),
                    user_agent: "UA/1".to_string(),
                },
                max_age_secs: None,
                metadata: serde_json::Map::new(),
            })
            .await
            .unwrap();

        let mut ctx = ctx("/api/orders");
        ctx.cookies
            .insert("session_id".to_string(), session.session_id.clone());

        let result = interceptor.authenticate(&mut ctx).await.unwrap();
        assert_eq!(result.method, AuthMethod::Session);
        assert_eq!(result.principal.username, "gina");
        assert_eq!(ctx.session_id.as_deref(), Some(session.session_id.as_str()));
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let (interceptor, _, _) = build();
        let mut ctx = ctx("/api/orders");
        ctx.cookies.insert(
            "session_id".to_string(),
            format!("{}.abc123", uuid::Uuid::new_v4()),
        );

        let result = interceptor.authenticate(&mut ctx).await;
        assert!(matches!(result, Err(Error::SessionNotFound)));
    }

    #[tokio::test]
    async fn pkce_params_yield_provisional_principal() {
        let (interceptor, _, _) = build();
        let mut ctx = ctx("/oauth/authorize");
        ctx.query
            .insert("code_challenge".to_string(), "abc".to_string());
        ctx.query.insert("state".to_string(), "xyz".to_string());

        let result = interceptor.authenticate(&mut ctx).await.unwrap();
        assert_eq!(result.method, AuthMethod::Pkce);
        assert_eq!(
            result.principal.attributes.get("pkce_state"),
            Some(&serde_json::json!("xyz"))
        );
    }

    #[test]
    fn cookie_and_query_parsing() {
        let cookies = parse_cookies("session_id=abc; theme=dark;  bad");
        assert_eq!(cookies.get("session_id").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(cookies.len(), 2);

        let query = parse_query("api_key=ak_1&x=%20y");
        assert_eq!(query.get("api_key").map(String::as_str), Some("ak_1"));
        assert_eq!(query.get("x").map(String::as_str), Some(" y"));
    }

    #[test]
    fn public_paths_use_prefix_match() {
        let (interceptor, _, _) = build();
        assert!(interceptor.is_public_path("/health"));
        assert!(interceptor.is_public_path("/health/live"));
        assert!(!interceptor.is_public_path("/api/orders"));
    }
}
