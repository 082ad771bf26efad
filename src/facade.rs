//! Top-level composition: wires every subsystem and exposes the
//! authentication ceremonies.
//!
//! [`IntegrationFacade::initialize`] is the composition root: it performs
//! IdP discovery (fatal on failure), warms the JWKS cache, mounts the
//! session-sync subscriptions and spawns the refresh scheduler. All
//! background work takes the facade's shutdown signal and drains on
//! [`cleanup`](IntegrationFacade::cleanup).

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::apikey::{ApiKeyManager, ApiKeyRepository, PgApiKeyRepository};
use crate::cache::{CacheFacade, CacheStore, CacheStatsSnapshot, RedisStore};
use crate::config::Config;
use crate::crypto::EncryptionManager;
use crate::idp::{AdminUser, IdpClient, NewUser};
use crate::interceptor::{AuthInterceptor, InterceptorConfig};
use crate::pkce::PkceManager;
use crate::principal::Principal;
use crate::ratelimit::RateLimiter;
use crate::rbac::{AbilityFactory, PermissionEvaluator, RoleDefinition, RoleHierarchyManager};
use crate::middleware::RetryPolicy;
use crate::session::{
    CreateSessionOptions, MemorySessionRepository, PgSessionRepository, RequestMeta, Session,
    SessionManager, SessionRepository, SessionStore, SessionSynchronizer, SessionValidation,
};
use crate::stats::{AuthStats, AuthStatsSnapshot};
use crate::token::{JwtValidator, RefreshTokenManager, TokenIntrospector, TokenManager};
use crate::{Error, Result};

/// Stats snapshot TTL: bursts of dashboard polls share one generation.
const STATS_TTL: Duration = Duration::from_secs(5);

/// Storage backends the facade composes over.
pub struct Backends {
    /// Shared cache store.
    pub cache: Arc<dyn CacheStore>,
    /// Session persistence.
    pub sessions: Arc<dyn SessionRepository>,
    /// API key persistence.
    pub api_keys: Arc<dyn ApiKeyRepository>,
}

impl Backends {
    /// All-in-memory backends (tests, single-node evaluation).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(crate::cache::MemoryStore::new()),
            sessions: Arc::new(MemorySessionRepository::new()),
            api_keys: Arc::new(crate::apikey::MemoryApiKeyRepository::new()),
        }
    }
}

/// Successful authentication ceremony result.
#[derive(Debug)]
pub struct AuthenticationSuccess {
    /// The created session (tokens in the clear for the caller).
    pub session: Session,
    /// The authenticated principal.
    pub principal: Principal,
}

/// Options for [`IntegrationFacade::logout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogoutOptions {
    /// Also end the IdP-side session via the refresh token.
    pub from_idp: bool,
    /// Destroy every session of the user, not just this one.
    pub all_sessions: bool,
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// IdP reachability.
    pub idp: bool,
    /// Cache tier reachability.
    pub cache: bool,
    /// Relational store reachability.
    pub database: bool,
}

impl HealthReport {
    /// Whether every dependency is reachable.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.idp && self.cache && self.database
    }
}

/// Stats snapshot exposed by [`IntegrationFacade::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    /// Auth counters.
    pub auth: AuthStatsSnapshot,
    /// Cache facade counters.
    pub cache: CacheStatsSnapshot,
    /// Live stream connections on this node.
    pub stream_connections: usize,
}

struct CachedStats {
    report: StatsReport,
    generated_at: Instant,
}

/// Top-level orchestrator.
pub struct IntegrationFacade {
    config: Config,
    cache: CacheFacade,
    idp: Arc<IdpClient>,
    encryption: Arc<EncryptionManager>,
    jwt: Arc<JwtValidator>,
    tokens: Arc<TokenManager>,
    session_store: Arc<SessionStore>,
    sessions: Arc<SessionManager>,
    api_keys: Arc<ApiKeyManager>,
    hierarchy: Arc<RoleHierarchyManager>,
    evaluator: Arc<PermissionEvaluator>,
    abilities: Arc<AbilityFactory>,
    pkce: Arc<PkceManager>,
    synchronizer: Arc<SessionSynchronizer>,
    rate_limiter: Arc<RateLimiter>,
    interceptor: Arc<AuthInterceptor>,
    stats: Arc<AuthStats>,
    stats_cache: tokio::sync::Mutex<Option<CachedStats>>,
    shutdown: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Present when the facade opened the pool itself; closed on cleanup.
    pool: parking_lot::Mutex<Option<sqlx::PgPool>>,
}

impl IntegrationFacade {
    /// Production path: open Redis and Postgres from config, then
    /// [`initialize`](Self::initialize).
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let cache = Arc::new(RedisStore::connect(&config.cache.url).await?);
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.resolve_url())
            .await?;

        let backends = Backends {
            cache,
            sessions: Arc::new(PgSessionRepository::new(pool.clone())),
            api_keys: Arc::new(PgApiKeyRepository::new(pool.clone())),
        };
        let facade = Self::initialize(config, backends).await?;
        *facade.pool.lock() = Some(pool);
        Ok(facade)
    }

    /// Build the component graph over `backends` and bring it live.
    ///
    /// # Errors
    ///
    /// Fatal when IdP discovery fails or the subscription channels cannot
    /// be established; a core that cannot see its IdP must not start.
    pub async fn initialize(config: Config, backends: Backends) -> Result<Arc<Self>> {
        let cache = CacheFacade::new(Arc::clone(&backends.cache), config.cache.enabled);
        let stats = Arc::new(AuthStats::new());

        let master_key = match &config.encryption.key {
            Some(key) => key.clone(),
            None => {
                warn!("No encryption key configured; generating one (sessions will not survive restarts)");
                EncryptionManager::generate_master_key()
            }
        };
        let encryption = Arc::new(
            EncryptionManager::new(&master_key, config.encryption.key_derivation_iterations)
                .map_err(Error::from)?,
        );

        let retry = RetryPolicy::new(&config.middleware.retry);
        let idp = Arc::new(IdpClient::new(config.idp.clone(), retry)?);

        // Discovery is fatal at startup
        let discovery = idp.initialize().await?;
        let jwks_url = config
            .jwt
            .jwks_url
            .clone()
            .unwrap_or_else(|| discovery.jwks_uri.clone());

        let jwt = Arc::new(JwtValidator::new(
            &config.jwt,
            jwks_url,
            reqwest::Client::new(),
        ));
        if let Err(e) = jwt.warm().await {
            // Non-fatal: the first validation will retry the fetch
            warn!(error = %e, "JWKS warm-up failed");
        }

        let introspector = Arc::new(TokenIntrospector::new(Arc::clone(&idp)));
        let refresh = Arc::new(RefreshTokenManager::new(
            cache.clone(),
            Arc::clone(&encryption),
            Arc::clone(&idp),
            config.refresh.clone(),
        ));
        let tokens = Arc::new(
            TokenManager::new(
                Arc::clone(&jwt),
                introspector,
                cache.clone(),
                config.cache.ttl.clone(),
                Arc::clone(&stats),
            )
            .with_refresh(Arc::clone(&refresh)),
        );

        let session_store = Arc::new(SessionStore::new(
            Arc::clone(&backends.sessions),
            cache.clone(),
            Arc::clone(&encryption),
            config.session.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&session_store),
            Arc::clone(&tokens),
            Arc::clone(&idp),
            cache.clone(),
            config.session.clone(),
            config.cache.ttl.session,
            Arc::clone(&stats),
        ));

        let hierarchy = Arc::new(RoleHierarchyManager::new());
        let evaluator = Arc::new(PermissionEvaluator::new(
            Arc::clone(&hierarchy),
            cache.clone(),
            config.cache.ttl.rbac,
        ));
        let abilities = Arc::new(AbilityFactory::new(
            Arc::clone(&hierarchy),
            cache.clone(),
            config.cache.ttl.rbac,
        ));

        let api_keys = Arc::new(ApiKeyManager::new(
            Arc::clone(&backends.api_keys),
            cache.clone(),
            config.api_keys.clone(),
            &config.security,
        ));
        let pkce = Arc::new(PkceManager::new(cache.clone(), config.pkce.clone()));
        let synchronizer = Arc::new(SessionSynchronizer::new(cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&backends.cache),
            config.rate_limit.clone(),
            Arc::clone(&stats),
        ));
        let interceptor = Arc::new(AuthInterceptor::new(
            Arc::clone(&tokens),
            Arc::clone(&api_keys),
            Arc::clone(&sessions),
            Arc::clone(&pkce),
            InterceptorConfig::default(),
        ));

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = SessionSynchronizer::start(&synchronizer, &shutdown).await?;
        tasks.push(RefreshTokenManager::spawn_scheduler(
            &refresh,
            shutdown.subscribe(),
        ));

        info!(realm = %config.idp.realm, "Auth core initialized");
        Ok(Arc::new(Self {
            config,
            cache,
            idp,
            encryption,
            jwt,
            tokens,
            session_store,
            sessions,
            api_keys,
            hierarchy,
            evaluator,
            abilities,
            pkce,
            synchronizer,
            rate_limiter,
            interceptor,
            stats,
            stats_cache: tokio::sync::Mutex::new(None),
            shutdown,
            tasks: parking_lot::Mutex::new(tasks),
            pool: parking_lot::Mutex::new(None),
        }))
    }

    /// OIDC resource-owner-password ceremony, then session creation.
    pub async fn authenticate_with_password(
        &self,
        username: &str,
        password: &str,
        meta: RequestMeta,
    ) -> Result<AuthenticationSuccess> {
        let bundle = self.idp.token_password(username, password).await?;
        let userinfo = self.idp.userinfo(&bundle.access_token).await?;

        let mut roles: Vec<String> = userinfo
            .realm_access
            .roles
            .iter()
            .map(|r| format!("realm:{r}"))
            .collect();
        for access in userinfo.resource_access.values() {
            roles.extend(access.roles.iter().map(|r| format!("client:{r}")));
        }
        let principal = Principal {
            id: userinfo.sub.clone(),
            username: userinfo
                .preferred_username
                .clone()
                .unwrap_or_else(|| username.to_string()),
            email: userinfo.email.clone(),
            roles,
            permissions: Vec::new(),
            attributes: std::collections::HashMap::new(),
        };

        let session = self
            .sessions
            .create_session(CreateSessionOptions {
                user_id: principal.id.clone(),
                principal: Some(principal.clone()),
                idp_session_id: None,
                tokens: Some(bundle),
                meta,
                max_age_secs: None,
                metadata: serde_json::Map::new(),
            })
            .await?;

        self.stats.record_request();
        Ok(AuthenticationSuccess { session, principal })
    }

    /// OIDC authorization-code ceremony, PKCE-bound when `code_verifier`
    /// is present.
    pub async fn authenticate_with_code(
        &self,
        code: &str,
        redirect_uri: &str,
        meta: RequestMeta,
        code_verifier: Option<&str>,
    ) -> Result<AuthenticationSuccess> {
        let bundle = self.idp.token_code(code, redirect_uri, code_verifier).await?;
        let userinfo = self.idp.userinfo(&bundle.access_token).await?;

        let principal = Principal {
            id: userinfo.sub.clone(),
            username: userinfo
                .preferred_username
                .clone()
                .unwrap_or_else(|| userinfo.sub.clone()),
            email: userinfo.email.clone(),
            roles: userinfo
                .realm_access
                .roles
                .iter()
                .map(|r| format!("realm:{r}"))
                .collect(),
            permissions: Vec::new(),
            attributes: std::collections::HashMap::new(),
        };

        let session = self
            .sessions
            .create_session(CreateSessionOptions {
                user_id: principal.id.clone(),
                principal: Some(principal.clone()),
                idp_session_id: None,
                tokens: Some(bundle),
                meta,
                max_age_secs: None,
                metadata: serde_json::Map::new(),
            })
            .await?;

        self.stats.record_request();
        Ok(AuthenticationSuccess { session, principal })
    }

    /// Validate a session against the caller context.
    pub async fn validate_session(&self, session_id: &str, meta: &RequestMeta) -> SessionValidation {
        self.stats.record_request();
        self.sessions.validate_session(session_id, meta).await
    }

    /// Log out: destroy the local session (optionally every session of the
    /// user), optionally ending the IdP-side session first.
    pub async fn logout(&self, session_id: &str, opts: LogoutOptions) -> Result<()> {
        let session = self.session_store.retrieve(session_id).await?;

        if opts.from_idp {
            if let Some(refresh_token) = session.as_ref().and_then(|s| s.refresh_token.clone()) {
                if let Err(e) = self.idp.end_session(&refresh_token).await {
                    // Upstream logout is best-effort; local state still goes
                    warn!(error = %e, "IdP end-session failed");
                }
            }
        }

        self.sessions.destroy_session(session_id, "logout").await?;

        if opts.all_sessions {
            if let Some(user_id) = session.map(|s| s.user_id) {
                self.sessions.destroy_all_user_sessions(&user_id).await?;
            }
        }
        Ok(())
    }

    /// Admin wrapper: create an IdP user.
    pub async fn create_user(&self, user: &NewUser) -> Result<String> {
        self.idp.create_user(user).await
    }

    /// Admin wrapper: fetch an IdP user.
    pub async fn get_user(&self, user_id: &str) -> Result<AdminUser> {
        self.idp.get_user(user_id).await
    }

    /// Replace or extend the role hierarchy.
    pub fn update_role_hierarchy(
        &self,
        definitions: std::collections::HashMap<String, RoleDefinition>,
    ) {
        self.hierarchy.update_hierarchy(definitions);
    }

    /// Aggregate dependency health.
    pub async fn health_check(&self) -> HealthReport {
        HealthReport {
            idp: self.idp.health().await.is_ok(),
            cache: self.cache.ping().await.is_ok(),
            database: self.session_store.ping().await.is_ok(),
        }
    }

    /// Stats snapshot, cached for a few seconds with a single generator.
    pub async fn get_stats(&self) -> StatsReport {
        let mut guard = self.stats_cache.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.generated_at.elapsed() < STATS_TTL {
                return cached.report.clone();
            }
        }

        // Holding the lock makes this the single generator; concurrent
        // callers wait briefly and reuse the fresh snapshot
        let report = StatsReport {
            auth: self.stats.snapshot(),
            cache: self.cache.stats(),
            stream_connections: self.synchronizer.connection_count(),
        };
        *guard = Some(CachedStats {
            report: report.clone(),
            generated_at: Instant::now(),
        });
        report
    }

    /// Tear down: stop background tasks, destroy key material.
    pub async fn cleanup(&self) {
        let _ = self.shutdown.send(());
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.encryption.destroy();
        info!("Auth core shut down");
    }

    // ── Component accessors for transport glue ────────────────────────────

    /// Session manager.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    /// Token manager.
    #[must_use]
    pub fn tokens(&self) -> Arc<TokenManager> {
        Arc::clone(&self.tokens)
    }

    /// JWT validator.
    #[must_use]
    pub fn jwt(&self) -> Arc<JwtValidator> {
        Arc::clone(&self.jwt)
    }

    /// API key manager.
    #[must_use]
    pub fn api_keys(&self) -> Arc<ApiKeyManager> {
        Arc::clone(&self.api_keys)
    }

    /// PKCE manager.
    #[must_use]
    pub fn pkce(&self) -> Arc<PkceManager> {
        Arc::clone(&self.pkce)
    }

    /// Permission evaluator.
    #[must_use]
    pub fn permissions(&self) -> Arc<PermissionEvaluator> {
        Arc::clone(&self.evaluator)
    }

    /// Ability factory.
    #[must_use]
    pub fn abilities(&self) -> Arc<AbilityFactory> {
        Arc::clone(&self.abilities)
    }

    /// Session synchronizer.
    #[must_use]
    pub fn synchronizer(&self) -> Arc<SessionSynchronizer> {
        Arc::clone(&self.synchronizer)
    }

    /// Rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.rate_limiter)
    }

    /// Request-protocol auth interceptor.
    #[must_use]
    pub fn interceptor(&self) -> Arc<AuthInterceptor> {
        Arc::clone(&self.interceptor)
    }

    /// The loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl std::fmt::Debug for IntegrationFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationFacade")
            .field("realm", &self.config.idp.realm)
            .finish_non_exhaustive()
    }
}
