//! End-to-end authentication ceremonies against a mocked IdP.

use std::time::Duration;

use authgate::config::{Config, IdpConfig, JwtConfig, SessionConfig};
use authgate::crypto::EncryptionManager;
use authgate::facade::{Backends, IntegrationFacade, LogoutOptions};
use authgate::principal::TokenBundle;
use authgate::rbac::RoleDefinition;
use authgate::session::{CreateSessionOptions, RequestMeta};
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_idp() -> MockServer {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/realms/acme/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{base}/realms/acme"),
            "authorization_endpoint": format!("{base}/realms/acme/auth"),
            "token_endpoint": format!("{base}/realms/acme/token"),
            "userinfo_endpoint": format!("{base}/realms/acme/userinfo"),
            "jwks_uri": format!("{base}/realms/acme/certs"),
            "introspection_endpoint": format!("{base}/realms/acme/introspect"),
            "end_session_endpoint": format!("{base}/realms/acme/logout"),
            "id_token_signing_alg_values_supported": ["RS256"]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/realms/acme/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": []})))
        .mount(&server)
        .await;

    server
}

fn config(server: &MockServer) -> Config {
    Config {
        idp: IdpConfig {
            server_url: server.uri(),
            realm: "acme".to_string(),
            client_id: "gateway".to_string(),
            client_secret: Some("s3cret".to_string()),
            ..IdpConfig::default()
        },
        jwt: JwtConfig {
            issuer: format!("{}/realms/acme", server.uri()),
            audience: "gateway".to_string(),
            ..JwtConfig::default()
        },
        session: SessionConfig {
            max_concurrent_sessions: 2,
            ..SessionConfig::default()
        },
        encryption: authgate::config::EncryptionConfig {
            key: Some(EncryptionManager::generate_master_key()),
            ..authgate::config::EncryptionConfig::default()
        },
        ..Config::default()
    }
}

fn meta() -> RequestMeta {
    RequestMeta {
        ip: "10.0.0.1".to_string(),
        user_agent: "UA/1".to_string(),
    }
}

#[tokio::test]
async fn password_login_then_protected_call() {
    let server = mock_idp().await;

    Mock::given(method("POST"))
        .and(path("/realms/acme/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "opaque-access-1",
            "refresh_token": "rt1",
            "expires_in": 300,
            "token_type": "Bearer",
            "scope": "openid"
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/realms/acme/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "u1",
            "preferred_username": "alice",
            "realm_access": {"roles": ["user"]}
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/realms/acme/introspect"))
        .and(body_string_contains("opaque-access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "sub": "u1",
            "username": "alice",
            "exp": 4_102_444_800u64,
            "realm_access": {"roles": ["user"]}
        })))
        .mount(&server)
        .await;

    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();

    // Login
    let success = facade
        .authenticate_with_password("alice", "Pw0rdXYZ!", meta())
        .await
        .unwrap();
    assert_eq!(success.principal.id, "u1");
    assert_eq!(success.principal.username, "alice");
    assert!(success.principal.has_role("user"));
    assert!(!success.session.session_id.is_empty());
    assert_eq!(success.session.user_id, "u1");

    // The store holds exactly one active session for u1
    let active = facade
        .sessions()
        .store()
        .get_user_sessions("u1")
        .await
        .unwrap();
    assert_eq!(active.len(), 1);

    // Follow-up request: the session validates and the role gate admits
    let outcome = facade
        .validate_session(&success.session.session_id, &meta())
        .await;
    assert!(outcome.valid, "error: {:?}", outcome.error);

    facade.update_role_hierarchy(
        [(
            "user".to_string(),
            RoleDefinition {
                name: "user".to_string(),
                permissions: vec!["orders:read".to_string()],
                ..RoleDefinition::default()
            },
        )]
        .into_iter()
        .collect(),
    );
    let decision = facade
        .permissions()
        .check(&success.principal, "orders", "read", None)
        .await;
    assert!(decision.allowed);
    assert_eq!(decision.reason, "authorized");

    facade.cleanup().await;
}

#[tokio::test]
async fn concurrent_session_cap_evicts_the_oldest() {
    let server = mock_idp().await;
    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();
    let sessions = facade.sessions();

    let opts = || CreateSessionOptions {
        user_id: "u2".to_string(),
        principal: None,
        idp_session_id: None,
        tokens: None,
        meta: meta(),
        max_age_secs: None,
        metadata: serde_json::Map::new(),
    };

    let first = sessions.create_session(opts()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = sessions.create_session(opts()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = sessions.create_session(opts()).await.unwrap();

    // Exactly two remain; the oldest is gone
    let active = sessions.store().get_user_sessions("u2").await.unwrap();
    assert_eq!(active.len(), 2);
    let ids: Vec<&str> = active.iter().map(|s| s.session_id.as_str()).collect();
    assert!(!ids.contains(&first.session_id.as_str()));
    assert!(ids.contains(&second.session_id.as_str()));
    assert!(ids.contains(&third.session_id.as_str()));

    facade.cleanup().await;
}

#[tokio::test]
async fn validate_refreshes_expired_access_token() {
    let server = mock_idp().await;

    // Old access token: introspection says inactive
    Mock::given(method("POST"))
        .and(path("/realms/acme/introspect"))
        .and(body_string_contains("expired-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .mount(&server)
        .await;

    // Refresh grant issues fresh tokens
    Mock::given(method("POST"))
        .and(path("/realms/acme/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-access",
            "refresh_token": "rt2",
            "expires_in": 300,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;

    // The fresh token introspects as active
    Mock::given(method("POST"))
        .and(path("/realms/acme/introspect"))
        .and(body_string_contains("fresh-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "sub": "u1",
            "username": "alice",
            "exp": 4_102_444_800u64
        })))
        .mount(&server)
        .await;

    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();

    let session = facade
        .sessions()
        .create_session(CreateSessionOptions {
            user_id: "u1".to_string(),
            principal: None,
            idp_session_id: None,
            tokens: Some(TokenBundle {
                access_token: "expired-access".to_string(),
                refresh_token: Some("rt-valid".to_string()),
                id_token: None,
                access_expires_at: Utc::now() - chrono::Duration::seconds(10),
                refresh_expires_at: Some(Utc::now() + chrono::Duration::hours(8)),
                token_type: "bearer".to_string(),
                scopes: vec![],
            }),
            meta: meta(),
            max_age_secs: None,
            metadata: serde_json::Map::new(),
        })
        .await
        .unwrap();

    let outcome = facade.validate_session(&session.session_id, &meta()).await;
    assert!(outcome.valid, "error: {:?}", outcome.error);
    assert!(!outcome.requires_token_refresh);

    // The store now holds the fresh token pair
    let stored = facade
        .sessions()
        .store()
        .retrieve(&session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token.as_deref(), Some("fresh-access"));
    assert_eq!(stored.refresh_token.as_deref(), Some("rt2"));

    facade.cleanup().await;
}

#[tokio::test]
async fn logout_destroys_locally_and_ends_idp_session() {
    let server = mock_idp().await;

    Mock::given(method("POST"))
        .and(path("/realms/acme/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();

    let session = facade
        .sessions()
        .create_session(CreateSessionOptions {
            user_id: "u9".to_string(),
            principal: None,
            idp_session_id: None,
            tokens: Some(TokenBundle {
                access_token: "at".to_string(),
                refresh_token: Some("rt-logout".to_string()),
                id_token: None,
                access_expires_at: Utc::now() + chrono::Duration::seconds(300),
                refresh_expires_at: Some(Utc::now() + chrono::Duration::hours(8)),
                token_type: "bearer".to_string(),
                scopes: vec![],
            }),
            meta: meta(),
            max_age_secs: None,
            metadata: serde_json::Map::new(),
        })
        .await
        .unwrap();

    facade
        .logout(
            &session.session_id,
            LogoutOptions {
                from_idp: true,
                all_sessions: false,
            },
        )
        .await
        .unwrap();

    let outcome = facade.validate_session(&session.session_id, &meta()).await;
    assert!(!outcome.valid);

    facade.cleanup().await;
}

#[tokio::test]
async fn health_and_stats_report() {
    let server = mock_idp().await;
    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();

    let health = facade.health_check().await;
    assert!(health.healthy(), "report: {health:?}");

    let stats = facade.get_stats().await;
    assert_eq!(stats.stream_connections, 0);
    // A second read within the TTL serves the cached snapshot
    let again = facade.get_stats().await;
    assert_eq!(stats.auth.requests, again.auth.requests);

    facade.cleanup().await;
}

#[tokio::test]
async fn bad_credentials_surface_as_unauthorized() {
    let server = mock_idp().await;

    Mock::given(method("POST"))
        .and(path("/realms/acme/token"))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid user credentials"
        })))
        .mount(&server)
        .await;

    let facade = IntegrationFacade::initialize(config(&server), Backends::in_memory())
        .await
        .unwrap();

    let result = facade
        .authenticate_with_password("alice", "wrong", meta())
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.code(), "unauthorized");
    // Sanitized: the IdP's error body is not echoed
    assert_eq!(err.client_message(), "invalid credentials");

    facade.cleanup().await;
}
