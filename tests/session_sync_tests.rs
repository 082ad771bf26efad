//! Cross-protocol session synchronization scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use authgate::cache::{CacheFacade, MemoryStore};
use authgate::config::{CacheTtlConfig, IdpConfig, JwtConfig, SessionConfig};
use authgate::crypto::EncryptionManager;
use authgate::idp::IdpClient;
use authgate::middleware::RetryPolicy;
use authgate::principal::AuthMethod;
use authgate::session::{
    Connection, CreateSessionOptions, MemorySessionRepository, RequestMeta, SessionManager,
    SessionStore, SessionSynchronizer, StreamConnection,
};
use authgate::stats::AuthStats;
use authgate::token::{JwtValidator, TokenIntrospector, TokenManager};
use authgate::Result;
use chrono::Utc;

struct RecordingConnection {
    frames: Mutex<Vec<String>>,
    closes: Mutex<Vec<(u16, String)>>,
}

impl RecordingConnection {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn send(&self, frame: String) -> Result<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
    async fn close(&self, code: u16, reason: String) {
        self.closes.lock().unwrap().push((code, reason));
    }
}

struct Fixture {
    manager: Arc<SessionManager>,
    synchronizer: Arc<SessionSynchronizer>,
    _shutdown: tokio::sync::broadcast::Sender<()>,
}

async fn fixture() -> Fixture {
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
    let tokens = Arc::new(TokenManager::new(
        Arc::new(JwtValidator::new(
            &JwtConfig::default(),
            "https://id.example.com/certs".to_string(),
            reqwest::Client::new(),
        )),
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
    let manager = Arc::new(SessionManager::new(
        store,
        tokens,
        idp,
        cache.clone(),
        SessionConfig::default(),
        60,
        stats,
    ));

    let synchronizer = Arc::new(SessionSynchronizer::new(cache));
    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    SessionSynchronizer::start(&synchronizer, &shutdown)
        .await
        .unwrap();

    Fixture {
        manager,
        synchronizer,
        _shutdown: shutdown,
    }
}

fn stream_meta(connection_id: &str, session_id: &str) -> StreamConnection {
    StreamConnection {
        connection_id: connection_id.to_string(),
        session_id: Some(session_id.to_string()),
        user_id: Some("u1".to_string()),
        client_id: "web".to_string(),
        connected_at: Utc::now(),
        last_activity: Utc::now(),
        auth_method: AuthMethod::Session,
        permissions: vec![],
        scopes: vec![],
    }
}

fn request_meta() -> RequestMeta {
    RequestMeta {
        ip: "10.0.0.1".to_string(),
        user_agent: "UA/1".to_string(),
    }
}

fn create_opts() -> CreateSessionOptions {
    CreateSessionOptions {
        user_id: "u1".to_string(),
        principal: None,
        idp_session_id: None,
        tokens: None,
        meta: request_meta(),
        max_age_secs: None,
        metadata: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn http_logout_reaches_stream_connection_and_closes_it() {
    let fx = fixture().await;

    // A stream connection is registered for the session
    let session = fx.manager.create_session(create_opts()).await.unwrap();
    let conn = RecordingConnection::new();
    fx.synchronizer
        .register(stream_meta("c1", &session.session_id), conn.clone());

    // Request-protocol logout destroys the session
    assert!(fx
        .manager
        .destroy_session(&session.session_id, "logout")
        .await
        .unwrap());

    // The connection sees the deletion frame, then the 1008 close
    tokio::time::sleep(Duration::from_millis(300)).await;

    let frames = conn.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 1, "expected exactly one sync frame");
    assert!(frames[0].contains("session:deleted"));
    assert!(frames[0].contains(&session.session_id));

    let closes = conn.closes.lock().unwrap().clone();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].0, 1008);
}

#[tokio::test]
async fn update_excludes_origin_connection() {
    let fx = fixture().await;
    let session = fx.manager.create_session(create_opts()).await.unwrap();

    let origin = RecordingConnection::new();
    let passive = RecordingConnection::new();
    fx.synchronizer
        .register(stream_meta("origin", &session.session_id), origin.clone());
    fx.synchronizer
        .register(stream_meta("passive", &session.session_id), passive.clone());

    fx.synchronizer
        .publish_session_update(
            &session.session_id,
            Some("u1"),
            serde_json::json!({"locale": "fi"}),
            "stream",
            Some("origin"),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(origin.frames.lock().unwrap().is_empty());
    let frames = passive.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("session:updated"));
    assert!(frames[0].contains("locale"));
}

#[tokio::test]
async fn expiry_observed_on_validate_notifies_stream() {
    let fx = fixture().await;
    let session = fx
        .manager
        .create_session(CreateSessionOptions {
            max_age_secs: Some(0),
            ..create_opts()
        })
        .await
        .unwrap();

    let conn = RecordingConnection::new();
    fx.synchronizer
        .register(stream_meta("c1", &session.session_id), conn.clone());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let outcome = fx
        .manager
        .validate_session(&session.session_id, &request_meta())
        .await;
    assert!(!outcome.valid);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = conn.frames.lock().unwrap().clone();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("session:expired"));
    assert_eq!(conn.closes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rotation_closes_connections_bound_to_the_old_sid() {
    let fx = fixture().await;
    let session = fx.manager.create_session(create_opts()).await.unwrap();

    let conn = RecordingConnection::new();
    fx.synchronizer
        .register(stream_meta("c1", &session.session_id), conn.clone());

    let rotated = fx
        .manager
        .rotate_session(&session.session_id, &request_meta())
        .await
        .unwrap();
    assert_ne!(rotated.session_id, session.session_id);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = conn.frames.lock().unwrap().clone();
    assert!(frames.iter().any(|f| f.contains("session:deleted")));
}
