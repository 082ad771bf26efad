//! Server-side session lifecycle: persistence, validation, rotation,
//! cross-protocol synchronization.

mod manager;
mod store;
mod sync;

pub use manager::{CreateSessionOptions, RequestMeta, SessionManager, SessionValidation};
pub use store::{
    MemorySessionRepository, PgSessionRepository, SessionRecord, SessionRepository, SessionStore,
};
pub use sync::{
    Connection, SESSION_CREATED_CHANNEL, SESSION_DELETED_CHANNEL, SESSION_EXPIRED_CHANNEL,
    SESSION_UPDATES_CHANNEL, SessionEvent, SessionSynchronizer, StreamConnection,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::principal::Principal;

/// One server-side session, tokens in the clear.
///
/// This is the in-process view; tokens are encrypted before they reach the
/// repository or the cache. Invariants:
/// `created_at ≤ last_accessed_at ≤ expires_at` and
/// `expires_at − created_at ≤ configured max age`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session id (`<uuid>.<base36 millis>`, ≥128 bits entropy).
    pub session_id: String,
    /// Owning user id.
    pub user_id: String,
    /// Principal snapshot taken at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    /// IdP-side session id, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idp_session_id: Option<String>,
    /// Bearer access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Refresh token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// OIDC id token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Access token expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Refresh token expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Hash of IP + UA + creation time; session-theft heuristic.
    pub fingerprint: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last validated-access instant (write-throttled).
    pub last_accessed_at: DateTime<Utc>,
    /// Hard expiry.
    pub expires_at: DateTime<Utc>,
    /// IP the session was created from.
    pub ip_address: String,
    /// User agent the session was created with.
    pub user_agent: String,
    /// Open metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Whether the session is live.
    pub is_active: bool,
}

impl Session {
    /// Whether the session is past its hard expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}
