//! Cross-protocol session synchronization.
//!
//! Bridges the request and stream protocols over cache pub/sub: a session
//! change made on one protocol is fanned out to every stream connection
//! registered for that session, excluding the connection that originated the
//! change (no echo loops). On deletion/expiry the affected connections are
//! notified, then closed with the policy-violation code shortly after so
//! clients can render the notification first.
//!
//! Connections are resolved through an id-keyed registry; connection objects
//! own their callbacks and hold no back-pointers to the synchronizer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::error::log_digest;
use crate::principal::AuthMethod;
use crate::Result;

/// Channel for in-place session updates.
pub const SESSION_UPDATES_CHANNEL: &str = "session:updates";
/// Channel for session creations.
pub const SESSION_CREATED_CHANNEL: &str = "session:created";
/// Channel for explicit session deletions.
pub const SESSION_DELETED_CHANNEL: &str = "session:deleted";
/// Channel for sessions that lapsed.
pub const SESSION_EXPIRED_CHANNEL: &str = "session:expired";

/// Close code for policy violations (auth/session failures).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Delay between the sync notification and the forced close, giving the
/// client a chance to render the reason.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Abstract stream connection capability.
///
/// The transport layer implements this; the core only needs `send` and
/// `close`.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Deliver one text frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Close the connection.
    async fn close(&self, code: u16, reason: String);
}

/// Metadata for one live stream connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConnection {
    /// Connection id.
    pub connection_id: String,
    /// Bound session, when authenticated via session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Authenticated user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Deployment-defined client id.
    pub client_id: String,
    /// Connect instant.
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity.
    pub last_activity: DateTime<Utc>,
    /// How the connection authenticated.
    pub auth_method: AuthMethod,
    /// Permissions granted to the connection.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Scopes granted to the connection.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Event published on the session channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Session the event concerns.
    pub session_id: String,
    /// Owning user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Field updates (update events only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updates: Option<serde_json::Value>,
    /// Reason (delete events only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Protocol that originated the event (`http` / `stream`).
    pub source: String,
    /// Connection to exclude from fan-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_connection_id: Option<String>,
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Pub/sub bridge between protocols.
pub struct SessionSynchronizer {
    cache: CacheFacade,
    /// `connection_id` → transport handle.
    handles: DashMap<String, Arc<dyn Connection>>,
    /// `connection_id` → metadata.
    connections: DashMap<String, StreamConnection>,
    /// `session_id` → connection ids.
    session_index: DashMap<String, HashSet<String>>,
}

impl SessionSynchronizer {
    /// Create a synchronizer over the shared cache.
    #[must_use]
    pub fn new(cache: CacheFacade) -> Self {
        Self {
            cache,
            handles: DashMap::new(),
            connections: DashMap::new(),
            session_index: DashMap::new(),
        }
    }

    /// Subscribe to the session channels and spawn the dispatch loops.
    /// Each loop drains and exits when `shutdown` fires.
    pub async fn start(
        synchronizer: &Arc<Self>,
        shutdown: &tokio::sync::broadcast::Sender<()>,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(3);
        for channel in [
            SESSION_UPDATES_CHANNEL,
            SESSION_DELETED_CHANNEL,
            SESSION_EXPIRED_CHANNEL,
        ] {
            let mut subscription = synchronizer.cache.subscribe(channel).await?;
            let sync = Arc::clone(synchronizer);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = subscription.recv() => {
                            let Some(message) = message else { break };
                            sync.dispatch(&message.channel, &message.payload).await;
                        }
                        _ = shutdown_rx.recv() => {
                            info!(channel = %subscription.channel, "Session synchronizer loop shutting down");
                            break;
                        }
                    }
                }
            }));
        }
        Ok(handles)
    }

    /// Register a connection. Indexed by session when one is bound.
    pub fn register(&self, meta: StreamConnection, handle: Arc<dyn Connection>) {
        if let Some(session_id) = &meta.session_id {
            self.session_index
                .entry(session_id.clone())
                .or_default()
                .insert(meta.connection_id.clone());
        }
        self.handles.insert(meta.connection_id.clone(), handle);
        debug!(
            connection = %meta.connection_id,
            session = %meta.session_id.as_deref().map(log_digest).unwrap_or_default(),
            "Stream connection registered"
        );
        self.connections.insert(meta.connection_id.clone(), meta);
    }

    /// Unregister a connection; the last connection of a session removes
    /// the index entry entirely.
    pub fn unregister(&self, connection_id: &str) {
        let meta = self.connections.remove(connection_id).map(|(_, m)| m);
        self.handles.remove(connection_id);

        if let Some(session_id) = meta.and_then(|m| m.session_id) {
            if let Some(mut set) = self.session_index.get_mut(&session_id) {
                set.remove(connection_id);
                let empty = set.is_empty();
                drop(set);
                if empty {
                    self.session_index.remove(&session_id);
                }
            }
        }
    }

    /// Metadata for a registered connection.
    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<StreamConnection> {
        self.connections.get(connection_id).map(|m| m.clone())
    }

    /// Connection ids registered for `session_id`.
    #[must_use]
    pub fn connections_for(&self, session_id: &str) -> Vec<String> {
        self.session_index
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.handles.len()
    }

    /// Publish a session update for other nodes and protocols.
    ///
    /// The origin connection is excluded when the event fans back out.
    pub async fn publish_session_update(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        updates: serde_json::Value,
        source: &str,
        origin_connection_id: Option<&str>,
    ) {
        self.cache
            .publish(
                SESSION_UPDATES_CHANNEL,
                &SessionEvent {
                    session_id: session_id.to_string(),
                    user_id: user_id.map(String::from),
                    updates: Some(updates),
                    reason: None,
                    source: source.to_string(),
                    origin_connection_id: origin_connection_id.map(String::from),
                    timestamp: Utc::now(),
                },
            )
            .await;
    }

    /// Handle one event from a session channel.
    async fn dispatch(&self, channel: &str, payload: &str) {
        let event: SessionEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel, error = %e, "Dropping undecodable session event");
                return;
            }
        };

        match channel {
            SESSION_UPDATES_CHANNEL => self.fan_out_update(&event).await,
            SESSION_DELETED_CHANNEL | SESSION_EXPIRED_CHANNEL => {
                let kind = if channel == SESSION_DELETED_CHANNEL {
                    "session:deleted"
                } else {
                    "session:expired"
                };
                self.fan_out_termination(&event, kind).await;
            }
            other => debug!(channel = other, "Ignoring event on unhandled channel"),
        }
    }

    async fn fan_out_update(&self, event: &SessionEvent) {
        let frame = json!({
            "type": "session:updated",
            "sessionId": event.session_id,
            "updates": event.updates,
            "timestamp": event.timestamp,
        })
        .to_string();

        for connection_id in self.connections_for(&event.session_id) {
            if Some(connection_id.as_str()) == event.origin_connection_id.as_deref() {
                continue;
            }
            self.send_to(&connection_id, frame.clone()).await;
        }
    }

    async fn fan_out_termination(&self, event: &SessionEvent, kind: &str) {
        let frame = json!({
            "type": kind,
            "sessionId": event.session_id,
            "timestamp": event.timestamp,
        })
        .to_string();

        let connection_ids = self.connections_for(&event.session_id);
        for connection_id in &connection_ids {
            self.send_to(connection_id, frame.clone()).await;
        }

        // Notify first, close shortly after
        let handles: Vec<(String, Arc<dyn Connection>)> = connection_ids
            .iter()
            .filter_map(|id| self.handles.get(id).map(|h| (id.clone(), Arc::clone(&h))))
            .collect();
        self.session_index.remove(&event.session_id);

        if !handles.is_empty() {
            let reason = kind.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(CLOSE_GRACE).await;
                for (id, handle) in handles {
                    debug!(connection = %id, "Closing connection after session termination");
                    handle.close(CLOSE_POLICY_VIOLATION, reason.clone()).await;
                }
            });
        }
    }

    async fn send_to(&self, connection_id: &str, frame: String) {
        let handle = self.handles.get(connection_id).map(|h| Arc::clone(&h));
        if let Some(handle) = handle {
            if let Err(e) = handle.send(frame).await {
                warn!(connection = %connection_id, error = %e, "Failed to deliver sync frame");
            }
        }
    }
}

impl std::fmt::Debug for SessionSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSynchronizer")
            .field("connections", &self.handles.len())
            .field("sessions", &self.session_index.len())
            .finish_non_exhaustive()
    }
}
