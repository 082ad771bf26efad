//! Stream-protocol authentication and message-level authorization.
//!
//! The handshake reuses the request-protocol extraction order (the upgrade
//! request carries the same headers/query surface). After the connection is
//! live, each inbound message is authorized against a per-message-type
//! policy; failures emit an `auth_error` frame and, unless configured
//! otherwise, close the connection with the policy-violation code.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{AuthInterceptor, RequestContext, StreamContext};
use crate::middleware::{Middleware, Next};
use crate::principal::AuthMethod;
use crate::rbac::permission_matches;
use crate::session::StreamConnection;
use crate::{Error, Result};

/// Required credentials for one message type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRequirement {
    /// Permissions, any one of which satisfies the requirement.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Roles, any one of which satisfies the requirement.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Stream-protocol interceptor.
pub struct StreamAuthInterceptor {
    http: Arc<AuthInterceptor>,
    /// Message type → requirement.
    policies: HashMap<String, MessageRequirement>,
    /// Message types exempt from authorization.
    exempt: HashSet<String>,
    /// Close the connection on authorization failure.
    close_on_failure: bool,
}

impl StreamAuthInterceptor {
    /// Create an interceptor; `ping`/`pong` start exempt.
    #[must_use]
    pub fn new(http: Arc<AuthInterceptor>, policies: HashMap<String, MessageRequirement>) -> Self {
        let exempt: HashSet<String> = ["ping", "pong"].iter().map(|s| (*s).to_string()).collect();
        Self {
            http,
            policies,
            exempt,
            close_on_failure: true,
        }
    }

    /// Declare a message type auth-exempt.
    pub fn exempt_message_type(&mut self, message_type: &str) {
        self.exempt.insert(message_type.to_string());
    }

    /// Keep connections open on authorization failures.
    #[must_use]
    pub fn without_close_on_failure(mut self) -> Self {
        self.close_on_failure = false;
        self
    }

    /// Whether failed authorization should close the connection.
    #[must_use]
    pub fn closes_on_failure(&self) -> bool {
        self.close_on_failure
    }

    /// Authenticate a stream handshake and mint the connection record.
    pub async fn handshake(
        &self,
        ctx: &mut RequestContext,
        client_id: &str,
    ) -> Result<StreamConnection> {
        let result = self.http.authenticate(ctx).await?;
        let now = Utc::now();
        Ok(StreamConnection {
            connection_id: uuid::Uuid::new_v4().to_string(),
            session_id: ctx.session_id.clone(),
            user_id: (result.method != AuthMethod::Anonymous)
                .then(|| result.principal.id.clone()),
            client_id: client_id.to_string(),
            connected_at: now,
            last_activity: now,
            auth_method: result.method,
            permissions: result.principal.permissions.clone(),
            scopes: result.scopes.clone(),
        })
    }

    /// Authorize one inbound message.
    ///
    /// # Errors
    ///
    /// [`Error::Unauthorized`] when the type requires credentials and the
    /// connection is anonymous; [`Error::InsufficientPermissions`] when the
    /// connection lacks every required permission and role.
    pub fn authorize_message(&self, ctx: &StreamContext) -> Result<()> {
        if self.exempt.contains(&ctx.message_type) {
            return Ok(());
        }
        let Some(requirement) = self.policies.get(&ctx.message_type) else {
            return Ok(());
        };
        if requirement.permissions.is_empty() && requirement.roles.is_empty() {
            return Ok(());
        }

        if ctx.connection.auth_method == AuthMethod::Anonymous {
            return Err(Error::Unauthorized("authentication required".into()));
        }

        let permission_ok = requirement.permissions.iter().any(|required| {
            let (resource, action) = required.split_once(':').unwrap_or((required.as_str(), "*"));
            ctx.connection
                .permissions
                .iter()
                .any(|granted| permission_matches(granted, resource, action))
        });
        if permission_ok {
            return Ok(());
        }

        let role_ok = ctx.auth.as_ref().is_some_and(|auth| {
            requirement
                .roles
                .iter()
                .any(|role| auth.principal.has_role(role))
        });
        if role_ok {
            return Ok(());
        }

        debug!(
            message_type = %ctx.message_type,
            connection = %ctx.connection.connection_id,
            "Dropping message without required credentials"
        );
        Err(Error::InsufficientPermissions(format!(
            "message type {} requires elevated access",
            ctx.message_type
        )))
    }
}

#[async_trait]
impl Middleware<StreamContext> for StreamAuthInterceptor {
    fn name(&self) -> &str {
        "stream_auth"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn execute(&self, ctx: &mut StreamContext, next: Next<'_, StreamContext>) -> Result<()> {
        self.authorize_message(ctx)?;
        next.run(ctx).await
    }
}

impl std::fmt::Debug for StreamAuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAuthInterceptor")
            .field("policies", &self.policies.len())
            .field("close_on_failure", &self.close_on_failure)
            .finish_non_exhaustive()
    }
}

/// `auth_error` frame sent to a stream client.
#[must_use]
pub fn auth_error_frame(connection_id: &str, code: &str, message: &str) -> serde_json::Value {
    json!({
        "type": "auth_error",
        "error": {
            "code": code,
            "message": message,
            "timestamp": Utc::now(),
        },
        "connectionId": connection_id,
    })
}

/// `rate_limit_error` frame sent to a stream client.
#[must_use]
pub fn rate_limit_error_frame(connection_id: &str, retry_after_secs: u64) -> serde_json::Value {
    json!({
        "type": "rate_limit_error",
        "error": {
            "code": "RATE_LIMIT_EXCEEDED",
            "message": "message rate limit exceeded",
            "timestamp": Utc::now(),
            "retryAfter": retry_after_secs,
        },
        "connectionId": connection_id,
    })
}
