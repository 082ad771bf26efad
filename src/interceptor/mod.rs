//! Credential extraction and principal attachment for both protocols.

mod http;
mod stream;

pub use http::{AuthInterceptor, InterceptorConfig, SessionIdExt, axum_auth_middleware};
pub use stream::{MessageRequirement, StreamAuthInterceptor, auth_error_frame, rate_limit_error_frame};

use std::collections::HashMap;

use crate::middleware::ChainContext;
use crate::principal::AuthResult;
use crate::session::StreamConnection;

/// Request-protocol context flowing through the middleware chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id echoed in error envelopes.
    pub request_id: String,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: axum::http::HeaderMap,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Decoded cookies.
    pub cookies: HashMap<String, String>,
    /// Caller IP.
    pub ip: String,
    /// Caller user agent.
    pub user_agent: String,
    /// Attached after successful authentication.
    pub auth: Option<AuthResult>,
    /// Session id the request authenticated with, when applicable.
    pub session_id: Option<String>,
}

impl RequestContext {
    /// Empty context for `path`; headers and identity filled by the caller.
    #[must_use]
    pub fn new(method: &str, path: &str, ip: &str, user_agent: &str) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: axum::http::HeaderMap::new(),
            query: HashMap::new(),
            cookies: HashMap::new(),
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            auth: None,
            session_id: None,
        }
    }

    /// A header value as UTF-8, when present and decodable.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl ChainContext for RequestContext {
    fn route(&self) -> &str {
        &self.path
    }
}

/// Stream-protocol context: the connection plus the latest inbound message.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Connection metadata.
    pub connection: StreamConnection,
    /// Message type token (`send_message`, `ping`, …).
    pub message_type: String,
    /// Full message payload.
    pub message: serde_json::Value,
    /// Attached after successful authentication.
    pub auth: Option<AuthResult>,
}

impl ChainContext for StreamContext {
    fn route(&self) -> &str {
        &self.message_type
    }
}
