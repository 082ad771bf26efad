//! Error types for the auth core.
//!
//! The taxonomy distinguishes caller mistakes (`InvalidRequest`,
//! `Unauthorized`, permission and session failures) from infrastructure
//! trouble (`UpstreamUnavailable`, `CacheUnavailable`, `Database`). Only a
//! fixed allow-list of messages is ever echoed to clients; everything else
//! collapses to a generic internal error while the full chain is logged with
//! the request correlation id.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for the auth core.
pub type Result<T> = std::result::Result<T, Error>;

/// Auth core errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or incomplete input (bad verifier format, missing context).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No valid credentials were presented.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The presented token has expired.
    #[error("Token expired")]
    TokenExpired,

    /// The presented token failed validation.
    #[error("Token invalid: {0}")]
    TokenInvalid(String),

    /// Authenticated, but the principal lacks the required permission.
    #[error("Insufficient permissions: {0}")]
    InsufficientPermissions(String),

    /// No active session exists for the given id.
    #[error("Session not found")]
    SessionNotFound,

    /// The session exists but is past its expiry.
    #[error("Session expired")]
    SessionExpired,

    /// The session failed a security check (e.g. IP mismatch in strict mode).
    #[error("Session security violation: {0}")]
    SessionSecurityViolation(String),

    /// The per-user concurrent session limit was reached.
    #[error("Concurrent session limit reached ({0})")]
    ConcurrentLimit(u32),

    /// The caller exceeded a rate limit.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        /// Seconds until the next window boundary.
        retry_after_secs: u64,
    },

    /// The identity provider or another upstream returned an error.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An outbound call exceeded its deadline.
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The cache tier could not be reached.
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The relational store could not be reached or rejected a statement.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error talking to the IdP.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal invariant violation or unclassified failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::CacheUnavailable(e.to_string())
    }
}

impl Error {
    /// Stable machine-readable error code, one per taxonomy kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid(_) => "token_invalid",
            Self::InsufficientPermissions(_) => "insufficient_permissions",
            Self::SessionNotFound => "session_not_found",
            Self::SessionExpired => "session_expired",
            Self::SessionSecurityViolation(_) => "session_security_violation",
            Self::ConcurrentLimit(_) => "concurrent_limit",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::UpstreamUnavailable(_) | Self::Http(_) => "upstream_unavailable",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Database(_) => "db_unavailable",
            Self::Json(_) | Self::Internal(_) => "internal",
        }
    }

    /// HTTP status code for the request protocol.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Unauthorized(_)
            | Self::TokenExpired
            | Self::TokenInvalid(_)
            | Self::SessionNotFound
            | Self::SessionExpired
            | Self::SessionSecurityViolation(_) => 401,
            Self::InsufficientPermissions(_) => 403,
            Self::ConcurrentLimit(_) => 409,
            Self::RateLimitExceeded { .. } => 429,
            Self::UpstreamUnavailable(_)
            | Self::UpstreamTimeout(_)
            | Self::Http(_)
            | Self::CacheUnavailable(_)
            | Self::Database(_) => 503,
            Self::Json(_) | Self::Internal(_) => 500,
        }
    }

    /// Message safe to echo to clients.
    ///
    /// Caller-facing kinds keep their message; infrastructure and internal
    /// kinds collapse to a generic string so nothing about upstreams, SQL or
    /// cache topology leaks across the boundary.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::InvalidRequest(m)
            | Self::Unauthorized(m)
            | Self::InsufficientPermissions(m) => m.clone(),
            Self::TokenExpired => "token expired".to_string(),
            Self::TokenInvalid(_) => "token invalid".to_string(),
            Self::SessionNotFound => "session not found".to_string(),
            Self::SessionExpired => "session expired".to_string(),
            Self::SessionSecurityViolation(_) => "session terminated".to_string(),
            Self::ConcurrentLimit(max) => {
                format!("concurrent session limit ({max}) reached")
            }
            Self::RateLimitExceeded { retry_after_secs } => {
                format!("rate limit exceeded, retry after {retry_after_secs}s")
            }
            _ => "internal server error".to_string(),
        }
    }

    /// Whether the retry helper should re-attempt the failed operation.
    ///
    /// Only transport-level failures are retryable; credential, permission
    /// and validation failures are reported as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_)
                | Self::UpstreamTimeout(_)
                | Self::Http(_)
                | Self::CacheUnavailable(_)
        )
    }

    /// Seconds the caller should wait before retrying, when applicable.
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// Sanitized error envelope returned to clients on the request protocol.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Stable error code (taxonomy kind).
    pub error: &'static str,
    /// Sanitized human-readable message.
    pub message: String,
    /// HTTP status code.
    pub code: u16,
    /// Request correlation id for support/debugging.
    pub request_id: String,
    /// Seconds until retry is allowed (rate limits only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorEnvelope {
    /// Build the client-facing envelope for `error`, tagged with `request_id`.
    #[must_use]
    pub fn from_error(error: &Error, request_id: impl Into<String>) -> Self {
        Self {
            error: error.code(),
            message: error.client_message(),
            code: error.http_status(),
            request_id: request_id.into(),
            retry_after: error.retry_after(),
        }
    }
}

/// Short digest of a sensitive identifier, safe for diagnostics.
///
/// Raw tokens, session ids and usernames must never be logged; this renders
/// `sha256(value)[:8] + "..."` instead.
#[must_use]
pub fn log_digest(value: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    format!("{}...", &hex::encode(digest)[..8])
}
