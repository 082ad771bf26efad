//! Authentication, authorization and session core for multi-protocol
//! service gateways.
//!
//! # Subsystems
//!
//! - **Token lifecycle**: signature-verified JWT validation with JWKS
//!   caching, introspection fallback, refresh scheduling, at-rest token
//!   encryption.
//! - **Session lifecycle**: creation, validation, rotation, atomic
//!   concurrent-session limits, cross-protocol synchronization over cache
//!   pub/sub.
//! - **RBAC/ABAC**: role hierarchy expansion with cycle detection, wildcard
//!   permission matching, compiled per-principal abilities.
//! - **PKCE** (RFC 7636): verifier/challenge/state generation and
//!   single-use validation.
//! - **Middleware & rate limiting**: priority-ordered interceptor chains
//!   with circuit breaking and retry, distributed sliding-window limits for
//!   request and stream traffic.
//!
//! [`facade::IntegrationFacade`] is the composition root; everything else
//! takes its collaborators by constructor injection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apikey;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod facade;
pub mod idp;
pub mod interceptor;
pub mod middleware;
pub mod pkce;
pub mod principal;
pub mod ratelimit;
pub mod rbac;
pub mod session;
pub mod stats;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
