//! Interceptor pipeline: ordered middleware chain with circuit breaking,
//! retry and skip-path matching.

mod chain;
mod circuit_breaker;
mod retry;

pub use chain::{ChainContext, Middleware, MiddlewareChain, Next};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use retry::{RetryPolicy, with_retry};
