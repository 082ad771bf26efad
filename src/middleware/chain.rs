//! Ordered middleware pipeline.
//!
//! Middleware register with a name, priority and optional skip-path globs;
//! execution walks the entries in descending priority, letting each one
//! short-circuit by not calling [`Next::run`]. Every entry is guarded by its
//! own circuit breaker and may opt into retry for transient errors.
//!
//! The chain is generic over its context. The request and stream protocols
//! instantiate it with their own context types; the only requirement is a
//! [`ChainContext::route`] used for skip matching.

use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures::future::BoxFuture;
use glob::Pattern;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::MiddlewareConfig;
use crate::middleware::RetryPolicy;
use crate::{Error, Result};

/// Minimal view of a context the chain needs for skip matching.
pub trait ChainContext: Send {
    /// Request path or stream message type.
    fn route(&self) -> &str;
}

/// One interceptor in the pipeline.
#[async_trait]
pub trait Middleware<C: ChainContext>: Send + Sync + 'static {
    /// Unique middleware name (also names its circuit breaker).
    fn name(&self) -> &str;

    /// Higher priorities run first. Default 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Disabled middleware are skipped without consulting the breaker.
    fn enabled(&self) -> bool {
        true
    }

    /// Glob patterns of routes that bypass this middleware.
    fn skip_paths(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether transient errors from this middleware should be retried.
    fn retryable(&self) -> bool {
        false
    }

    /// Run the middleware. Call `next.run(ctx)` to continue the pipeline;
    /// returning without doing so short-circuits.
    async fn execute(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()>;
}

type HandlerFn<C> = dyn for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<()>> + Send + Sync;

struct Entry<C: ChainContext> {
    middleware: Arc<dyn Middleware<C>>,
    breaker: Arc<CircuitBreaker>,
    patterns: Vec<Pattern>,
    retry: RetryPolicy,
}

impl<C: ChainContext> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            middleware: Arc::clone(&self.middleware),
            breaker: Arc::clone(&self.breaker),
            patterns: self.patterns.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<C: ChainContext> Entry<C> {
    fn skips(&self, route: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(route))
    }
}

/// Continuation handed to each middleware.
pub struct Next<'a, C: ChainContext> {
    entries: &'a [Entry<C>],
    handler: &'a HandlerFn<C>,
}

impl<C: ChainContext> Clone for Next<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: ChainContext> Copy for Next<'_, C> {}

impl<'a, C: ChainContext + 'static> Next<'a, C> {
    /// Run the remainder of the pipeline, ending in the handler.
    pub fn run(self, ctx: &'a mut C) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut idx = 0;
            loop {
                let Some(entry) = self.entries.get(idx) else {
                    return (self.handler)(ctx).await;
                };
                idx += 1;

                if !entry.middleware.enabled() {
                    continue;
                }
                if entry.skips(ctx.route()) {
                    debug!(
                        middleware = entry.middleware.name(),
                        route = ctx.route(),
                        "Skip-path matched, passing through"
                    );
                    continue;
                }
                if !entry.breaker.can_proceed() {
                    warn!(
                        middleware = entry.middleware.name(),
                        "Circuit open, bypassing middleware"
                    );
                    continue;
                }

                let next = Next {
                    entries: &self.entries[idx..],
                    handler: self.handler,
                };
                let result = execute_with_retry(entry, ctx, next).await;
                match &result {
                    Ok(()) => entry.breaker.record_success(),
                    Err(e) => {
                        // Caller-facing denials are not middleware faults
                        if e.is_retryable() || matches!(e, Error::Internal(_)) {
                            entry.breaker.record_failure();
                        } else {
                            entry.breaker.record_success();
                        }
                    }
                }
                return result;
            }
        })
    }
}

async fn execute_with_retry<C: ChainContext + 'static>(
    entry: &Entry<C>,
    ctx: &mut C,
    next: Next<'_, C>,
) -> Result<()> {
    if !(entry.retry.is_enabled() && entry.middleware.retryable()) {
        return entry.middleware.execute(ctx, next).await;
    }

    let budget = entry.retry.attempt_budget();
    let mut pauses = entry.retry.pauses();

    let mut outcome = entry.middleware.execute(ctx, next).await;
    for spent in 1..budget {
        match &outcome {
            Ok(()) => break,
            Err(e) if !e.is_retryable() => break,
            Err(e) => {
                let Some(pause) = pauses.next_backoff() else {
                    break;
                };
                debug!(
                    middleware = entry.middleware.name(),
                    spent,
                    budget,
                    pause_ms = pause.as_millis(),
                    cause = %e,
                    "Transient middleware failure, pausing before next attempt"
                );
                tokio::time::sleep(pause).await;
            }
        }
        outcome = entry.middleware.execute(ctx, next).await;
    }
    outcome
}

/// Priority-ordered middleware pipeline for one protocol.
pub struct MiddlewareChain<C: ChainContext> {
    entries: RwLock<Vec<Entry<C>>>,
    config: MiddlewareConfig,
}

impl<C: ChainContext + 'static> MiddlewareChain<C> {
    /// Create an empty chain.
    #[must_use]
    pub fn new(config: MiddlewareConfig) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Register a middleware. The entry list is re-sorted by priority
    /// (higher first; registration order breaks ties).
    pub fn register(&self, middleware: Arc<dyn Middleware<C>>) {
        let patterns = middleware
            .skip_paths()
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(middleware = middleware.name(), pattern = %p, error = %e, "Ignoring invalid skip pattern");
                    None
                }
            })
            .collect();

        let entry = Entry {
            breaker: Arc::new(CircuitBreaker::new(
                middleware.name(),
                &self.config.circuit_breaker,
            )),
            patterns,
            retry: RetryPolicy::new(&self.config.retry),
            middleware,
        };

        let mut entries = self.entries.write();
        entries.push(entry);
        entries.sort_by_key(|e| std::cmp::Reverse(e.middleware.priority()));
    }

    /// Remove a middleware by name. Returns `true` when one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.middleware.name() != name);
        entries.len() != before
    }

    /// Number of registered middleware.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Run `ctx` through the pipeline, ending in `handler`.
    pub async fn run<F>(&self, ctx: &mut C, handler: F) -> Result<()>
    where
        F: for<'a> Fn(&'a mut C) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        // Snapshot so the lock is not held across awaits
        let entries = self.entries.read().clone();
        let next = Next {
            entries: &entries,
            handler: &handler,
        };
        next.run(ctx).await
    }

    /// Circuit breaker snapshots for every registered middleware.
    pub fn breaker_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.middleware.name().to_string(), e.breaker.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};

    struct TestCtx {
        path: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ChainContext for TestCtx {
        fn route(&self) -> &str {
            &self.path
        }
    }

    struct Recorder {
        name: String,
        priority: i32,
        skip: Vec<String>,
        short_circuit: bool,
    }

    #[async_trait]
    impl Middleware<TestCtx> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn skip_paths(&self) -> Vec<String> {
            self.skip.clone()
        }
        async fn execute(&self, ctx: &mut TestCtx, next: Next<'_, TestCtx>) -> Result<()> {
            ctx.log.lock().unwrap().push(self.name.clone());
            if self.short_circuit {
                return Err(Error::Unauthorized("blocked".into()));
            }
            next.run(ctx).await
        }
    }

    fn chain() -> MiddlewareChain<TestCtx> {
        MiddlewareChain::new(MiddlewareConfig::default())
    }

    fn ctx(path: &str) -> TestCtx {
        TestCtx {
            path: path.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn handler() -> impl for<'a> Fn(&'a mut TestCtx) -> BoxFuture<'a, Result<()>> + Send + Sync {
        |ctx: &mut TestCtx| {
            Box::pin(async move {
                ctx.log.lock().unwrap().push("handler".to_string());
                Ok(())
            })
        }
    }

    fn recorder(name: &str, priority: i32) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            priority,
            skip: Vec::new(),
            short_circuit: false,
        })
    }

    #[tokio::test]
    async fn runs_in_priority_order() {
        let chain = chain();
        chain.register(recorder("low", 1));
        chain.register(recorder("high", 100));
        chain.register(recorder("mid", 50));

        let mut ctx = ctx("/api/orders");
        chain.run(&mut ctx, handler()).await.unwrap();

        let log = ctx.log.lock().unwrap().clone();
        assert_eq!(log, vec!["high", "mid", "low", "handler"]);
    }

    #[tokio::test]
    async fn short_circuit_stops_the_pipeline() {
        let chain = chain();
        chain.register(Arc::new(Recorder {
            name: "gate".to_string(),
            priority: 10,
            skip: Vec::new(),
            short_circuit: true,
        }));
        chain.register(recorder("after", 1));

        let mut ctx = ctx("/api/orders");
        let result = chain.run(&mut ctx, handler()).await;

        assert!(matches!(result, Err(Error::Unauthorized(_))));
        let log = ctx.log.lock().unwrap().clone();
        assert_eq!(log, vec!["gate"]);
    }

    #[tokio::test]
    async fn skip_paths_bypass_matching_routes() {
        let chain = chain();
        chain.register(Arc::new(Recorder {
            name: "auth".to_string(),
            priority: 10,
            skip: vec!["/health*".to_string()],
            short_circuit: true,
        }));

        let mut ctx1 = ctx("/health/live");
        chain.run(&mut ctx1, handler()).await.unwrap();
        assert_eq!(ctx1.log.lock().unwrap().clone(), vec!["handler"]);

        let mut ctx2 = ctx("/api/orders");
        assert!(chain.run(&mut ctx2, handler()).await.is_err());
    }

    #[tokio::test]
    async fn open_breaker_bypasses_middleware() {
        struct Failing;
        #[async_trait]
        impl Middleware<TestCtx> for Failing {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn execute(&self, _ctx: &mut TestCtx, _next: Next<'_, TestCtx>) -> Result<()> {
                Err(Error::Internal("boom".into()))
            }
        }

        let config = MiddlewareConfig {
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout_secs: 60,
            },
            retry: RetryConfig {
                enabled: false,
                ..RetryConfig::default()
            },
        };
        let chain = MiddlewareChain::new(config);
        chain.register(Arc::new(Failing));

        // Two failures trip the breaker
        for _ in 0..2 {
            let mut ctx = ctx("/x");
            assert!(chain.run(&mut ctx, handler()).await.is_err());
        }

        // Third run bypasses the open breaker; the handler is reached
        let mut ctx = ctx("/x");
        chain.run(&mut ctx, handler()).await.unwrap();
        assert_eq!(ctx.log.lock().unwrap().clone(), vec!["handler"]);
    }

    #[tokio::test]
    async fn retryable_middleware_retries_transient_errors() {
        struct Transient {
            calls: AtomicU32,
        }
        #[async_trait]
        impl Middleware<TestCtx> for Transient {
            fn name(&self) -> &str {
                "transient"
            }
            fn retryable(&self) -> bool {
                true
            }
            async fn execute(&self, ctx: &mut TestCtx, next: Next<'_, TestCtx>) -> Result<()> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::UpstreamTimeout("blip".into()));
                }
                next.run(ctx).await
            }
        }

        let config = MiddlewareConfig {
            retry: RetryConfig {
                enabled: true,
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            ..MiddlewareConfig::default()
        };
        let chain = MiddlewareChain::new(config);
        chain.register(Arc::new(Transient {
            calls: AtomicU32::new(0),
        }));

        let mut ctx = ctx("/x");
        chain.run(&mut ctx, handler()).await.unwrap();
        assert_eq!(ctx.log.lock().unwrap().clone(), vec!["handler"]);
    }

    #[tokio::test]
    async fn unregister_removes_by_name() {
        let chain = chain();
        chain.register(recorder("a", 1));
        chain.register(recorder("b", 2));
        assert_eq!(chain.len(), 2);

        assert!(chain.unregister("a"));
        assert!(!chain.unregister("a"));
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn disabled_middleware_is_skipped() {
        struct Disabled;
        #[async_trait]
        impl Middleware<TestCtx> for Disabled {
            fn name(&self) -> &str {
                "disabled"
            }
            fn enabled(&self) -> bool {
                false
            }
            async fn execute(&self, _ctx: &mut TestCtx, _next: Next<'_, TestCtx>) -> Result<()> {
                Err(Error::Internal("must not run".into()))
            }
        }

        let chain = chain();
        chain.register(Arc::new(Disabled));
        let mut ctx = ctx("/x");
        chain.run(&mut ctx, handler()).await.unwrap();
    }
}
