//! Bounded retries for transient upstream failures.
//!
//! A call gets an attempt budget; only failures the taxonomy classifies as
//! transport-level ([`Error::is_retryable`]) spend it. Credential,
//! permission and validation failures surface on the first attempt. Pauses
//! between attempts grow exponentially up to the configured cap.

use std::future::Future;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::sleep;
use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;

/// Retry policy for one class of outbound calls.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create from config.
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: RetryConfig {
                enabled: false,
                max_attempts: 1,
                ..RetryConfig::default()
            },
        }
    }

    /// Whether retries apply at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Total attempt budget, first call included. A disabled policy budgets
    /// exactly one attempt.
    #[must_use]
    pub fn attempt_budget(&self) -> u32 {
        if self.config.enabled {
            self.config.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Exponential pause sequence between attempts.
    pub(crate) fn pauses(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_multiplier(self.config.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `call` until it succeeds, fails non-transiently, or the attempt
/// budget is spent.
///
/// # Errors
///
/// Returns the first non-transient error immediately, or the last transient
/// error once the budget runs out.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let budget = policy.attempt_budget();
    let mut pauses = policy.pauses();

    let mut outcome = call().await;
    for spent in 1..budget {
        let cause = match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        let Some(pause) = pauses.next_backoff() else {
            return Err(cause);
        };
        debug!(
            op = operation,
            spent,
            budget,
            pause_ms = pause.as_millis(),
            cause = %cause,
            "Upstream call failed transiently, pausing before next attempt"
        );
        sleep(pause).await;
        outcome = call().await;
    }

    if let Err(cause) = &outcome {
        if budget > 1 && cause.is_retryable() {
            debug!(op = operation, budget, cause = %cause, "Attempt budget spent, surfacing transient failure");
        }
    }
    outcome
}
