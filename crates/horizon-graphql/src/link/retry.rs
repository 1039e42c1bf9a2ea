//! Retry stages.

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::{ClientError, Result};
use crate::link::{Link, NextLink, OperationOutcome};
use crate::operation::Operation;

const TARGET: &str = "horizon_graphql::retry";

/// Which failures a retry stage re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCondition {
    /// Any failure, transport-layer or data-layer.
    AnyFailure,
    /// Only authorization failures (HTTP 401).
    Unauthorized,
}

impl RetryCondition {
    /// Whether this condition covers the given failure.
    pub fn applies(&self, error: &ClientError) -> bool {
        match self {
            Self::AnyFailure => true,
            Self::Unauthorized => error.is_unauthorized(),
        }
    }
}

/// Backoff schedule and budget for a retry stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries allowed, the first included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the computed delay. `None` leaves it unbounded.
    pub max_delay: Option<Duration>,
    /// Multiplier applied to the delay after each failed try.
    pub multiplier: f64,
    /// Replace each delay with a uniformly random duration up to its value.
    pub jitter: bool,
    /// Which failures the stage re-runs.
    pub condition: RetryCondition,
}

impl Default for RetryPolicy {
    /// The general-purpose policy: 15 tries, exponential backoff from 1s,
    /// full jitter, no delay cap, any failure.
    fn default() -> Self {
        Self {
            max_attempts: 15,
            initial_delay: Duration::from_millis(1000),
            max_delay: None,
            multiplier: 2.0,
            jitter: true,
            condition: RetryCondition::AnyFailure,
        }
    }
}

impl RetryPolicy {
    /// The authorization recovery policy: 3 tries, a fixed 20s pause,
    /// no jitter, HTTP 401 only.
    pub fn unauthorized() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(20_000),
            max_delay: None,
            multiplier: 1.0,
            jitter: false,
            condition: RetryCondition::Unauthorized,
        }
    }

    /// Whether another try is allowed after a failure on try `attempt`
    /// (1-based).
    pub fn should_retry(&self, error: &ClientError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.condition.applies(error)
    }

    /// The delay to wait after a failure on try `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let mut delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        if let Some(cap) = self.max_delay {
            delay_ms = delay_ms.min(cap.as_millis() as f64);
        }
        if self.jitter {
            delay_ms *= rand::random::<f64>();
        }
        Duration::from_millis(delay_ms as u64)
    }
}

/// Pipeline stage that re-runs the rest of the chain on failure.
///
/// Two instances with different policies sit in the standard chain: a
/// general one, then an authorization one closer to the transport. Each
/// spends its budget independently. A stage only sees the failures the
/// stages below it gave up on.
pub struct RetryLink {
    policy: RetryPolicy,
}

impl RetryLink {
    /// Creates the stage with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Link for RetryLink {
    fn request(
        &self,
        operation: Operation,
        next: NextLink,
    ) -> BoxFuture<'static, Result<OperationOutcome>> {
        let policy = self.policy.clone();
        Box::pin(async move {
            let mut attempt: u32 = 1;
            loop {
                match next.clone().run(operation.clone()).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(error) => {
                        if !policy.should_retry(&error, attempt) {
                            return Err(error);
                        }
                        let delay = policy.delay_for_attempt(attempt);
                        tracing::debug!(
                            target: TARGET,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying operation"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        })
    }
}
