// src/utils/retry.rs
//! Bounded retry with configurable backoff.
//!
//! Every wait in the protocol (operation polling, mailbox rendezvous, credential
//! visibility) is a poll with a bounded number of attempts and a delay between
//! them. Exhausting the attempts is the only timeout mechanism.

use crate::error::{CoordinationError, CoordinationResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Delay growth between attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `initial_delay * (attempt + 1)`
    Linear,
    /// `initial_delay * 2^attempt`
    Exponential,
}

impl BackoffStrategy {
    /// Delay to sleep after the zero-based `attempt` failed, capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
        let delay = match self {
            BackoffStrategy::Fixed => initial_delay,
            BackoffStrategy::Linear => initial_delay.saturating_mul(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => initial_delay.saturating_mul(2u32.saturating_pow(attempt)),
        };
        delay.min(max_delay)
    }
}

/// Retry policy shared by the poller, the mailbox waiter and credential lookups.
///
/// `max_attempts` counts every invocation of the polled step, the first one
/// included: a policy with `max_attempts == 3` calls the step exactly three
/// times before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// A single attempt and no sleeping; used for best-effort housekeeping.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.strategy
            .calculate_delay(attempt, self.initial_delay, self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The closure receives the 1-based attempt number.
    ///
    /// # Errors
    /// The last error produced by `operation`.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> CoordinationResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let delay = self.calculate_delay(attempt - 1);
                    log::debug!("retrying attempt={} delay_ms={} error={}", attempt, delay.as_millis(), err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(10, Duration::from_millis(250), Duration::from_secs(5))
    }
}

/// Returns a `CredentialNotYetVisible`-style retryable error; helper for closures
/// that poll for something to appear.
pub fn not_yet_visible(said: &str) -> CoordinationError {
    CoordinationError::CredentialNotYetVisible { said: said.to_string() }
}
