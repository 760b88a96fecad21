//! Retry with exponential backoff and jitter.
//!
//! [`RetryPolicy::run`] drives a fallible async operation and reports the
//! outcome as a typed [`RetryError`]: `Fatal` when the predicate refuses to
//! retry, `Exhausted` once the attempt ceiling is reached.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::RetryConfig;

pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetryError<E> {
    #[error("{0}")]
    Fatal(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Fatal(error) | Self::Exhausted { last: error, .. } => error,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            Self::Fatal(error) | Self::Exhausted { last: error, .. } => error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay, jitter_ratio: DEFAULT_JITTER_RATIO }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, base_delay: Duration::ZERO, max_delay: Duration::ZERO, jitter_ratio: 0.0 }
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay after the given failed attempt (0-based):
    /// `min(base * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Backoff scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter_ratio <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let factor = rand::thread_rng()
            .gen_range((1.0 - self.jitter_ratio)..=(1.0 + self.jitter_ratio));
        backoff.mul_f64(factor)
    }

    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        mut attempt_fn: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let event_name = format!("{operation}.retry");
        let mut attempt = 0;

        loop {
            let error = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;

            if !is_retryable(&error) {
                return Err(RetryError::Fatal(error));
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    event_name = event_name.as_str(),
                    operation,
                    attempts = attempt,
                    error = %error,
                    "retries exhausted"
                );
                return Err(RetryError::Exhausted { attempts: attempt, last: error });
            }

            let delay = self.delay(attempt - 1);
            tracing::warn!(
                event_name = event_name.as_str(),
                operation,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
