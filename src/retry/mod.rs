//! Retry execution driven by a transient fault classifier.
//!
//! [`RetryExecutor`] runs an operation, asks the provider's
//! [`TransientFaultClassifier`] about each fault and sleeps according to the
//! [`RetryPolicy`] before trying again. Sleeps are plain `tokio::time::sleep`
//! calls, so dropping the returned future cancels a pending retry.

pub mod classifier;

pub use classifier::{PostgresFaultClassifier, SqliteFaultClassifier, TransientFaultClassifier};

use crate::error::{DbError, DbResult};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
    /// `base * 2^retry`, capped at `max`, plus up to `jitter` of random delay
    Exponential {
        base: Duration,
        max: Duration,
        jitter: Option<Duration>,
    },
}

impl Backoff {
    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear {
                initial,
                increment,
                max,
            } => increment
                .checked_mul(retry)
                .and_then(|extra| initial.checked_add(extra))
                .map_or(*max, |d| d.min(*max)),
            Backoff::Exponential { base, max, jitter } => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                let delay = base.checked_mul(factor).map_or(*max, |d| d.min(*max));
                match jitter {
                    Some(cap) if !cap.is_zero() => {
                        let extra = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
                        delay + Duration::from_millis(extra)
                    }
                    _ => delay,
                }
            }
        }
    }
}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                base: DEFAULT_BASE_DELAY,
                max: DEFAULT_MAX_DELAY,
                jitter: None,
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed { delay })
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

/// Whether an operation may be run again after a transient fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySafety {
    Idempotent,
    NonIdempotent,
}

/// Final outcome of a failed retried operation. The original fault is kept.
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Permanent fault after {attempts} attempt(s): {source}")]
    Permanent { attempts: u32, source: DbError },

    #[error("Gave up after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: DbError },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_inner(self) -> DbError {
        match self {
            Self::Permanent { source, .. } | Self::Exhausted { source, .. } => source,
        }
    }
}

impl From<RetryError> for DbError {
    fn from(err: RetryError) -> Self {
        err.into_inner()
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: Arc<RetryPolicy>,
    classifier: Arc<dyn TransientFaultClassifier>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<RetryPolicy>, classifier: Arc<dyn TransientFaultClassifier>) -> Self {
        Self { policy, classifier }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &dyn TransientFaultClassifier {
        self.classifier.as_ref()
    }

    /// Delay before the next attempt after `attempt` failed with `err`, or
    /// None when the fault must be surfaced.
    pub fn retry_delay(&self, safety: RetrySafety, attempt: u32, err: &DbError) -> Option<Duration> {
        if safety == RetrySafety::NonIdempotent
            || attempt >= self.policy.max_attempts
            || !self.classifier.is_transient(err)
        {
            return None;
        }
        Some(self.policy.backoff.delay(attempt.saturating_sub(1)))
    }

    /// Wrap the fault that ended an operation after `attempts` invocations.
    pub fn give_up(&self, attempts: u32, err: DbError) -> RetryError {
        if self.classifier.is_transient(&err) {
            RetryError::Exhausted {
                attempts,
                source: err,
            }
        } else {
            RetryError::Permanent {
                attempts,
                source: err,
            }
        }
    }

    /// Attempt bookkeeping for one operation driven by this executor.
    pub fn attempts(&self, safety: RetrySafety) -> Attempts<'_> {
        Attempts {
            executor: self,
            safety,
            count: 0,
        }
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, safety: RetrySafety, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut attempts = self.attempts(safety);
        loop {
            match op(attempts.start()).await {
                Ok(value) => return Ok(value),
                Err(err) => attempts.backoff(err).await?,
            }
        }
    }
}

/// Counts the attempts of one operation and waits out the backoff between them.
#[derive(Debug)]
pub struct Attempts<'a> {
    executor: &'a RetryExecutor,
    safety: RetrySafety,
    count: u32,
}

impl Attempts<'_> {
    /// Begin the next attempt and return its 1-based number.
    pub fn start(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Sleep before the next attempt, or return the final fault when `err`
    /// must be surfaced.
    pub async fn backoff(&self, err: DbError) -> Result<(), RetryError> {
        match self.executor.retry_delay(self.safety, self.count, &err) {
            Some(delay) => {
                warn!(
                    attempt = self.count,
                    max_attempts = self.executor.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient fault, retrying"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(self.give_up(err)),
        }
    }

    /// Stop retrying and surface `err` unchanged.
    pub fn give_up(&self, err: DbError) -> RetryError {
        self.executor.give_up(self.count, err)
    }
}
