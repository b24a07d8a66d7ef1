// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Primitives
//!
//! Building blocks used by connection establishment and by the supervisors:
//!
//! - [`retry_with_backoff`] / [`retry_until`]: run a fallible async task until it
//!   succeeds, fails permanently or exhausts its attempts, sleeping between
//!   attempts. Cancellation during the sleep aborts the loop.
//! - [`ReconnectState`]: the consecutive-failure counter and backoff generator a
//!   supervisor keeps across reconnect cycles, including the health-check reset.

use crate::backoff::{Backoff, BackoffConfig, BackoffFactory, ConstantBackoff};
use std::{fmt::Display, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Outcome of a single failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<E> {
    /// The task may succeed if tried again.
    Retryable(E),
    /// Retrying is pointless, the error is returned as is.
    Permanent(E),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E: Display> {
    #[error("{0}")]
    Permanent(E),

    #[error("max retry attempts {attempts} exceeded, last err: {last}")]
    MaxAttemptsExceeded { attempts: u32, last: E },

    #[error("retry canceled")]
    Canceled,
}

/// Retries `task` with delays from `backoff`.
///
/// `max_attempts` bounds the total number of calls; `None` retries forever.
/// Cancellation interrupts both the running attempt and the wait between
/// attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    cancel: &CancellationToken,
    max_attempts: Option<u32>,
    backoff: &mut dyn Backoff,
    mut task: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Canceled);
        }

        // a dial against an unreachable broker may only fail on a TCP timeout
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Canceled),
            outcome = task() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(Attempt::Permanent(err)) => return Err(RetryError::Permanent(err)),
            Err(Attempt::Retryable(err)) => err,
        };

        attempts = attempts.saturating_add(1);
        if let Some(max) = max_attempts {
            if attempts >= max {
                return Err(RetryError::MaxAttemptsExceeded {
                    attempts: max,
                    last: err,
                });
            }
        }

        if !sleep_or_cancel(cancel, backoff.next()).await {
            return Err(RetryError::Canceled);
        }
    }
}

/// Retries `task` at a fixed `interval`, at most `max_attempts` times.
pub async fn retry_until<T, E, F, Fut>(
    cancel: &CancellationToken,
    max_attempts: u32,
    interval: Duration,
    task: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut backoff = ConstantBackoff(interval);
    retry_with_backoff(cancel, Some(max_attempts), &mut backoff, task).await
}

/// Sleeps for `delay` unless `cancel` fires first. Returns `false` when canceled.
pub async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Failure bookkeeping kept by a supervisor for its whole lifetime.
///
/// A run that stayed up longer than `health_check_factor * backoff.max` is
/// considered healthy: its failure starts a fresh backoff generator and a new
/// failure count instead of continuing the previous exponential growth.
pub struct ReconnectState {
    factory: Arc<dyn BackoffFactory>,
    config: BackoffConfig,
    backoff: Box<dyn Backoff>,
    healthy_after: Duration,
    max_retry_attempts: u32,
    failures: u32,
}

impl ReconnectState {
    pub fn new(
        factory: Arc<dyn BackoffFactory>,
        config: BackoffConfig,
        health_check_factor: u32,
        max_retry_attempts: u32,
    ) -> Self {
        let config = config.normalized();
        ReconnectState {
            backoff: factory.create(&config),
            healthy_after: config.max.saturating_mul(health_check_factor),
            factory,
            config,
            max_retry_attempts,
            failures: 0,
        }
    }

    /// Records a failure of a run that lasted `ran_for`.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// retry budget is exhausted: with `max_retry_attempts = N` the budget
    /// allows the first failure plus `N` retries.
    pub fn record_failure(&mut self, ran_for: Duration) -> Option<Duration> {
        if ran_for > self.healthy_after {
            self.reset();
        }

        self.failures = self.failures.saturating_add(1);
        if self.max_retry_attempts != 0 && self.failures > self.max_retry_attempts {
            return None;
        }

        Some(self.backoff.next())
    }

    /// Forgets accumulated failures when a run has been healthy long enough.
    pub fn record_healthy_run(&mut self, ran_for: Duration) {
        if ran_for > self.healthy_after {
            self.reset();
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn reset(&mut self) {
        self.backoff = self.factory.create(&self.config);
        self.failures = 0;
    }
}
