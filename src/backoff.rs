// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Backoff Generators
//!
//! Retry delays are computed as `min(max, base * 2^retries)` and then
//! randomized with a [`Jitter`] strategy. The retry counter stops growing once
//! the cap is reached, so a generator that keeps failing settles at `max`.
//!
//! Supervisors only depend on the narrow [`Backoff`] capability and obtain
//! fresh generators through a [`BackoffFactory`], which keeps them testable
//! with deterministic fakes.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// Produces the next delay to wait before retrying.
pub trait Backoff: Send {
    fn next(&mut self) -> Duration;
}

/// Source of randomness used by the jitter strategies.
#[cfg_attr(test, mockall::automock)]
pub trait RandomGenerator: Send + Sync {
    /// Returns a random integer in the half open interval `[0, n)`.
    fn int63n(&self, n: u64) -> u64;
}

/// Thread safe random generator seeded from the operating system.
pub struct SyncRandomGenerator {
    rng: Mutex<StdRng>,
}

impl SyncRandomGenerator {
    pub fn new() -> Self {
        SyncRandomGenerator {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Default for SyncRandomGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomGenerator for SyncRandomGenerator {
    fn int63n(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }

        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..n)
    }
}

/// Strategy used to randomize the exponential delay.
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Jitter {
    /// `1 + rand(0, d)`
    #[default]
    Full,
    /// `d/2 + 1 + rand(0, d/2 + 1)`
    Equal,
    /// The delay is used as computed.
    None,
}

impl Jitter {
    fn apply(&self, rng: &dyn RandomGenerator, factor: u64) -> Duration {
        let nanos = match self {
            Jitter::Full => 1 + rng.int63n(factor),
            Jitter::Equal => {
                let half = 1 + factor / 2;
                half + rng.int63n(half)
            }
            Jitter::None => factor,
        };

        Duration::from_nanos(nanos)
    }
}

/// Parameters of an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Duration used as the starting point of the exponential growth.
    pub base: Duration,
    /// Maximum duration, before jitter, the backoff can return.
    pub max: Duration,
    pub jitter: Jitter,
}

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: Jitter::Full,
        }
    }
}

impl BackoffConfig {
    /// A backoff that always waits `delay`, without jitter.
    pub fn constant(delay: Duration) -> Self {
        BackoffConfig {
            base: delay,
            max: delay,
            jitter: Jitter::None,
        }
    }

    /// Replaces zero durations with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.base.is_zero() {
            self.base = DEFAULT_BACKOFF_BASE;
        }

        if self.max.is_zero() {
            self.max = DEFAULT_BACKOFF_MAX;
        }

        self
    }
}

/// Exponential backoff with jitter.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    rng: Arc<dyn RandomGenerator>,
    retries: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_random_generator(Arc::new(SyncRandomGenerator::new()), config)
    }

    pub fn with_random_generator(rng: Arc<dyn RandomGenerator>, config: BackoffConfig) -> Self {
        ExponentialBackoff {
            config: config.normalized(),
            rng,
            retries: 0,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next(&mut self) -> Duration {
        let max = self.config.max.as_nanos();
        let delay = self
            .config
            .base
            .as_nanos()
            .checked_mul(1u128.checked_shl(self.retries).unwrap_or(u128::MAX))
            .unwrap_or(u128::MAX);

        let delay = if delay > max {
            max
        } else {
            self.retries += 1;
            delay
        };

        self.config
            .jitter
            .apply(self.rng.as_ref(), u64::try_from(delay).unwrap_or(u64::MAX))
    }
}

/// Backoff returning the same delay forever.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn next(&mut self) -> Duration {
        self.0
    }
}

/// Creates fresh backoff generators, e.g. when a supervisor resets its state.
pub trait BackoffFactory: Send + Sync {
    fn create(&self, config: &BackoffConfig) -> Box<dyn Backoff>;
}

/// Factory sharing a single thread safe random generator between all the
/// generators it creates, so seeding happens once.
#[derive(Clone)]
pub struct ExponentialBackoffFactory {
    rng: Arc<dyn RandomGenerator>,
}

impl ExponentialBackoffFactory {
    pub fn new() -> Self {
        ExponentialBackoffFactory {
            rng: Arc::new(SyncRandomGenerator::new()),
        }
    }

    pub fn with_random_generator(rng: Arc<dyn RandomGenerator>) -> Self {
        ExponentialBackoffFactory { rng }
    }
}

impl Default for ExponentialBackoffFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffFactory for ExponentialBackoffFactory {
    fn create(&self, config: &BackoffConfig) -> Box<dyn Backoff> {
        Box::new(ExponentialBackoff::with_random_generator(
            self.rng.clone(),
            *config,
        ))
    }
}
