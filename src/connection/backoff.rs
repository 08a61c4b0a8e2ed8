//! Exponential backoff with additive jitter for reconnect attempts.

use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Default first reconnect delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Default ceiling on the un-jittered delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Default upper bound of the random jitter added to every delay.
pub const DEFAULT_BACKOFF_JITTER: Duration = Duration::from_millis(100);

/// Exponential backoff policy for reconnection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

/// Tracks reconnection attempts and produces jittered delays.
///
/// The un-jittered delay starts at `base`, doubles after every call to
/// [`next_delay`](Self::next_delay) and saturates at `cap`. Each returned
/// delay adds a uniform sample from `0..=jitter`, so no delay exceeds
/// `cap + jitter`.
#[derive(Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    current: Duration,
    rng: StdRng,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            current: policy.base.min(policy.cap),
            policy,
            rng,
        }
    }

    /// Un-jittered delay the next call will start from.
    pub fn peek_base(&self) -> Duration {
        self.current
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let jitter_ms = self.policy.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter = match jitter_ms {
            0 => Duration::ZERO,
            max => Duration::from_millis(self.rng.gen_range(0..=max)),
        };
        let delay = self.current + jitter;
        self.current = self.current.saturating_mul(2).min(self.policy.cap);
        delay
    }

    /// Start over from `base` after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.policy.base.min(self.policy.cap);
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
