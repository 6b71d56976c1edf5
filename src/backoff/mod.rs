//! Retry backoff — capped exponential delays with uniform jitter.
//!
//! A [`BackoffPolicy`] is a pure delay calculator: it holds no state about any
//! particular task and has no failure mode. The attempt counter lives on the
//! task that is retrying; the policy just maps it to a wait.

use std::time::Duration;

use rand::Rng;

/// Default base delay for the first retry attempt (1 second).
const BASE_MS: u64 = 1000;

/// Default ceiling on the exponential portion of a delay (64 seconds).
const CAP_MS: u64 = 64_000;

/// Default upper bound on the random jitter added to every delay (1 second).
const MAX_JITTER_MS: u64 = 1000;

/// Jittered exponential backoff.
///
/// [`delay`](Self::delay) for attempt `n` is `min(base * 2^n, cap)` plus a
/// uniformly random whole number of milliseconds in `[1, max_jitter]`. The cap
/// keeps waits bounded no matter how many times a task retries; the jitter
/// spreads out tasks that failed at the same attempt count so they do not
/// retry in lockstep.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use requeue::BackoffPolicy;
///
/// let policy = BackoffPolicy::default();
/// let delay = policy.delay(2);
/// assert!(delay >= Duration::from_millis(4001));
/// assert!(delay <= Duration::from_millis(5000));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry, doubled on each subsequent attempt.
    pub base: Duration,
    /// Ceiling on the exponential portion of the delay.
    pub cap: Duration,
    /// Upper bound on the random jitter; zero disables jitter entirely.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(BASE_MS),
            cap: Duration::from_millis(CAP_MS),
            max_jitter: Duration::from_millis(MAX_JITTER_MS),
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given 0-based retry attempt.
    ///
    /// Attempts large enough to overflow the doubling saturate into the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.base.saturating_mul(factor).min(self.cap);
        exponential + self.jitter()
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let ceiling = self.max_jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
    }
}
