//! Retry pacing for the unbounded retry loops (peer dial, DNS, probes).
//!
//! Loops never give up on their own; the policy only decides how long to
//! sleep between attempts. Intervals double from `initial` up to `max`, and
//! each sleep is perturbed by ±`jitter` of its length so that nodes started
//! together do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use hopline_core::config::RetrySettings;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl RetryPolicy {
    /// Non-finite jitter is treated as none.
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            initial,
            max: max.max(initial),
            jitter,
        }
    }

    /// Fixed interval, no jitter. Used by tests.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval, 0.0)
    }

    /// Start a fresh backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            next: self.initial,
            attempts: 0,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(s.initial_interval_ms),
            Duration::from_millis(s.max_interval_ms),
            s.jitter,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

/// State of one retry loop.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    /// Number of waits taken so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, advancing the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.policy.max);
        self.attempts = self.attempts.saturating_add(1);

        if self.policy.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.as_secs_f64() * self.policy.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}
