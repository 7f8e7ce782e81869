//! Bounded exponential backoff with jitter for transient storage errors.

use std::time::Duration;

use rand::Rng;

/// Retry tunables for chunk loads.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt.
    pub backoff_multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0), applied as ±jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &strata_config::StreamingConfig) -> Self {
        Self {
            max_attempts: config.load_retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.load_retry_backoff_ms),
            ..Self::default()
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempts: 0,
            current_delay: self.initial_delay,
        }
    }
}

/// Attempt counter for one operation.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
    current_delay: Duration,
}

impl Backoff {
    /// Records a failed attempt. Returns the delay before the next one, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.policy.max_attempts {
            return None;
        }

        let base = self.current_delay;
        let jittered = if self.policy.jitter > 0.0 && !base.is_zero() {
            let factor = rand::rng()
                .random_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.policy.backoff_multiplier);
        self.current_delay = next.min(self.policy.max_delay);

        Some(jittered.min(self.policy.max_delay))
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
