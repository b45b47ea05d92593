//! Client reconnection backoff.

use std::time::Duration;

/// Next step after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait this long, then try again.
    Retry(Duration),
    /// The retry ceiling was exceeded.
    GiveUp,
}

/// Attempt counter with linear, capped backoff.
///
/// Attempt `k` (1-based) waits `min(retry_delay * k, max_delay)`. Once more
/// than `retries` consecutive attempts have failed the policy gives up.
/// [`ReconnectPolicy::reset`] is called on every successful handshake.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    retries: u32,
    retry_delay: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(retries: u32, retry_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
            max_delay,
            attempt: 0,
        }
    }

    /// Record one failure and decide what to do next.
    pub fn record_failure(&mut self) -> Backoff {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.retries {
            return Backoff::GiveUp;
        }
        Backoff::Retry(self.delay_for(self.attempt))
    }

    /// Delay for the `attempt`-th retry.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt).min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
