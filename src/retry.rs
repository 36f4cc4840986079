// Retry/backoff policy shared by message resends and stream reconnects
// delay = base * 2^(attempt-1) + jitter, capped at max_delay

use log::debug;
use rand::Rng;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

/// What to do with a message whose send attempt just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry as attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

impl BackoffPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.delay_with_jitter(attempt, Duration::from_millis(jitter))
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        base.saturating_add(jitter).min(self.max_delay)
    }

    /// Decide whether a failed send gets another go.
    /// `retry_count` is the number of retries already scheduled for the message.
    pub fn decide(&self, retry_count: u32, error: &ChatError) -> RetryDecision {
        if !error.is_retryable() {
            debug!("Error is not retryable: {}", error);
            return RetryDecision::GiveUp;
        }
        if retry_count >= self.max_attempts {
            debug!("Retry budget exhausted ({}/{})", retry_count, self.max_attempts);
            return RetryDecision::GiveUp;
        }
        let attempt = retry_count + 1;
        RetryDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }
}
