//! Retry budget and backoff delay policy.
//!
//! Delay computation is a pure function of the attempt index, the server's
//! retry-after hint, and a caller-supplied jitter factor, so the executor's
//! decision logic is testable without timers.

use std::time::Duration;

/// Multiplicative jitter band applied to exponential backoff.
pub const JITTER_MIN: f64 = 0.75;
pub const JITTER_MAX: f64 = 1.25;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first, for idempotent requests.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Attempt budget for a request. Non-idempotent (state-mutating) requests
    /// get exactly one attempt; a duplicate start could trigger the side
    /// effect twice.
    pub fn attempts_for(&self, idempotent: bool) -> u32 {
        if idempotent {
            self.max_retries + 1
        } else {
            1
        }
    }

    /// Delay before the retry following `attempt` (zero-based).
    ///
    /// A server-provided retry-after hint takes precedence verbatim, capped
    /// at `max_delay_ms`. Otherwise exponential backoff scaled by `jitter`
    /// (expected in [`JITTER_MIN`], [`JITTER_MAX`]; out-of-band values are
    /// clamped), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>, jitter: f64) -> Duration {
        if let Some(hint) = retry_after {
            let ms = hint.as_secs().saturating_mul(1_000);
            return Duration::from_millis(ms.min(self.max_delay_ms));
        }
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX));
        let jittered = (exp as f64 * jitter.clamp(JITTER_MIN, JITTER_MAX)) as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }
}
