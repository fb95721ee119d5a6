//! Bounded retry with exponential, jittered backoff for store writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retry settings for one store operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Max attempts per operation (including the first try).
    pub max_attempts: u32,
    /// Backoff after the first failure.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter percentage applied to backoff (0.0..=1.0).
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 1_000,
            jitter_pct: 0.2,
        }
    }
}

/// Outcome of an exhausted or aborted retry loop.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    /// No retries and no sleeping; used by tests that inject failures.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_pct: 0.0,
        }
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = base.checked_mul(exp).unwrap_or(max);
        apply_jitter(delay.min(max), self.jitter_pct)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
    pub fn run<T, E>(
        &self,
        op_name: &str,
        mut op: impl FnMut() -> Result<T, E>,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let will_retry = is_transient(&err) && attempts < max_attempts;
                    let backoff = if will_retry {
                        self.backoff_for_attempt(attempts)
                    } else {
                        Duration::ZERO
                    };
                    debug!(
                        op = op_name,
                        attempt = attempts,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        will_retry,
                        error = %err,
                        "store operation failed"
                    );
                    if !will_retry {
                        return Err(RetryFailure {
                            error: err,
                            attempts,
                        });
                    }
                    if !backoff.is_zero() {
                        std::thread::sleep(backoff);
                    }
                }
            }
        }
    }
}

fn apply_jitter(duration: Duration, jitter_pct: f64) -> Duration {
    if jitter_pct <= 0.0 || duration.is_zero() {
        return duration;
    }
    let unit = next_jitter_unit();
    let delta = (unit * 2.0 - 1.0) * jitter_pct;
    let base_ms = duration.as_millis() as f64;
    let jittered = (base_ms * (1.0 + delta)).max(1.0);
    Duration::from_millis(jittered.round() as u64)
}

fn next_jitter_unit() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
    let mut current = SEED.load(Ordering::Relaxed);
    loop {
        let next = current.wrapping_mul(6364136223846793005u64).wrapping_add(1);
        match SEED.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => {
                // Top 53 bits as a uniform f64 in [0, 1).
                let value = next >> 11;
                return (value as f64) / ((1u64 << 53) as f64);
            }
            Err(actual) => current = actual,
        }
    }
}
