//! Retry policy: decides how long a failed task waits before it is claimable again.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff curve applied when a failed attempt is requeued.
///
/// The default is a fixed zero delay: a requeued task is immediately
/// claimable, and attempt counts are preserved so handlers can apply their
/// own backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    Fixed {
        #[serde(with = "crate::config::millis")]
        delay: Duration,
    },
    Exponential {
        #[serde(with = "crate::config::millis")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "crate::config::millis")]
        max: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(Duration::ZERO)
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed { delay }
    }

    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        RetryPolicy::Exponential {
            base,
            multiplier,
            max,
        }
    }

    /// Delay before the next attempt, given attempts already made (1-indexed).
    ///
    /// Exponential: `base * multiplier^(attempts - 1)`, capped at `max`.
    /// Example with base=2s, multiplier=2.0: 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        match self {
            RetryPolicy::Fixed { delay } => *delay,
            RetryPolicy::Exponential {
                base,
                multiplier,
                max,
            } => {
                let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}
