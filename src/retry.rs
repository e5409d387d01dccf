//! Retry delay calculation for failed dispatches.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy attached to a dispatch and carried on its queue messages.
///
/// Serialized externally tagged: `{"constant":{"interval":30}}` or
/// `{"exponential":{"base":5,"max":300}}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// The same interval before every retry.
    Constant { interval: u32 },
    /// Decorrelated jitter bounded by `[base, max]`. A `max` below `base`
    /// is treated as `base`.
    Exponential { base: u32, max: u32 },
}

impl RetryPolicy {
    /// Delay in seconds before the next retry, given how many retries already
    /// happened.
    pub fn delay(&self, attempts: u32) -> u32 {
        self.delay_with(attempts, &mut rand::thread_rng())
    }

    /// Same as [`RetryPolicy::delay`] with a caller-supplied random source.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> u32 {
        match *self {
            RetryPolicy::Constant { interval } => interval,
            RetryPolicy::Exponential { base, max } => {
                let base = u64::from(base);
                let max = u64::from(max).max(base);
                let mut delay = base;
                for _ in 0..attempts {
                    let ceiling = delay.saturating_mul(3).max(base);
                    let sampled = rng.gen_range(base..=ceiling);
                    delay = sampled.min(max);
                }
                u32::try_from(delay).unwrap_or(u32::MAX)
            }
        }
    }
}

/// Delay in seconds for the next redelivery, or `None` when no policy is
/// configured and the queue's own default should apply.
pub fn retry_delay(policy: Option<&RetryPolicy>, attempts: u32) -> Option<u32> {
    policy.map(|policy| policy.delay(attempts))
}
