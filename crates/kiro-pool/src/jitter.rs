//! Randomized delays
//!
//! Spreads retries and request pacing so many credentials backing off at the
//! same moment do not hit the upstream in lockstep.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::RngExt;

/// Default jitter applied to backoff and pacing delays (±30%).
pub const DEFAULT_JITTER_PERCENT: f64 = 0.30;

pub const SHORT_DELAY_MIN: Duration = Duration::from_millis(50);
pub const SHORT_DELAY_MAX: Duration = Duration::from_millis(200);
pub const NORMAL_DELAY_MIN: Duration = Duration::from_secs(1);
pub const NORMAL_DELAY_MAX: Duration = Duration::from_secs(3);
pub const LONG_DELAY_MIN: Duration = Duration::from_secs(5);
pub const LONG_DELAY_MAX: Duration = Duration::from_secs(10);

const SHORT_DELAY_PROBABILITY: f64 = 0.20;
const LONG_DELAY_PROBABILITY: f64 = 0.05;

/// Requests closer together than this are treated as one burst.
const BURST_WINDOW: Duration = Duration::from_millis(500);

/// Apply ±`percent` random variation to `base`.
///
/// A `percent` outside `(0, 1]` falls back to [`DEFAULT_JITTER_PERCENT`].
/// The result is never negative and saturates at `Duration::MAX`.
pub fn jitter_delay(base: Duration, percent: f64) -> Duration {
    if base.is_zero() {
        return base;
    }
    let percent = if percent > 0.0 && percent <= 1.0 {
        percent
    } else {
        DEFAULT_JITTER_PERCENT
    };
    let spread = base.as_secs_f64() * percent;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::try_from_secs_f64((base.as_secs_f64() + offset).max(0.0)).unwrap_or(Duration::MAX)
}

/// Uniformly random delay in `[min, max)`. Returns `min` when `min >= max`.
pub fn random_delay(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let range_ms = (max - min).as_millis() as u64;
    if range_ms == 0 {
        return min;
    }
    min + Duration::from_millis(rand::rng().random_range(0..range_ms))
}

/// `min(base * 2^attempt, max)` with the default ±30% jitter applied.
pub fn exponential_backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let backoff = base.checked_mul(factor).unwrap_or(max).min(max);
    jitter_delay(backoff, DEFAULT_JITTER_PERCENT)
}

/// Pacing delay shaped like a person working through requests.
///
/// Back-to-back calls inside the burst window get a short delay. Otherwise
/// the delay is short 20% of the time, long 5% and normal the rest.
#[derive(Debug, Default)]
pub struct HumanLikeDelay {
    last_request: Mutex<Option<Instant>>,
}

impl HumanLikeDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait before the next request; records the call time.
    pub fn next(&self) -> Duration {
        let now = Instant::now();
        let previous = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(now);

        if let Some(previous) = previous {
            let since = now.saturating_duration_since(previous);
            if !since.is_zero() && since < BURST_WINDOW {
                return random_delay(SHORT_DELAY_MIN, SHORT_DELAY_MAX);
            }
        }

        let roll: f64 = rand::rng().random();
        let (min, max) = if roll < SHORT_DELAY_PROBABILITY {
            (SHORT_DELAY_MIN, SHORT_DELAY_MAX)
        } else if roll < SHORT_DELAY_PROBABILITY + LONG_DELAY_PROBABILITY {
            (LONG_DELAY_MIN, LONG_DELAY_MAX)
        } else {
            (NORMAL_DELAY_MIN, NORMAL_DELAY_MAX)
        };
        random_delay(min, max)
    }

    /// Forget the previous request so the next call is not a burst.
    pub fn reset(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}
