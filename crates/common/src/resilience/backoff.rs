//! Backoff delay computation
//!
//! `delay_for(n)` is the pause inserted after attempt `n` fails:
//!
//! ```text
//! delay(n)  = min(initial_delay * multiplier^(n-1), max_delay)
//! delay'(n) = max(0, delay(n) + U(-0.1, +0.1) * delay(n))   // jitter enabled
//! ```
//!
//! The function is pure apart from the jitter sample, which comes from an
//! injected [`JitterSource`] so tests can pin it with [`SeededJitter`] or
//! [`FixedJitter`].

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::retry::RetryPolicy;

/// Maximum relative perturbation applied by jitter (±10%)
pub const JITTER_RATIO: f64 = 0.1;

/// Source of jitter samples
pub trait JitterSource: Send + Sync {
    /// A sample drawn uniformly from `[-1.0, 1.0]`
    fn sample(&self) -> f64;
}

/// Thread-local RNG; the production default
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Deterministic sequence of samples from a seed
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    /// Create a jitter source that replays the same sequence for a seed
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl fmt::Debug for SeededJitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededJitter").finish_non_exhaustive()
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        self.rng.lock().gen_range(-1.0..=1.0)
    }
}

/// Always returns the same sample, clamped to `[-1.0, 1.0]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

/// Delay before the next attempt without jitter
///
/// `attempt` is 1-based; `0` is treated as `1`.
pub fn base_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
    let factor = policy.multiplier.powi(exponent);
    let nanos = policy.initial_delay.as_nanos() as f64 * factor;

    if !nanos.is_finite() || nanos >= policy.max_delay.as_nanos() as f64 {
        return policy.max_delay;
    }

    Duration::from_nanos(nanos.round() as u64)
}

/// Delay before the next attempt, jittered when the policy asks for it
pub fn delay_for(attempt: u32, policy: &RetryPolicy, jitter: &dyn JitterSource) -> Duration {
    let delay = base_delay(attempt, policy);
    if policy.jitter {
        apply_jitter(delay, jitter.sample())
    } else {
        delay
    }
}

fn apply_jitter(delay: Duration, sample: f64) -> Duration {
    let nanos = delay.as_nanos() as f64;
    let offset = sample.clamp(-1.0, 1.0) * JITTER_RATIO * nanos;
    let jittered = (nanos + offset).max(0.0);
    Duration::from_nanos(jittered.round() as u64)
}
