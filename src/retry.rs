//! Retry budgets and interval strategies for [`crate::mono_task::MonoTask`].
//!
//! A [`RetrySchedule`] is an immutable, pure description of "how many more
//! attempts remain, and how long to wait before the next one" (§4.1). It
//! never performs I/O or sleeps itself; `MonoTask` consumes it one attempt
//! at a time via [`RetrySchedule::interval`] / [`RetrySchedule::next`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How many further attempts remain after the current failure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum Budget {
    /// No further attempts; the schedule is terminal.
    Never,
    /// Unbounded retries.
    Infinite,
    /// Exactly this many further attempts remain.
    Count(u64),
}

/// The per-attempt delay, independent of how many attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IntervalStrategy {
    /// Always the same interval.
    Fixed(Duration),
    /// Multiplies by `scale` on every [`RetrySchedule::next`].
    Exponential { current: Duration, scale: f64 },
    /// Exponential for `remaining_exp` more advances, then collapses to a
    /// fixed `floor` interval.
    ExponentialThenFixed {
        current: Duration,
        floor: Duration,
        remaining_exp: u64,
        scale: f64,
    },
    /// Fixed for `remaining_fixed` more advances, then switches to
    /// exponential starting at `current * scale`.
    FixedThenExponential {
        current: Duration,
        remaining_fixed: u64,
        scale: f64,
    },
}

impl IntervalStrategy {
    fn current(&self) -> Duration {
        match self {
            IntervalStrategy::Fixed(d) => *d,
            IntervalStrategy::Exponential { current, .. } => *current,
            IntervalStrategy::ExponentialThenFixed { current, .. } => *current,
            IntervalStrategy::FixedThenExponential { current, .. } => *current,
        }
    }

    /// Scales a duration by `rate`, saturating rather than overflowing or
    /// panicking on pathological inputs (§4.1 "large counts must not
    /// overflow").
    fn scale_duration(d: Duration, rate: f64) -> Duration {
        if !rate.is_finite() || rate <= 0.0 {
            return d;
        }
        let secs = d.as_secs_f64() * rate;
        if !secs.is_finite() || secs < 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    fn advanced(self) -> IntervalStrategy {
        match self {
            IntervalStrategy::Fixed(d) => IntervalStrategy::Fixed(d),
            IntervalStrategy::Exponential { current, scale } => IntervalStrategy::Exponential {
                current: Self::scale_duration(current, scale),
                scale,
            },
            IntervalStrategy::ExponentialThenFixed {
                current,
                floor,
                remaining_exp,
                scale,
            } => {
                if remaining_exp == 0 {
                    IntervalStrategy::Fixed(floor)
                } else {
                    IntervalStrategy::ExponentialThenFixed {
                        current: Self::scale_duration(current, scale),
                        floor,
                        remaining_exp: remaining_exp - 1,
                        scale,
                    }
                }
            }
            IntervalStrategy::FixedThenExponential {
                current,
                remaining_fixed,
                scale,
            } => {
                if remaining_fixed == 0 {
                    IntervalStrategy::Exponential {
                        current: Self::scale_duration(current, scale),
                        scale,
                    }
                } else {
                    IntervalStrategy::FixedThenExponential {
                        current,
                        remaining_fixed: remaining_fixed - 1,
                        scale,
                    }
                }
            }
        }
    }
}

/// Immutable retry budget consumed one attempt at a time (§4.1, §8).
///
/// `RetrySchedule` is cloned into each [`crate::mono_task::MonoTask`]
/// attempt; `next()` never mutates the original, it returns the schedule
/// *after* this attempt is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySchedule {
    budget: Budget,
    strategy: IntervalStrategy,
}

impl RetrySchedule {
    /// A schedule with no further attempts ever.
    pub fn never() -> Self {
        Self {
            budget: Budget::Never,
            strategy: IntervalStrategy::Fixed(Duration::ZERO),
        }
    }

    /// Fixed delay between every attempt, for as long as `budget` allows.
    pub fn fixed(interval: Duration) -> Self {
        Self::count(u64::MAX, IntervalStrategy::Fixed(interval)).infinite()
    }

    /// Multiplies the interval by `scale` after every attempt.
    pub fn exponential(initial: Duration, scale: f64) -> Self {
        Self::count(
            u64::MAX,
            IntervalStrategy::Exponential {
                current: initial,
                scale,
            },
        )
        .infinite()
    }

    /// Exponential backoff for the first `n` advances, then falls back to a
    /// fixed `initial` interval.
    pub fn exponential_then_fixed(initial: Duration, n: u64, scale: f64) -> Self {
        Self::count(
            u64::MAX,
            IntervalStrategy::ExponentialThenFixed {
                current: initial,
                floor: initial,
                remaining_exp: n,
                scale,
            },
        )
        .infinite()
    }

    /// Fixed interval for the first `n` advances, then switches to
    /// exponential backoff starting at `initial * scale`.
    pub fn fixed_then_exponential(initial: Duration, n: u64, scale: f64) -> Self {
        Self::count(
            u64::MAX,
            IntervalStrategy::FixedThenExponential {
                current: initial,
                remaining_fixed: n,
                scale,
            },
        )
        .infinite()
    }

    /// Bounds any strategy to at most `n` further attempts.
    pub fn count(n: u64, strategy_seed: IntervalStrategy) -> Self {
        Self {
            budget: Budget::Count(n),
            strategy: strategy_seed,
        }
    }

    fn infinite(mut self) -> Self {
        self.budget = Budget::Infinite;
        self
    }

    /// The delay before the next attempt, or `None` if no further attempts
    /// remain.
    pub fn interval(&self) -> Option<Duration> {
        match self.budget {
            Budget::Never => None,
            Budget::Count(0) => None,
            Budget::Count(_) | Budget::Infinite => Some(self.strategy.current()),
        }
    }

    /// The schedule after consuming one attempt: the interval strategy
    /// advances and the remaining budget (if finite) decrements by one,
    /// becoming terminal at zero.
    pub fn next(&self) -> RetrySchedule {
        let budget = match self.budget {
            Budget::Never => Budget::Never,
            Budget::Infinite => Budget::Infinite,
            Budget::Count(0) => Budget::Never,
            Budget::Count(n) => Budget::Count(n - 1),
        };
        RetrySchedule {
            budget,
            strategy: self.strategy.advanced(),
        }
    }

    /// True if this schedule permits no further attempts.
    pub fn is_terminal(&self) -> bool {
        self.interval().is_none()
    }
}

/// `RetrySchedule::from(5)` is `count(5, fixed(Duration::ZERO))` (§4.1).
impl From<u64> for RetrySchedule {
    fn from(n: u64) -> Self {
        RetrySchedule::count(n, IntervalStrategy::Fixed(Duration::ZERO))
    }
}
