//! Token refill rates.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Rate limit expressed as tokens per second.
///
/// A limit is either finite and positive, or [`Limit::UNLIMITED`], which
/// admits every request immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit(f64);

impl Limit {
    /// No rate limit at all.
    pub const UNLIMITED: Limit = Limit(f64::INFINITY);

    /// Creates a limit from tokens per second.
    ///
    /// Positive infinity is accepted and means unlimited.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRate` if the rate is zero, negative or NaN.
    pub fn per_second(tokens_per_second: f64) -> Result<Self> {
        if tokens_per_second.is_nan() || tokens_per_second <= 0.0 {
            return Err(Error::InvalidRate {
                rate: tokens_per_second,
            });
        }
        Ok(Limit(tokens_per_second))
    }

    /// Creates a limit that adds one token per `interval`.
    /// A zero interval means unlimited.
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            return Self::UNLIMITED;
        }
        Limit(1.0 / interval.as_secs_f64())
    }

    pub fn is_unlimited(self) -> bool {
        self.0.is_infinite()
    }

    /// Tokens per second (`f64::INFINITY` when unlimited).
    pub fn rate(self) -> f64 {
        self.0
    }

    /// Time needed to accumulate `tokens` at this rate.
    pub(crate) fn duration_from_tokens(self, tokens: f64) -> Duration {
        if self.is_unlimited() || tokens <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(tokens / self.0).unwrap_or(Duration::MAX)
    }

    /// Tokens accumulated over `duration` at this rate.
    pub(crate) fn tokens_from_duration(self, duration: Duration) -> f64 {
        if duration.is_zero() {
            return 0.0;
        }
        duration.as_secs_f64() * self.0
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}/s", self.0)
        }
    }
}
