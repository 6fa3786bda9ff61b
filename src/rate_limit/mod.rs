//! Token bucket rate limiting for database operations.
//!
//! Provides the admission gate used by [`crate::RateLimitedDb`]:
//! - [`Limit`]: refill rate, finite or unlimited
//! - [`RateLimiter`]: shared bucket with blocking, context-aware `wait`
//! - [`Reservation`]: a token promised at a future instant

mod limit;
mod limiter;

pub use limit::Limit;
pub use limiter::{RateLimiter, Reservation};
