//! Thread-safe token bucket with reservations.
//!
//! Tokens accrue continuously at the configured rate up to `burst`. A caller
//! that finds the bucket empty reserves the next token in the future and
//! sleeps until then; the token count may go negative to record that debt,
//! which is what serves concurrent waiters in arrival order. A waiter whose
//! context ends first cancels its reservation and gives the token back.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::limit::Limit;
use crate::context::{Context, ContextError};
use crate::error::{Error, Result};

/// A reservation for future token consumption.
///
/// Returned by [`RateLimiter::reserve`]; pass it back to
/// [`RateLimiter::cancel`] if the caller decides not to act.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Number of tokens reserved.
    tokens: u32,
    /// Time when the tokens can be consumed.
    time_to_act: Instant,
    /// Limit in force when the reservation was made.
    limit: Limit,
}

impl Reservation {
    /// Delay from `now` until the reserved tokens can be consumed.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.time_to_act.saturating_duration_since(now)
    }

    pub fn delay(&self) -> Duration {
        self.delay_from(Instant::now())
    }

    pub fn time_to_act(&self) -> Instant {
        self.time_to_act
    }
}

#[derive(Debug)]
struct Bucket {
    limit: Limit,
    burst: u32,
    /// Tokens at `last`; negative while reservations are outstanding.
    tokens: f64,
    /// Last time the token count was updated.
    last: Instant,
    /// Time of the latest rate-limited event (past or future).
    last_event: Instant,
}

impl Bucket {
    /// Token count at `at`, without modifying state.
    fn advance(&self, at: Instant) -> f64 {
        // time going backwards counts as no time passing
        let last = if at < self.last { at } else { self.last };
        let elapsed = at.saturating_duration_since(last);
        let tokens = self.tokens + self.limit.tokens_from_duration(elapsed);
        tokens.min(f64::from(self.burst))
    }

    fn reserve_at(
        &mut self,
        at: Instant,
        n: u32,
        max_wait: Option<Duration>,
    ) -> Option<Reservation> {
        if self.limit.is_unlimited() {
            return Some(Reservation {
                tokens: n,
                time_to_act: at,
                limit: self.limit,
            });
        }
        if n > self.burst {
            return None;
        }

        let tokens = self.advance(at) - f64::from(n);
        let wait = if tokens < 0.0 {
            self.limit.duration_from_tokens(-tokens)
        } else {
            Duration::ZERO
        };
        if max_wait.is_some_and(|max| wait > max) {
            return None;
        }
        let time_to_act = at.checked_add(wait)?;

        self.last = at;
        self.tokens = tokens;
        self.last_event = time_to_act;

        Some(Reservation {
            tokens: n,
            time_to_act,
            limit: self.limit,
        })
    }

    /// Return the tokens of an unused reservation, minus whatever later
    /// reservations were already granted on top of it.
    fn cancel_at(&mut self, reservation: &Reservation, at: Instant) {
        if self.limit.is_unlimited() || reservation.tokens == 0 || reservation.time_to_act < at {
            return;
        }

        let later = self
            .last_event
            .saturating_duration_since(reservation.time_to_act);
        let restore = f64::from(reservation.tokens) - reservation.limit.tokens_from_duration(later);
        if restore <= 0.0 {
            return;
        }

        let tokens = (self.advance(at) + restore).min(f64::from(self.burst));
        self.last = at;
        self.tokens = tokens;

        if reservation.time_to_act == self.last_event {
            let own = reservation
                .limit
                .duration_from_tokens(f64::from(reservation.tokens));
            if let Some(prev_event) = reservation.time_to_act.checked_sub(own) {
                if prev_event >= at {
                    self.last_event = prev_event;
                }
            }
        }
    }

    fn reconfigure(&mut self, at: Instant) {
        self.tokens = self.advance(at);
        self.last = at;
    }
}

/// A token bucket rate limiter safe for concurrent use.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter that starts with a full bucket.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidBurst` if `burst` is zero.
    pub fn new(limit: Limit, burst: u32) -> Result<Self> {
        if burst == 0 {
            return Err(Error::InvalidBurst { burst });
        }

        let now = Instant::now();
        Ok(Self {
            bucket: Mutex::new(Bucket {
                limit,
                burst,
                tokens: f64::from(burst),
                last: now,
                last_event: now,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> Limit {
        self.lock().limit
    }

    pub fn burst(&self) -> u32 {
        self.lock().burst
    }

    /// Tokens available right now, in `[0, burst]`.
    pub fn tokens(&self) -> f64 {
        self.lock().advance(Instant::now()).max(0.0)
    }

    /// Change the refill rate. Tokens earned under the old rate are kept.
    pub fn set_limit(&self, limit: Limit) {
        let mut bucket = self.lock();
        bucket.reconfigure(Instant::now());
        bucket.limit = limit;
    }

    /// Change the bucket size. Tokens above the new size are dropped on the
    /// next update.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidBurst` if `burst` is zero.
    pub fn set_burst(&self, burst: u32) -> Result<()> {
        if burst == 0 {
            return Err(Error::InvalidBurst { burst });
        }
        let mut bucket = self.lock();
        bucket.reconfigure(Instant::now());
        bucket.burst = burst;
        Ok(())
    }

    /// Take a token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.lock()
            .reserve_at(Instant::now(), 1, Some(Duration::ZERO))
            .is_some()
    }

    /// Reserve one token, possibly in the future. The caller is expected to
    /// wait `reservation.delay()` before acting, or cancel the reservation.
    pub fn reserve(&self) -> Option<Reservation> {
        self.lock().reserve_at(Instant::now(), 1, None)
    }

    /// Give back the tokens of a reservation that will not be used.
    pub fn cancel(&self, reservation: &Reservation) {
        self.lock().cancel_at(reservation, Instant::now());
    }

    /// Wait for a token, or until `ctx` ends.
    ///
    /// Fails immediately, without taking a token, if the context has already
    /// ended or if its deadline comes before the next token would. Without a
    /// deadline, only the context ending can make this fail.
    pub async fn wait(&self, ctx: &Context) -> std::result::Result<(), ContextError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let now = Instant::now();
        let max_wait = ctx.deadline().map(|d| d.saturating_duration_since(now));
        let reserved = self.lock().reserve_at(now, 1, max_wait);
        let Some(reservation) = reserved else {
            if max_wait.is_none() {
                // the next token lies past what the clock can represent
                debug!("Rate limit {} never grants a token; waiting on context", self.limit());
                return Err(ctx.done().await);
            }
            debug!("Rate limit wait would exceed context deadline");
            return Err(ContextError::DeadlineExceeded);
        };

        let delay = reservation.delay_from(now);
        if delay.is_zero() {
            return Ok(());
        }

        debug!("Rate limiting: waiting {:?} for a token", delay);
        tokio::select! {
            biased;
            _ = sleep_until(reservation.time_to_act) => Ok(()),
            err = ctx.done() => {
                self.cancel(&reservation);
                debug!("Rate limit wait abandoned: {}", err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(Limit::per_second(rate).unwrap(), burst).unwrap()
    }

    /// Timers fire on millisecond ticks, so allow for rounding.
    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "expected ~{:?}, got {:?}",
            expected,
            elapsed
        );
    }

    #[test]
    fn test_limiter_creation() {
        let rate = Limit::per_second(1.0).unwrap();
        assert!(RateLimiter::new(rate, 1).is_ok());
        assert!(matches!(
            RateLimiter::new(rate, 0),
            Err(Error::InvalidBurst { burst: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_admitted_immediately() {
        let limiter = limiter(1.0, 5);
        let ctx = Context::background();
        let start = Instant::now();

        for i in 1..=5 {
            limiter.wait(&ctx).await.unwrap();
            assert_eq!(limiter.tokens(), f64::from(5 - i));
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // the next one has to wait a full refill interval
        limiter.wait(&ctx).await.unwrap();
        assert_elapsed(start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_waits_are_spaced() {
        let limiter = limiter(2.0, 1);
        let ctx = Context::background();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait(&ctx).await.unwrap();
        }
        assert_elapsed(start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_replenishment() {
        let limiter = limiter(2.0, 5);
        let ctx = Context::background();

        for _ in 0..5 {
            limiter.wait(&ctx).await.unwrap();
        }
        assert_eq!(limiter.tokens(), 0.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.tokens(), 2.0);

        // capped at burst
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.tokens(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_shorter_than_refill_fails_fast() {
        let limiter = limiter(1.0, 1);
        limiter.wait(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = limiter.wait(&ctx).await.unwrap_err();

        assert_eq!(err, ContextError::DeadlineExceeded);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // the failed wait did not take a token
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.tokens(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_context() {
        let limiter = limiter(1.0, 5);
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();

        assert_eq!(limiter.wait(&ctx).await, Err(ContextError::Cancelled));
        assert_eq!(limiter.tokens(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_returns_token() {
        let limiter = Arc::new(limiter(1.0, 1));
        let start = Instant::now();
        limiter.wait(&Context::background()).await.unwrap();

        let (ctx, token) = Context::background().with_cancel();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.wait(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ContextError::Cancelled));

        // without the refund this would complete at 2s
        limiter.wait(&Context::background()).await.unwrap();
        assert_elapsed(start, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_blocks() {
        let limiter = RateLimiter::new(Limit::UNLIMITED, 1).unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(1));
        let start = Instant::now();

        for _ in 0..1000 {
            limiter.wait(&ctx).await.unwrap();
        }
        assert!(limiter.try_acquire());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire() {
        let limiter = limiter(10.0, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_and_cancel() {
        let limiter = limiter(1.0, 1);
        let first = limiter.reserve().unwrap();
        assert_eq!(first.delay(), Duration::ZERO);

        let second = limiter.reserve().unwrap();
        assert_eq!(second.delay(), Duration::from_secs(1));

        limiter.cancel(&second);
        let third = limiter.reserve().unwrap();
        assert_eq!(third.delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_and_burst() {
        let limiter = limiter(1.0, 1);
        assert!(limiter.try_acquire());

        limiter.set_limit(Limit::per_second(10.0).unwrap());
        assert_eq!(limiter.limit().rate(), 10.0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire());

        limiter.set_burst(3).unwrap();
        assert_eq!(limiter.burst(), 3);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.tokens(), 3.0);

        assert!(limiter.set_burst(0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_all_admitted() {
        let limiter = Arc::new(limiter(10.0, 2));
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait(&Context::background()).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // (6 - 2) tokens at 10/s
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_admitted_in_request_order() {
        let limiter = Arc::new(limiter(100.0, 1));
        let admitted = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                limiter.wait(&Context::background()).await.unwrap();
                admitted.lock().unwrap().push(i);
            }));
            // let the waiter take its reservation before the next one starts
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected: Vec<i32> = (0..20).collect();
        assert_eq!(*admitted.lock().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_token_waits_for_context() {
        // one token per 1e20 seconds: the next one is beyond any Instant
        let limiter = limiter(1e-20, 1);
        limiter.wait(&Context::background()).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_secs(3600),
            limiter.wait(&Context::background()),
        )
        .await;
        assert!(blocked.is_err(), "background wait must block, got {:?}", blocked);

        let (ctx, token) = Context::background().with_cancel();
        let start = Instant::now();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        assert_eq!(limiter.wait(&ctx).await, Err(ContextError::Cancelled));
        assert!(start.elapsed() >= Duration::from_secs(1));
        canceller.await.unwrap();

        // a deadline still fails fast
        let ctx = Context::background().with_timeout(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.wait(&ctx).await, Err(ContextError::DeadlineExceeded));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
