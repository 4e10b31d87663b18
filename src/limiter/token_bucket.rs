//! Token Bucket
//!
//! Byte-rate limiter with a burst ceiling and a bounded wait.
//!
//! # Semantics
//!
//! - Capacity refills at `speed` bytes per second, up to `max_capacity`
//! - A request that fits is granted immediately
//! - A request that would have to wait longer than `timeout` is refused
//!   without touching the bucket
//! - Otherwise the bucket is drained, the refill clock is pushed into the
//!   future by the wait, and the caller sleeps outside the lock
//!
//! Because waiting callers move `last_consume` forward, the next caller can
//! observe a negative elapsed time and see a negative tentative capacity.
//! That is how queued reservations are charged to later callers.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;

/// Mutable part of the bucket
#[derive(Debug)]
struct BucketState {
    /// Stored capacity, always within `[0, max_capacity]`
    capacity: i64,
    last_consume: Instant,
}

/// What a single `consume` call decided under the lock
#[derive(Debug, PartialEq)]
enum Reservation {
    Granted,
    Wait(Duration),
    Refused,
}

/// Rate limiter configured by `"<speed>x<timeoutSecs>/<maxCapacity>"`
#[derive(Debug)]
pub struct TokenBucket {
    /// Bytes per second, 0 = unlimited
    speed: u64,
    max_capacity: u64,
    timeout: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket. A fresh bucket starts full.
    pub fn new(speed: u64, timeout: Duration, max_capacity: u64) -> Self {
        Self {
            speed,
            max_capacity,
            timeout,
            state: Mutex::new(BucketState {
                capacity: i64::try_from(max_capacity).unwrap_or(i64::MAX),
                last_consume: Instant::now(),
            }),
        }
    }

    /// Bucket that grants everything
    pub fn unlimited() -> Self {
        Self::new(0, Duration::ZERO, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.speed == 0
    }

    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn max_capacity(&self) -> u64 {
        self.max_capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Stored capacity as of the last grant, without refilling
    pub fn capacity(&self) -> i64 {
        self.state.lock().capacity
    }

    /// Take `n` bytes from the bucket, sleeping if the shortfall can be
    /// refilled within the timeout.
    ///
    /// Returns `false` only when the required wait exceeds the timeout. The
    /// sleep is not cancellable.
    pub async fn consume(&self, n: u64) -> bool {
        match self.reserve(n, Instant::now()) {
            Reservation::Granted => true,
            Reservation::Refused => false,
            Reservation::Wait(wait) => {
                trace!(bytes = n, wait_ms = wait.as_millis() as u64, "token bucket waiting");
                tokio::time::sleep(wait).await;
                true
            }
        }
    }

    fn reserve(&self, n: u64, now: Instant) -> Reservation {
        if self.speed == 0 {
            return Reservation::Granted;
        }

        // larger than any bucket can ever hold
        let Ok(n) = i64::try_from(n) else {
            return Reservation::Refused;
        };

        let mut state = self.state.lock();

        let elapsed_ms = if now >= state.last_consume {
            now.duration_since(state.last_consume).as_millis() as i128
        } else {
            -(state.last_consume.duration_since(now).as_millis() as i128)
        };

        // speed * elapsed can exceed i64
        let ceiling = (self.max_capacity as i128).min(i64::MAX as i128);
        let refill = elapsed_ms * self.speed as i128 / 1000;
        let tentative = (state.capacity as i128 + refill).min(ceiling);

        if n as i128 <= tentative {
            state.capacity = (tentative - n as i128) as i64;
            state.last_consume = now;
            return Reservation::Granted;
        }

        let secs = (n as i128 - tentative) as f64 / self.speed as f64;
        let wait = Duration::from_millis((secs * 1000.0) as u64);
        if wait > self.timeout {
            return Reservation::Refused;
        }

        state.capacity = 0;
        state.last_consume = now + wait;
        Reservation::Wait(wait)
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Display for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}/{}",
            self.speed,
            self.timeout.as_secs(),
            self.max_capacity
        )
    }
}

impl FromStr for TokenBucket {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::unlimited());
        }

        let invalid = || Error::InvalidThrottle(s.to_string());

        let (speed, rest) = s.split_once('x').ok_or_else(invalid)?;
        let (timeout, max) = rest.split_once('/').ok_or_else(invalid)?;

        let speed: u64 = speed.parse().map_err(|_| invalid())?;
        let timeout: u64 = timeout.parse().map_err(|_| invalid())?;
        let max: u64 = max.parse().map_err(|_| invalid())?;

        Ok(Self::new(speed, Duration::from_secs(timeout), max))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_parse_and_display() {
        let bucket: TokenBucket = "10x2/20".parse().unwrap();
        assert_eq!(bucket.speed(), 10);
        assert_eq!(bucket.timeout(), Duration::from_secs(2));
        assert_eq!(bucket.max_capacity(), 20);
        assert_eq!(bucket.to_string(), "10x2/20");

        let again: TokenBucket = bucket.to_string().parse().unwrap();
        assert_eq!(again.to_string(), "10x2/20");
    }

    #[test]
    fn test_empty_is_unlimited() {
        let bucket: TokenBucket = "".parse().unwrap();
        assert!(bucket.is_unlimited());
        assert_eq!(bucket.to_string(), "0x0/0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["10", "10x2", "ax2/20", "10x2/-1", "10/2x20", "10x2/20/1"] {
            assert_matches!(bad.parse::<TokenBucket>(), Err(Error::InvalidThrottle(_)), "{}", bad);
        }
    }

    #[test]
    fn test_starts_full() {
        let bucket = TokenBucket::new(10, Duration::from_secs(2), 20);
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.reserve(20, Instant::now()), Reservation::Granted);
        assert_eq!(bucket.capacity(), 0);
    }

    #[test]
    fn test_refusal_leaves_state_untouched() {
        let bucket = TokenBucket::new(10, Duration::from_secs(2), 20);
        let now = Instant::now();
        assert_eq!(bucket.reserve(41, now), Reservation::Refused);
        assert_eq!(bucket.capacity(), 20);
        assert_eq!(bucket.reserve(20, now), Reservation::Granted);
    }

    #[test]
    fn test_refill_is_clamped() {
        let bucket = TokenBucket::new(1000, Duration::from_secs(1), 100);
        let now = Instant::now();
        assert_eq!(bucket.reserve(100, now), Reservation::Granted);
        // ten seconds later the bucket holds max, not 10000
        let later = now + Duration::from_secs(10);
        assert_eq!(bucket.reserve(100, later), Reservation::Granted);
        assert_eq!(bucket.capacity(), 0);
    }

    #[test]
    fn test_wait_pushes_clock_forward() {
        let bucket = TokenBucket::new(10, Duration::from_secs(2), 20);
        let now = Instant::now();
        assert_eq!(bucket.reserve(20, now), Reservation::Granted);
        assert_eq!(bucket.reserve(10, now), Reservation::Wait(Duration::from_secs(1)));

        // a second caller at the same instant sees the reservation as debt
        assert_eq!(bucket.reserve(10, now), Reservation::Wait(Duration::from_secs(2)));
        assert_eq!(bucket.reserve(1, now), Reservation::Refused);
    }

    #[test]
    fn test_fast_bucket_long_idle_refills_to_max() {
        let bucket = TokenBucket::new(10_000_000_000, Duration::from_secs(1), 1000);
        let later = Instant::now() + Duration::from_secs(11 * 24 * 3600);
        assert_eq!(bucket.reserve(1, later), Reservation::Granted);
        assert_eq!(bucket.capacity(), 999);
    }

    #[tokio::test]
    async fn test_request_beyond_i64_refused() {
        let bucket = TokenBucket::new(10, Duration::from_secs(2), 20);
        assert!(!bucket.consume(u64::MAX).await);
        assert!(!bucket.consume(i64::MAX as u64 + 1).await);
        assert_eq!(bucket.capacity(), 20);
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let bucket = TokenBucket::unlimited();
        assert!(bucket.consume(u64::MAX / 2).await);
    }

    #[tokio::test]
    async fn test_concurrent_consume_waits_for_refill() {
        let bucket = Arc::new(TokenBucket::new(10, Duration::from_secs(2), 20));
        let start = Instant::now();

        let a = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.consume(20).await }
        });
        let b = tokio::spawn({
            let bucket = Arc::clone(&bucket);
            async move { bucket.consume(20).await }
        });

        assert!(a.await.unwrap());
        assert!(b.await.unwrap());

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1900), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_over_timeout_refused_immediately() {
        let bucket = TokenBucket::new(10, Duration::from_secs(2), 20);
        let start = Instant::now();
        assert!(!bucket.consume(41).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
