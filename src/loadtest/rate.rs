//! Shared request rate limiting.
//!
//! One [`RateLimiter`] per run, shared by every virtual user through `Arc`.
//! The bucket is a GCRA limiter from `governor`, which refills continuously, so
//! fractional rates such as 0.5 requests/sec work and no burst appears at
//! second boundaries. Waiters line up on a FIFO mutex in front of the bucket so
//! only the head of the queue polls for capacity.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio_util::sync::CancellationToken;

use crate::loadtest::error::{ErrorKind, RequestError};

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Permission to send exactly one request.
#[derive(Debug)]
#[must_use = "a rate token authorizes one send attempt"]
pub struct RateToken {
    _private: (),
}

impl RateToken {
    fn grant() -> Self {
        Self { _private: () }
    }
}

struct Bucket {
    limiter: DirectLimiter,
    queue: tokio::sync::Mutex<()>,
}

/// Token-bucket rate limiter shared by all virtual users of a run.
pub struct RateLimiter {
    bucket: Option<Bucket>,
    rate: Option<f64>,
    acquire_timeout: Option<Duration>,
}

/// Burst capacity: 100 ms worth of tokens, at least one.
pub fn burst_for(rate: f64) -> u32 {
    ((rate / 10.0).ceil() as u32).max(1)
}

impl RateLimiter {
    /// Creates a limiter for `rate` requests/sec.
    ///
    /// `None` or a non-positive rate disables limiting. With `acquire_timeout`
    /// set, a waiter that is not granted in time gets `rate_limit_exhausted`.
    pub fn new(rate: Option<f64>, acquire_timeout: Option<Duration>) -> Self {
        let bucket = rate.filter(|r| r.is_finite() && *r > 0.0).and_then(|rps| {
            let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rps))?
                .allow_burst(NonZeroU32::new(burst_for(rps))?);
            Some(Bucket {
                limiter: governor::RateLimiter::direct(quota),
                queue: tokio::sync::Mutex::new(()),
            })
        });
        Self {
            rate: bucket.as_ref().and(rate),
            bucket,
            acquire_timeout,
        }
    }

    /// A limiter that grants immediately.
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// The configured rate in requests/sec, if limiting is enabled.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Waits for a token.
    ///
    /// Returns `Ok(None)` when `cancel` fires first, and a
    /// `rate_limit_exhausted` error when the acquire timeout elapses.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RateToken>, RequestError> {
        let Some(bucket) = &self.bucket else {
            return Ok(Some(RateToken::grant()));
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let wait = async {
            let _turn = bucket.queue.lock().await;
            bucket.limiter.until_ready().await;
        };

        match self.acquire_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                granted = tokio::time::timeout(limit, wait) => match granted {
                    Ok(()) => Ok(Some(RateToken::grant())),
                    Err(_) => Err(RequestError::new(
                        ErrorKind::RateLimitExhausted,
                        format!("no rate token within {}ms", limit.as_millis()),
                    )),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                () = wait => Ok(Some(RateToken::grant())),
            },
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate", &self.rate)
            .field("enabled", &self.is_enabled())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_disabled_for_missing_or_non_positive_rate() {
        assert!(!RateLimiter::new(None, None).is_enabled());
        assert!(!RateLimiter::new(Some(0.0), None).is_enabled());
        assert!(!RateLimiter::new(Some(-3.0), None).is_enabled());
        assert!(RateLimiter::new(Some(0.5), None).is_enabled());
        assert_eq!(RateLimiter::new(Some(25.0), None).rate(), Some(25.0));
        assert_eq!(RateLimiter::new(Some(0.0), None).rate(), None);
    }

    #[test]
    fn test_burst_is_a_tenth_of_a_second() {
        assert_eq!(burst_for(0.5), 1);
        assert_eq!(burst_for(10.0), 1);
        assert_eq!(burst_for(40.0), 4);
        assert_eq!(burst_for(1000.0), 100);
    }

    #[tokio::test]
    async fn test_unlimited_grants_immediately() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        for _ in 0..1000 {
            assert!(limiter.acquire(&cancel).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_sliding_window_never_exceeds_rate() {
        let rate = 40.0;
        let limiter = RateLimiter::new(Some(rate), None);
        let cancel = CancellationToken::new();
        let mut grants = Vec::new();
        for _ in 0..60 {
            let token = limiter.acquire(&cancel).await.unwrap();
            assert!(token.is_some());
            grants.push(Instant::now());
        }
        let allowed = rate as usize + burst_for(rate) as usize;
        for (i, start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= allowed, "{in_window} grants within 1s");
        }
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiter() {
        let limiter = RateLimiter::new(Some(0.1), None);
        let cancel = CancellationToken::new();
        // Drain the single burst token.
        assert!(limiter.acquire(&cancel).await.unwrap().is_some());

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let outcome = limiter.acquire(&cancel).await.unwrap();
        assert!(outcome.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_resource_exhaustion() {
        let limiter = RateLimiter::new(Some(0.1), Some(Duration::from_millis(50)));
        let cancel = CancellationToken::new();
        assert!(limiter.acquire(&cancel).await.unwrap().is_some());
        let err = limiter.acquire(&cancel).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExhausted);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(Some(20.0), None));
        let cancel = CancellationToken::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let token = limiter.acquire(&cancel).await.unwrap();
                assert!(token.is_some());
                order.lock().push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }
}
