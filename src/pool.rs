//! The global request pool: an in-flight cap and a token-bucket rate
//! limiter combined in one middleware.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::{CancelToken, Request};
use crate::response::Response;

/// Global concurrency and rate configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum requests in flight at once; `None` leaves it unbounded.
    pub max: Option<usize>,
    /// Tokens replenished per interval; `None` disables rate limiting.
    pub requests_per_interval: Option<u32>,
    /// Replenishment interval for the token bucket.
    pub interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: None,
            requests_per_interval: None,
            interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Whether either mechanism is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max.is_some() || self.requests_per_interval.is_some()
    }
}

/// Middleware enforcing the global in-flight cap and admission rate.
///
/// Waiters are FIFO; a request's timer starts at token acquisition, so
/// queue wait is visible only to callers measuring wall clock. Permits are
/// released when the guard drops, whatever the outcome, and a cancelled
/// waiter leaves the queue without ever holding a permit.
pub struct RequestPoolMiddleware {
    semaphore: Option<Arc<Semaphore>>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for RequestPoolMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPoolMiddleware")
            .field("in_flight_cap", &self.semaphore.is_some())
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl RequestPoolMiddleware {
    /// Build from configuration. Fails when the rate is zero or the
    /// interval cannot be divided into token periods.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let semaphore = config.max.map(|max| Arc::new(Semaphore::new(max)));
        let limiter = match config.requests_per_interval {
            Some(per_interval) => {
                let burst = NonZeroU32::new(per_interval).ok_or_else(|| {
                    Error::Config(
                        "requests_per_interval must be at least 1".into(),
                    )
                })?;
                let period = config.interval / per_interval;
                let quota = Quota::with_period(period)
                    .ok_or_else(|| {
                        Error::Config("interval must be non-zero".into())
                    })?
                    .allow_burst(burst);
                Some(DefaultDirectRateLimiter::direct(quota))
            }
            None => None,
        };
        Ok(Self { semaphore, limiter })
    }

    /// Permits currently available, when an in-flight cap is configured.
    #[must_use]
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}

#[async_trait::async_trait]
impl Middleware for RequestPoolMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        // Token before permit: rate admission happens first so a burst of
        // waiters cannot hold permits while throttled.
        if let Some(limiter) = &self.limiter {
            tokio::select! {
                biased;
                kind = req.aborted() => {
                    return Err(CancelToken::abort_error(kind, Duration::ZERO));
                }
                () = limiter.until_ready() => {}
            }
        }
        let _permit = match &self.semaphore {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    biased;
                    kind = req.aborted() => {
                        return Err(CancelToken::abort_error(
                            kind,
                            Duration::ZERO,
                        ));
                    }
                    permit = Arc::clone(semaphore).acquire_owned() => permit,
                };
                Some(acquired.map_err(|_| Error::network("pool closed"))?)
            }
            None => None,
        };
        next.run(req).await
    }

    fn name(&self) -> &'static str {
        "request-pool"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn zero_rate_is_a_config_error() {
        let config = PoolConfig {
            max: None,
            requests_per_interval: Some(0),
            interval: Duration::from_secs(1),
        };
        assert!(matches!(
            RequestPoolMiddleware::new(config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn semaphore_bounds_concurrent_holders() {
        let pool = RequestPoolMiddleware::new(PoolConfig {
            max: Some(2),
            requests_per_interval: None,
            interval: Duration::from_secs(1),
        })
        .unwrap();
        let semaphore = pool.semaphore.clone().unwrap();

        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let semaphore = Arc::clone(&semaphore);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn token_bucket_spaces_admissions() {
        let pool = RequestPoolMiddleware::new(PoolConfig {
            max: None,
            requests_per_interval: Some(2),
            interval: Duration::from_millis(100),
        })
        .unwrap();
        let limiter = pool.limiter.as_ref().unwrap();

        let started = Instant::now();
        // Burst of two is immediate, the next two wait for replenishment.
        for _ in 0..4 {
            limiter.until_ready().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
