//! Retry with exponential backoff, jitter, and `Retry-After` support.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;

use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// One retry decision, reported to the `on_retry` observer.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    /// Delay before the next attempt
    pub delay: Duration,
    /// Status that triggered the retry, when one was received
    pub status: Option<u16>,
    /// Error that triggered the retry, when the attempt errored
    pub error: Option<String>,
}

/// Observer invoked before each retry sleep.
pub type OnRetry = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Retry policy.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts, the first included.
    pub attempts: u32,
    /// Statuses worth retrying.
    pub retriable_statuses: Vec<u16>,
    /// Retry network-class failures (refused, reset, DNS, TLS).
    pub retry_network_errors: bool,
    /// Retry timeout-class failures.
    pub retry_timeouts: bool,
    /// Base backoff; doubles each attempt before jitter.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Honor `Retry-After` (delta-seconds or HTTP-date).
    pub respect_retry_after: bool,
    /// Observer for retry events.
    pub on_retry: Option<OnRetry>,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("attempts", &self.attempts)
            .field("retriable_statuses", &self.retriable_statuses)
            .field("retry_network_errors", &self.retry_network_errors)
            .field("retry_timeouts", &self.retry_timeouts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("respect_retry_after", &self.respect_retry_after)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retriable_statuses: vec![408, 429, 500, 502, 503, 504],
            retry_network_errors: true,
            retry_timeouts: true,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
            respect_retry_after: true,
            on_retry: None,
        }
    }
}

impl RetryConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.backoff_max);
        // Full-ish jitter: half to full of the exponential step.
        let factor = rand::rng().random_range(0.5..=1.0);
        capped.mul_f64(factor)
    }
}

/// Middleware re-running the tail of the chain on retriable failures.
#[derive(Debug)]
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    /// Create the middleware.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn delay_for(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        match retry_after {
            Some(after) if self.config.respect_retry_after => after,
            _ => self.config.backoff(attempt),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        // One-shot bodies get exactly one attempt.
        if !req.body().is_cloneable() {
            return next.run(req).await;
        }
        let attempts = self.config.attempts.max(1);
        let mut original = Some(req);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let is_last = attempt >= attempts;
            let this_req = match &original {
                _ if is_last => {
                    original.take().expect("retry attempt past final")
                }
                Some(req) => req.try_clone()?,
                None => unreachable!("retry attempt past final"),
            };
            match next.clone().run(this_req).await {
                Ok(mut response) => {
                    let status = response.status().as_u16();
                    if !is_last
                        && self.config.retriable_statuses.contains(&status)
                    {
                        let delay = self.delay_for(
                            attempt,
                            retry_after(response.headers()),
                        );
                        self.wait(attempt, delay, Some(status), None).await;
                        continue;
                    }
                    response.set_retry_count(attempt - 1);
                    return Ok(response);
                }
                Err(err) => {
                    let class_retriable = match &err {
                        Error::Network { .. } => {
                            self.config.retry_network_errors
                        }
                        Error::Timeout { .. } => self.config.retry_timeouts,
                        _ => false,
                    };
                    let status_retriable = err.status().is_some_and(|s| {
                        self.config.retriable_statuses.contains(&s)
                    });
                    if is_last || !(class_retriable || status_retriable) {
                        return Err(err);
                    }
                    let after = match &err {
                        Error::HttpStatus { response, .. } => {
                            retry_after(response.headers())
                        }
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, after);
                    self.wait(
                        attempt,
                        delay,
                        err.status(),
                        Some(err.to_string()),
                    )
                    .await;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "retry"
    }
}

impl RetryMiddleware {
    async fn wait(
        &self,
        attempt: u32,
        delay: Duration,
        status: Option<u16>,
        error: Option<String>,
    ) {
        let event = RetryEvent { attempt, delay, status, error };
        log::debug!(
            "retrying after attempt {attempt} in {delay:?} (status {status:?})"
        );
        if let Some(on_retry) = &self.config.on_retry {
            on_retry(&event);
        }
        tokio::time::sleep(delay).await;
    }
}

/// Parse a `Retry-After` header value: delta-seconds or HTTP-date.
fn retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(raw).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn retry_after_parses_seconds_and_dates() {
        let mut headers = HeaderMap::new();
        headers
            .insert(http::header::RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));

        let when = SystemTime::now() + Duration::from_secs(30);
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(when)).unwrap(),
        );
        let parsed = retry_after(&headers).unwrap();
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(28));
    }

    #[test]
    fn backoff_doubles_within_jitter_band() {
        let config = RetryConfig::default();
        for attempt in 1..=3 {
            let base = config
                .backoff_base
                .saturating_mul(2u32.pow(attempt - 1))
                .min(config.backoff_max);
            for _ in 0..16 {
                let delay = config.backoff(attempt);
                assert!(delay >= base.mul_f64(0.5));
                assert!(delay <= base);
            }
        }
    }
}
