//! Client-side rate limiting and server rate-limit hints.
//!
//! [`RateLimiter`] is the admission gate every call passes before its first physical
//! attempt. [`RateLimitInfo`] parses the hints a server attaches to 429 responses so
//! the retry policy can wait exactly as long as the server asks.

use crate::context::{Context, ContextError};
use http::HeaderMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Header values below this are "seconds from now"; above, Unix timestamps.
const RESET_DELTA_THRESHOLD_SECS: f64 = 1_000_000_000.0;

/// A token-bucket rate limiter.
///
/// Tokens accrue continuously at `rate` per second up to `burst`. Each
/// [`acquire`](RateLimiter::acquire) takes one token; when none is available the
/// caller reserves the next one and sleeps until it matures, so concurrent callers
/// are admitted one every `1 / rate` seconds.
///
/// One limiter belongs to one client; it is never shared through global state.
///
/// # Examples
///
/// ```
/// use tfe_core::{Context, RateLimiter};
///
/// # async fn example() -> Result<(), tfe_core::ContextError> {
/// let limiter = RateLimiter::new(10.0, 5);
/// let ctx = Context::background();
/// limiter.acquire(&ctx).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Tokens per second; `None` admits everything.
    rate: Option<f64>,
    burst: f64,
    /// May go negative: outstanding reservations.
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let Some(rate) = self.rate else {
            return;
        };
        if now <= self.last_refill_at {
            return;
        }
        let elapsed = now.duration_since(self.last_refill_at).as_secs_f64();
        self.last_refill_at = now;
        self.tokens = (self.tokens + elapsed * rate).min(self.burst);
    }

    /// Takes a token and returns how long until it may be used.
    fn reserve(&mut self, now: Instant) -> Duration {
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / rate).unwrap_or(Duration::MAX)
        }
    }

    fn release(&mut self, now: Instant) {
        if self.rate.is_none() {
            return;
        }
        self.refill(now);
        self.tokens = (self.tokens + 1.0).min(self.burst);
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `rate` requests per second with bursts of up to
    /// `burst` requests. The bucket starts full.
    ///
    /// A non-finite or non-positive `rate` yields an unlimited limiter; `burst` is at
    /// least 1.
    pub fn new(rate: f64, burst: usize) -> Self {
        let rate = (rate.is_finite() && rate > 0.0).then_some(rate);
        let burst = burst.max(1) as f64;
        Self {
            bucket: Mutex::new(TokenBucket {
                rate,
                burst,
                tokens: burst,
                last_refill_at: Instant::now(),
            }),
        }
    }

    /// Creates a limiter that admits every call immediately.
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, 1)
    }

    /// Creates a limiter from a server-advertised `X-RateLimit-Limit` value.
    ///
    /// Two thirds of the advertised limit become the steady rate and one third the
    /// burst, leaving headroom below the server's own limit. A missing or invalid
    /// value yields an unlimited limiter.
    ///
    /// ```
    /// use tfe_core::RateLimiter;
    ///
    /// let limiter = RateLimiter::from_advertised_limit(Some("30"));
    /// assert_eq!(limiter.rate(), Some(30.0 * 0.66));
    /// assert_eq!(limiter.burst(), 9);
    ///
    /// assert_eq!(RateLimiter::from_advertised_limit(None).rate(), None);
    /// ```
    pub fn from_advertised_limit(limit: Option<&str>) -> Self {
        let limiter = Self::unlimited();
        limiter.reconfigure_from_advertised_limit(limit);
        limiter
    }

    /// Replaces rate and burst in place; used when a server advertises its limit
    /// after the client was built.
    pub fn reconfigure(&self, rate: f64, burst: usize) {
        let now = Instant::now();
        let mut bucket = self.lock();
        bucket.refill(now);
        let rate = (rate.is_finite() && rate > 0.0).then_some(rate);
        let burst = burst.max(1) as f64;
        if bucket.rate.is_none() {
            bucket.tokens = burst;
        }
        bucket.rate = rate;
        bucket.burst = burst;
        bucket.tokens = bucket.tokens.min(burst);
        bucket.last_refill_at = now;
    }

    /// [`reconfigure`](RateLimiter::reconfigure) from an `X-RateLimit-Limit` value.
    pub fn reconfigure_from_advertised_limit(&self, limit: Option<&str>) {
        match limit.and_then(|v| v.trim().parse::<f64>().ok()) {
            Some(limit) if limit.is_finite() && limit > 0.0 => {
                let burst = (limit * 0.33) as usize;
                tracing::debug!(limit, burst, "Configuring rate limiter from advertised limit");
                self.reconfigure(limit * 0.66, burst);
            }
            _ => self.reconfigure(f64::INFINITY, 1),
        }
    }

    /// The steady rate in tokens per second, or `None` when unlimited.
    pub fn rate(&self) -> Option<f64> {
        self.lock().rate
    }

    /// The bucket capacity.
    pub fn burst(&self) -> usize {
        self.lock().burst as usize
    }

    /// Waits for a token.
    ///
    /// Returns the context's error, without waiting, if the context is already done
    /// or its deadline falls before the token would become available. If the context
    /// finishes while waiting, the reserved token is handed back.
    pub async fn acquire(&self, ctx: &Context) -> Result<(), ContextError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let now = Instant::now();
        let wait = self.lock().reserve(now);
        if wait.is_zero() {
            return Ok(());
        }

        if let Some(deadline) = ctx.deadline() {
            // An unrepresentable maturity lies past any deadline.
            if now.checked_add(wait).map_or(true, |ready| ready > deadline) {
                self.lock().release(Instant::now());
                return Err(ContextError::DeadlineExceeded);
            }
        }

        tracing::debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
        match ctx.sleep(wait).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.lock().release(Instant::now());
                Err(err)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        // The bucket holds plain numbers; a panic mid-update leaves nothing to repair.
        self.bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Information extracted from rate limit headers of a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// When the rate limit resets (from `X-RateLimit-Reset` or `RateLimit-Reset`).
    pub reset_at: Option<SystemTime>,

    /// How long to wait before retrying (from `Retry-After`).
    pub retry_after: Option<Duration>,

    /// Number of requests remaining in the current window.
    pub remaining: Option<u64>,
}

impl RateLimitInfo {
    /// Extracts rate limit information from response headers.
    ///
    /// - `Retry-After`: delay-seconds or HTTP date
    /// - `X-RateLimit-Reset` / `RateLimit-Reset`: fractional seconds until reset, or a
    ///   Unix timestamp for large values
    /// - `X-RateLimit-Remaining`
    ///
    /// # Examples
    ///
    /// ```
    /// use tfe_core::rate_limit::RateLimitInfo;
    /// use http::HeaderMap;
    ///
    /// let mut headers = HeaderMap::new();
    /// headers.insert("x-ratelimit-reset", "0.25".parse().unwrap());
    /// headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
    ///
    /// let info = RateLimitInfo::from_headers(&headers);
    /// assert!(info.reset_at.is_some());
    /// assert!(info.is_rate_limited());
    /// ```
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            reset_at: parse_rate_limit_reset(headers),
            retry_after: parse_retry_after(headers),
            remaining: parse_rate_limit_remaining(headers),
        }
    }

    /// Returns the recommended delay before retrying, capped by `max_wait`.
    ///
    /// Prefers `retry_after`, then the time until `reset_at`.
    pub fn delay(&self, max_wait: Duration) -> Option<Duration> {
        if let Some(retry_after) = self.retry_after {
            return Some(retry_after.min(max_wait));
        }

        if let Some(reset_at) = self.reset_at {
            let until_reset = reset_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            return Some(until_reset.min(max_wait));
        }

        None
    }

    /// Returns `true` if the headers describe an active rate limit.
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after.is_some() || self.remaining == Some(0)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date_time = httpdate::parse_http_date(header).ok()?;
    Some(
        date_time
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

fn parse_rate_limit_reset(headers: &HeaderMap) -> Option<SystemTime> {
    ["x-ratelimit-reset", "ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name)?.to_str().ok()?.trim().parse::<f64>().ok())
        .find(|value| value.is_finite() && *value >= 0.0)
        .and_then(|value| {
            let offset = Duration::try_from_secs_f64(value).ok()?;
            if value < RESET_DELTA_THRESHOLD_SECS {
                SystemTime::now().checked_add(offset)
            } else {
                UNIX_EPOCH.checked_add(offset)
            }
        })
}

fn parse_rate_limit_remaining(headers: &HeaderMap) -> Option<u64> {
    let header = headers.get("x-ratelimit-remaining")?.to_str().ok()?;
    header.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_burst_admits_immediately() {
        let limiter = RateLimiter::new(1.0, 3);
        let ctx = Context::background();
        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire(&ctx).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_are_spaced() {
        let limiter = Arc::new(RateLimiter::new(20.0, 1));
        let ctx = Context::background();
        let start = std::time::Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    limiter.acquire(&ctx).await.unwrap();
                    start.elapsed()
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        // One token up front, then one every 50ms.
        assert!(
            admitted[4] >= Duration::from_millis(190),
            "last admission at {:?}",
            admitted[4]
        );
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_returns_token() {
        let limiter = Arc::new(RateLimiter::new(1.0, 1));
        let ctx = Context::background();
        limiter.acquire(&ctx).await.unwrap();

        let waiting = ctx.child();
        let task = tokio::spawn({
            let limiter = limiter.clone();
            let waiting = waiting.clone();
            async move { limiter.acquire(&waiting).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting.cancel();

        assert_eq!(task.await.unwrap(), Err(ContextError::Cancelled));
        // The abandoned reservation no longer delays the next caller beyond one period.
        let bucket = limiter.lock();
        assert!(bucket.tokens > -1.0);
    }

    #[tokio::test]
    async fn test_deadline_shorter_than_wait_fails_fast() {
        let limiter = RateLimiter::new(0.5, 1);
        limiter.acquire(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let start = std::time::Instant::now();
        assert_eq!(
            limiter.acquire(&ctx).await,
            Err(ContextError::DeadlineExceeded)
        );
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_vanishing_advertised_rate_waits_without_overflow() {
        let limiter = Arc::new(RateLimiter::from_advertised_limit(Some("1e-300")));
        assert_eq!(limiter.burst(), 1);
        limiter.acquire(&Context::background()).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert_eq!(
            limiter.acquire(&ctx).await,
            Err(ContextError::DeadlineExceeded)
        );

        let ctx = Context::background();
        let task = tokio::spawn({
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            async move { limiter.acquire(&ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        assert_eq!(task.await.unwrap(), Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let ctx = Context::background();
        for _ in 0..1000 {
            limiter.acquire(&ctx).await.unwrap();
        }
        assert_eq!(limiter.rate(), None);
    }

    #[tokio::test]
    async fn test_advertised_limit_split() {
        let limiter = RateLimiter::from_advertised_limit(Some("30"));
        assert_eq!(limiter.rate(), Some(30.0 * 0.66));
        assert_eq!(limiter.burst(), 9);

        limiter.reconfigure_from_advertised_limit(Some("not-a-number"));
        assert_eq!(limiter.rate(), None);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("60"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_parse_fractional_reset_delta() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("0.5"));

        let info = RateLimitInfo::from_headers(&headers);
        let delay = info.delay(Duration::from_secs(300)).unwrap();
        assert!(delay <= Duration::from_millis(500));
        assert!(delay >= Duration::from_millis(400));
    }

    #[test]
    fn test_parse_unix_timestamp_reset() {
        let mut headers = HeaderMap::new();
        let future_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 120;
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&future_timestamp.to_string()).unwrap(),
        );

        let delay = RateLimitInfo::from_headers(&headers)
            .delay(Duration::from_secs(300))
            .unwrap();
        assert!(delay > Duration::from_secs(100));
    }

    #[test]
    fn test_out_of_range_reset_is_ignored() {
        for value in ["1e30", "18446744073709551616", "1e308"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-reset", HeaderValue::from_static(value));

            let info = RateLimitInfo::from_headers(&headers);
            assert_eq!(info.reset_at, None, "reset {}", value);
            assert_eq!(info.delay(Duration::from_secs(300)), None);
        }
    }

    #[test]
    fn test_rate_limit_delay_capped_by_max_wait() {
        let info = RateLimitInfo {
            reset_at: None,
            retry_after: Some(Duration::from_secs(600)),
            remaining: Some(0),
        };
        assert_eq!(
            info.delay(Duration::from_secs(300)),
            Some(Duration::from_secs(300))
        );
    }
}
