//! Retry policy for transient failures.
//!
//! [`RetryPolicy::send`] wraps a single logical exchange around as many physical
//! attempts as the policy allows. Retries happen on network errors and on transient
//! statuses (429 and 5xx by default), with exponential backoff and jitter between
//! attempts. The number of attempts and the total elapsed time are both bounded;
//! when either bound is hit, the last response or error is handed back unchanged.

use crate::call::Call;
use crate::context::Context;
use crate::rate_limit::RateLimitInfo;
use crate::transport::{RawResponse, Transport, TransportError};
use crate::{Error, Result};
use http::{HeaderMap, StatusCode};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The result of one physical attempt, as seen by a [`RetryPredicate`].
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// The exchange failed below the HTTP layer.
    Transport(&'a TransportError),
    /// The server answered.
    Status(StatusCode, &'a HeaderMap),
}

impl Outcome<'_> {
    /// Returns `true` when the failure shows the server did not process the request,
    /// which makes a retry safe regardless of idempotency.
    pub fn is_unprocessed(&self) -> bool {
        match self {
            Outcome::Transport(error) => error.is_connect(),
            Outcome::Status(status, _) => *status == StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Decides whether a failed attempt should be retried.
///
/// # Examples
///
/// ```
/// use tfe_core::retry::{Outcome, RetryPredicate};
///
/// struct RetryOnServiceUnavailable;
///
/// impl RetryPredicate for RetryOnServiceUnavailable {
///     fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
///         matches!(outcome, Outcome::Status(status, _) if status.as_u16() == 503)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// `attempt` is the 1-indexed number of the attempt that produced `outcome`.
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool;
}

/// Retry network errors, 429 and every 5xx. The default predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTransient;

impl RetryPredicate for RetryOnTransient {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        match outcome {
            Outcome::Transport(_) => true,
            Outcome::Status(status, _) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// Retry only when the server says the client is being rate limited.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRateLimited;

impl RetryPredicate for RetryOnRateLimited {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        matches!(outcome, Outcome::Status(status, _) if *status == StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Retry only on network errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, outcome: &Outcome<'_>, _attempt: usize) -> bool {
        matches!(outcome, Outcome::Transport(_))
    }
}

/// Combine predicates with OR logic.
///
/// ```
/// use tfe_core::retry::{OrPredicate, RetryOnConnectionError, RetryOnRateLimited};
///
/// // Network errors or 429, but not 5xx.
/// let predicate = OrPredicate::new(vec![
///     Box::new(RetryOnConnectionError),
///     Box::new(RetryOnRateLimited),
/// ]);
/// ```
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, outcome: &Outcome<'_>, attempt: usize) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(outcome, attempt))
    }
}

/// Bounds and backoff for retrying a call.
///
/// Defaults: up to 30 attempts within 60 seconds, backoff from 100ms doubling up to
/// 400ms with jitter, server rate-limit hints honoured up to 5 minutes, and only
/// idempotent calls retried after failures that may have reached the server.
///
/// # Examples
///
/// ```
/// use tfe_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .max_attempts(5)
///     .backoff(Duration::from_millis(50), Duration::from_secs(2))
///     .max_elapsed(Duration::from_secs(30));
/// assert_eq!(policy.attempts(), 5);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    max_elapsed: Duration,
    max_rate_limit_wait: Duration,
    retry_non_idempotent: bool,
    predicate: Arc<dyn RetryPredicate>,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::default().max_attempts(1)
    }

    /// Sets the maximum number of physical attempts, including the first. At least 1.
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the first backoff delay and the cap it doubles up to.
    pub fn backoff(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay.max(initial_delay);
        self
    }

    /// Enables or disables jitter (a random 50%-100% of each delay).
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bounds the total time spent on one call, including backoff sleeps.
    pub fn max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Caps how long a server `Retry-After` / `X-RateLimit-Reset` hint is honoured.
    pub fn max_rate_limit_wait(mut self, max_wait: Duration) -> Self {
        self.max_rate_limit_wait = max_wait;
        self
    }

    /// Retry non-idempotent calls after any transient failure, accepting that a
    /// request may be applied twice.
    pub fn retry_non_idempotent(mut self, retry: bool) -> Self {
        self.retry_non_idempotent = retry;
        self
    }

    /// Replaces the predicate deciding which outcomes are transient.
    pub fn predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// The configured maximum number of attempts.
    pub fn attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns the backoff before the attempt following attempt number `attempt`
    /// (1-indexed): `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let multiplier = 2u32.saturating_pow(exponent);
        let delay = self
            .initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay);

        if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(jitter_factor)
        } else {
            delay
        }
    }

    fn delay_after(&self, attempt: usize, outcome: &Outcome<'_>) -> Duration {
        if let Outcome::Status(StatusCode::TOO_MANY_REQUESTS, headers) = outcome {
            if let Some(delay) = RateLimitInfo::from_headers(headers).delay(self.max_rate_limit_wait) {
                tracing::info!(
                    rate_limit_delay_ms = delay.as_millis() as u64,
                    attempt = attempt,
                    "Rate limited - waiting before retry"
                );
                return delay;
            }
        }
        self.backoff_delay(attempt)
    }

    /// Sends `call` through `transport`, retrying transient failures.
    ///
    /// Returns the first non-retryable response, or the last response once the
    /// attempt or time budget is spent; responses are never turned into errors here.
    /// A transport error is returned as [`Error::Transport`] after a single attempt,
    /// or [`Error::RetriesExhausted`] after several. Cancellation of `ctx` during an
    /// attempt or a backoff sleep returns [`Error::Cancelled`] at once.
    pub async fn send(
        &self,
        ctx: &Context,
        transport: &dyn Transport,
        call: &Call,
    ) -> Result<RawResponse> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            tracing::debug!(
                method = %call.method,
                url = %call.url,
                attempt = attempt,
                "Executing HTTP request"
            );

            let result = ctx.run(transport.send(call)).await?;

            let outcome = match &result {
                Ok(response) => Outcome::Status(response.status, &response.headers),
                Err(error) => Outcome::Transport(error),
            };

            if !self.predicate.should_retry(&outcome, attempt) {
                return finish(result, attempt);
            }

            if !call.is_idempotent() && !self.retry_non_idempotent && !outcome.is_unprocessed() {
                tracing::warn!(
                    method = %call.method,
                    url = %call.url,
                    attempt = attempt,
                    "Not retrying non-idempotent request"
                );
                return match result {
                    Ok(response) => Ok(response),
                    Err(error) => Err(Error::AmbiguousWrite { cause: error }),
                };
            }

            if attempt >= self.max_attempts {
                tracing::warn!(attempts = attempt, "Retry attempts exhausted");
                return finish(result, attempt);
            }

            let delay = self.delay_after(attempt, &outcome);
            if started.elapsed().saturating_add(delay) > self.max_elapsed {
                tracing::warn!(
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retry window exhausted"
                );
                return finish(result, attempt);
            }

            match &result {
                Ok(response) => tracing::warn!(
                    status = response.status.as_u16(),
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient status, retrying request after delay"
                ),
                Err(error) => tracing::warn!(
                    error = %error,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed, retrying after delay"
                ),
            }

            // Release the failed attempt's body before sleeping.
            drop(result);
            ctx.sleep(delay).await?;
        }
    }
}

fn finish(
    result: std::result::Result<RawResponse, TransportError>,
    attempts: usize,
) -> Result<RawResponse> {
    match result {
        Ok(response) => Ok(response),
        Err(error) if attempts > 1 => Err(Error::RetriesExhausted {
            attempts,
            last_error: error,
        }),
        Err(error) => Err(Error::Transport(error)),
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter: true,
            max_elapsed: Duration::from_secs(60),
            max_rate_limit_wait: Duration::from_secs(300),
            retry_non_idempotent: false,
            predicate: Arc::new(RetryOnTransient),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("max_elapsed", &self.max_elapsed)
            .field("max_rate_limit_wait", &self.max_rate_limit_wait)
            .field("retry_non_idempotent", &self.retry_non_idempotent)
            .finish_non_exhaustive()
    }
}
