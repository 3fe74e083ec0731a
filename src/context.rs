//! Cancellable, deadline-bearing contexts.
//!
//! Every call carries a [`Context`]. Each suspension point of a call (waiting for a
//! rate-limit token, sleeping between retries, network I/O) races against
//! [`Context::done`] and unwinds as soon as the context is cancelled or its deadline
//! passes.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The reason a context is done.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("context canceled")]
    Cancelled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellation scope with an optional deadline.
///
/// Contexts are cheap to clone; clones share the same cancellation state. Derived
/// contexts ([`Context::child`], [`Context::with_timeout`]) are cancelled when their
/// parent is, but cancelling a child leaves the parent untouched.
///
/// # Examples
///
/// ```
/// use tfe_core::Context;
/// use std::time::Duration;
///
/// let root = Context::background();
/// let ctx = root.with_timeout(Duration::from_secs(5));
/// assert!(ctx.err().is_none());
///
/// ctx.cancel();
/// assert!(ctx.err().is_some());
/// assert!(root.err().is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Returns a context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that can be cancelled independently of `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context whose deadline is `timeout` from now, or the parent's
    /// deadline if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context with the given deadline, or the parent's deadline if
    /// that is earlier.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason the context is done, or `None` if it is still live.
    ///
    /// Explicit cancellation is reported in preference to an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Completes when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drives `future` to completion unless the context finishes first.
    ///
    /// When the context wins, `future` is dropped without being polled again, which
    /// abandons whatever it was doing.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = future => Ok(output),
        }
    }

    /// Sleeps for `duration`, waking early with an error if the context finishes.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_sleep() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let start = std::time::Instant::now();
        let result = ctx.sleep(Duration::from_secs(5)).await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));

        let waiter = tokio::spawn({
            let child = child.clone();
            async move { child.sleep(Duration::from_secs(60)).await }
        });
        parent.cancel();

        assert_eq!(waiter.await.unwrap(), Err(ContextError::Cancelled));
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_deadline_never_extends_parent() {
        let parent = Context::background().with_deadline(Instant::now() + Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_deadline() {
        let ctx = Context::background().with_deadline(Instant::now());
        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::Cancelled));
    }
}
