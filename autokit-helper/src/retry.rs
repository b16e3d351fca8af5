//! Bounded retry and bounded wait primitives. Nothing in here knows about hardware.

use std::{fmt::Display, time::Duration};

use tokio_util::sync::CancellationToken;

/// Returned by [`with_timeout`] when the timer fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Timed out after {0:?}")]
pub struct Elapsed(pub Duration);

/// How often and how fast [`with_retry`] re-invokes a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Run `f` until it succeeds or `policy.max_attempts` invocations have failed. Sleeps
/// `policy.interval` between attempts and returns the error of the last attempt.
///
/// A policy with zero attempts still runs `f` once.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(x) => return Ok(x),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                tracing::debug!("Attempt {attempt}/{max_attempts} failed: {e}");
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

/// Race the future produced by `f` against a timer.
///
/// `f` receives a [`CancellationToken`] which is cancelled when the timer expires, so work that
/// was moved off the future (blocking threads, spawned tasks) can stop as well.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, f: F) -> Result<T, Elapsed>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let token = CancellationToken::new();
    let fut = f(token.clone());

    match tokio::time::timeout(timeout, fut).await {
        Ok(x) => Ok(x),
        Err(_) => {
            token.cancel();
            Err(Elapsed(timeout))
        }
    }
}
