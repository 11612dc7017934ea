// src/retry.rs

use std::fmt::Display;
use std::future::Future;
use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::models::TransferConfig;

/// Decides whether a failed attempt may be repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Bounded retry with linearly growing backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,
    /// Backoff unit; retry `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.retries(), config.backoff)
    }

    /// Wait before attempt number `attempt` (the first attempt is `0`).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// The instant a whole run has to finish by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now.checked_add(timeout).unwrap_or(now + Duration::from_secs(86_400 * 365));
        Self { at }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Why [`run_with_retry`] gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The operation failed in a way retrying cannot fix.
    Fatal(E),
    /// Every allowed attempt failed; `last` is the final error.
    Exhausted { attempts: u32, last: E },
    /// The deadline passed before or during an attempt.
    DeadlineExceeded { attempts: u32, last: Option<E> },
}

/// Runs `op` until it succeeds, fails fatally, runs out of attempts or
/// crosses `deadline`.
///
/// `op` receives the attempt number. Each attempt is bounded by the deadline
/// and a pending backoff never sleeps past it.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    deadline: Deadline,
    mut op: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;
    let mut last: Option<E> = None;
    loop {
        if attempt > 0 {
            let wake = Instant::now()
                .checked_add(policy.delay(attempt))
                .map_or(deadline.instant(), |wake| wake.min(deadline.instant()));
            tokio::time::sleep_until(wake).await;
        }
        if deadline.is_expired() {
            return Err(RetryFailure::DeadlineExceeded {
                attempts: attempt,
                last,
            });
        }

        match tokio::time::timeout_at(deadline.instant(), op(attempt)).await {
            Err(_) => {
                return Err(RetryFailure::DeadlineExceeded {
                    attempts: attempt + 1,
                    last,
                })
            }
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(RetryFailure::Fatal(e)),
            Ok(Err(e)) => {
                if attempt >= policy.max_retries {
                    return Err(RetryFailure::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                warn!(attempt = attempt + 1, error = %e, "attempt failed, retrying");
                last = Some(e);
                attempt += 1;
            }
        }
    }
}
