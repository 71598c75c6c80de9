//! Cancellable exponential backoff for a single fallible operation.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// Configuration for [`backoff`].
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub scalar: f64,
}

impl BackoffConfig {
    pub const DEFAULT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3);
    pub const DEFAULT_SCALAR: f64 = 2.0;

    /// Delay to wait after the failed attempt number `attempt` (zero-based):
    /// `min(min_delay * scalar^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.scalar.powi(attempt.min(i32::MAX as u32) as i32);
        let nanos = self.min_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            attempts: BackoffConfig::DEFAULT_ATTEMPTS,
            min_delay: BackoffConfig::DEFAULT_MIN_DELAY,
            max_delay: BackoffConfig::DEFAULT_MAX_DELAY,
            scalar: BackoffConfig::DEFAULT_SCALAR,
        }
    }
}

/// Outcome of a [`backoff`] that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError<E> {
    /// The token was cancelled before the operation succeeded.
    #[error("backoff cancelled")]
    Cancelled,
    /// All attempts failed. Holds the error of the last attempt.
    #[error("all attempts failed")]
    Failed(#[source] E),
}

/// A cancellation signal that can be waited on. Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    /// Cancel the token, waking up all waiters. Idempotent.
    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.inner;
        *cancelled.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep for `timeout` unless cancelled earlier. Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = cancelled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*guard {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }
}

/// Call `operation` until it succeeds, up to `config.attempts` times, sleeping with exponential
/// backoff between attempts.
///
/// Cancelling `token` abandons the pending retry and no further attempts are made; the result is
/// then [`BackoffError::Cancelled`], distinct from the operation's own failure.
pub fn backoff<T, E>(
    config: &BackoffConfig,
    token: &CancellationToken,
    mut operation: impl FnMut() -> Result<T, E>,
) -> Result<T, BackoffError<E>> {
    let attempts = config.attempts.max(1);
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(BackoffError::Cancelled);
        }
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= attempts => return Err(BackoffError::Failed(err)),
            Err(_) => {
                let delay = config.delay(attempt);
                log::debug!(target: "flagsync", attempt, delay_ms = delay.as_millis() as u64; "attempt failed, backing off");
                if token.wait_timeout(delay) {
                    return Err(BackoffError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}
