use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff strategy selecting how the inter-attempt delay grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant delay between attempts
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay doubles (or multiplies) per attempt
    Exponential,
    /// Delay follows the Fibonacci sequence
    Fibonacci,
    /// AWS-style decorrelated jitter, bounded by 3x the previous delay
    DecorrelatedJitter,
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay between retries (milliseconds)
    pub base_delay_ms: u64,
    /// Ceiling on the computed delay (milliseconds)
    pub max_delay_ms: u64,
    /// Growth factor for the exponential strategy
    pub multiplier: f64,
    /// Whether to add random variation on top of the computed delay
    pub jitter: bool,
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2.0,
            jitter: true,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_strategy(strategy: BackoffStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    fn schedule(&self) -> DelaySchedule {
        DelaySchedule {
            strategy: self.strategy,
            base_ms: self.base_delay_ms,
            max_ms: self.max_delay_ms,
            multiplier: self.multiplier,
            jitter: self.jitter,
            last_delay_ms: 0,
            fib: vec![1, 1],
        }
    }
}

/// Delay computation state for one retry loop.
///
/// Created fresh per `retry_with_backoff` call so that concurrent loops
/// sharing one `RetryConfig` cannot interfere with each other's jitter
/// sequence or memoization.
struct DelaySchedule {
    strategy: BackoffStrategy,
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: bool,
    last_delay_ms: u64,
    fib: Vec<u64>,
}

impl DelaySchedule {
    /// Delay to sleep after the `attempt`-th failure (0-indexed).
    fn compute_delay(&mut self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_ms,
            BackoffStrategy::Linear => self.base_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => {
                (self.base_ms as f64 * self.multiplier.powi(attempt as i32)) as u64
            }
            BackoffStrategy::Fibonacci => self.base_ms.saturating_mul(self.fib(attempt)),
            BackoffStrategy::DecorrelatedJitter => {
                if attempt == 0 {
                    self.base_ms
                } else {
                    let upper = self
                        .last_delay_ms
                        .saturating_mul(3)
                        .min(self.max_ms)
                        .max(self.base_ms);
                    fastrand::u64(self.base_ms..=upper)
                }
            }
        };

        let capped = raw.min(self.max_ms);
        self.last_delay_ms = capped;

        let final_ms = if self.jitter {
            // Uniform 0-30% on top of the computed delay
            capped + fastrand::u64(0..=capped * 3 / 10)
        } else {
            capped
        };

        Duration::from_millis(final_ms)
    }

    fn fib(&mut self, n: u32) -> u64 {
        let n = n as usize;
        while self.fib.len() <= n {
            let next = self.fib[self.fib.len() - 1].saturating_add(self.fib[self.fib.len() - 2]);
            self.fib.push(next);
        }
        self.fib[n]
    }
}

/// Error types that should trigger retries
pub trait RetryableError: std::error::Error {
    /// Check if this error should trigger a retry
    fn is_retryable(&self) -> bool;
}

/// Failure modes of a retry loop.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error> {
    #[error("operation failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: E },

    /// The retry predicate declined; the original error passes through.
    #[error(transparent)]
    NotRetryable(E),

    /// The guard of a [`GuardedRetry`] is open; the operation was not called.
    #[error("retry guard is open, next probe in {}ms", wait.as_millis())]
    GuardOpen { wait: Duration },
}

impl<E: std::error::Error> RetryError<E> {
    /// Unwrap back to the underlying operation error, when one exists.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::MaxRetriesExceeded { last_error, .. } => Some(last_error),
            RetryError::NotRetryable(e) => Some(e),
            RetryError::GuardOpen { .. } => None,
        }
    }
}

/// Retry an operation, sleeping a strategy-computed delay between attempts.
///
/// Non-retryable failures propagate immediately; the delay is skipped after
/// the final attempt.
pub async fn retry_with_backoff<F, T, E>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>>,
    E: RetryableError + Send + 'static,
{
    let max_attempts = config.max_attempts.max(1);
    let mut schedule = config.schedule();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_retryable() {
                    debug!(error = %e, "error is not retryable, aborting");
                    return Err(RetryError::NotRetryable(e));
                }

                // Don't sleep after the final attempt
                if attempt < max_attempts {
                    let delay = schedule.compute_delay(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "operation failed, retrying"
                    );
                    sleep(delay).await;
                }

                last_error = Some(e);
            }
        }
    }

    Err(RetryError::MaxRetriesExceeded {
        attempts: max_attempts,
        last_error: last_error.expect("at least one attempt must have run"),
    })
}

/// Retry loop guarded by a lightweight consecutive-failure breaker.
///
/// After `guard_threshold` consecutive failed loops the guard opens for
/// `guard_cooldown` and calls fail fast without invoking the operation.
/// Once the cooldown elapses a single probe loop is admitted; a success
/// resets the failure counter.
pub struct GuardedRetry {
    config: RetryConfig,
    guard_threshold: u32,
    guard_cooldown: Duration,
    state: Mutex<GuardState>,
}

struct GuardState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl GuardedRetry {
    pub fn new(config: RetryConfig, guard_threshold: u32, guard_cooldown: Duration) -> Self {
        Self {
            config,
            guard_threshold: guard_threshold.max(1),
            guard_cooldown,
            state: Mutex::new(GuardState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    pub async fn execute<F, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: Fn() -> Pin<Box<dyn Future<Output = Result<T, E>> + Send>>,
        E: RetryableError + Send + 'static,
    {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(until) = state.open_until {
                let now = Instant::now();
                if now < until {
                    return Err(RetryError::GuardOpen { wait: until - now });
                }
                // Cooldown elapsed; admit this call as the probe
                state.open_until = None;
            }
        }

        match retry_with_backoff(&self.config, operation).await {
            Ok(value) => {
                self.state.lock().unwrap().consecutive_failures = 0;
                Ok(value)
            }
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.guard_threshold {
                    warn!(
                        failures = state.consecutive_failures,
                        cooldown_ms = self.guard_cooldown.as_millis() as u64,
                        "retry guard opening"
                    );
                    state.open_until = Some(Instant::now() + self.guard_cooldown);
                }
                Err(e)
            }
        }
    }
}
