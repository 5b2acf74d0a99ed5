use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Dependency considered down, calls rejected immediately
    Open,
    /// Probing whether the dependency recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state before opening
    pub failure_threshold: u32,
    /// Consecutive successes in half-open state before closing
    pub success_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe
    pub open_timeout: Duration,
    /// Minimum rolling-window size before the error-rate condition applies
    pub volume_threshold: usize,
    /// Error percentage in the rolling window that trips the circuit
    pub error_threshold_percentage: f64,
    /// Age limit for rolling-window outcomes
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            volume_threshold: 10,
            error_threshold_percentage: 50.0,
            rolling_window: Duration::from_secs(60),
        }
    }
}

/// Event emitted on breaker activity, tagged with the dependency name.
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub name: String,
    pub kind: BreakerEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEventKind {
    Success,
    Failure,
    StateChange {
        from: CircuitState,
        to: CircuitState,
    },
    Reset,
}

/// Error surface of a breaker-guarded call.
#[derive(Error, Debug)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit breaker '{name}' is open, retry in {wait_secs}s")]
    Open { name: String, wait_secs: u64 },

    #[error(transparent)]
    Inner(E),
}

/// One recorded call outcome inside the rolling window.
#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
    duration_ms: u64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<DateTime<Utc>>,
    next_attempt_at: Option<Instant>,
    window: VecDeque<Outcome>,
}

/// Circuit breaker guarding calls to one dependency.
///
/// All counter and window updates are serialized behind a single lock, so
/// one instance can be shared by every concurrent caller of the dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self::with_events(name, config, events)
    }

    /// Create a breaker that publishes onto a shared event channel.
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<BreakerEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                next_attempt_at: None,
                window: VecDeque::new(),
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Run `op` if the current state permits.
    ///
    /// An expired open circuit transitions to half-open and admits the call;
    /// an unexpired one rejects it without invoking `op`.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(wait_secs) = self.try_acquire() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
                wait_secs,
            });
        }

        let started = Instant::now();
        match op().await {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.record_failure(started.elapsed());
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Like [`execute`](Self::execute), but an open circuit yields
    /// `fallback()` instead of an error. Inner failures still propagate.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.execute(op).await {
            Err(BreakerError::Open { name, wait_secs }) => {
                debug!(breaker = %name, wait_secs, "circuit open, serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    fn try_acquire(&self) -> Result<(), u64> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_attempt_at {
                    Some(at) if now < at => Err((at - now).as_secs_f64().ceil() as u64),
                    _ => {
                        self.transition(&mut inner, CircuitState::HalfOpen);
                        inner.success_count = 0;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record a successful call with its observed duration.
    pub fn record_success(&self, duration: Duration) {
        self.record(true, duration);
    }

    /// Record a failed call with its observed duration.
    pub fn record_failure(&self, duration: Duration) {
        self.record(false, duration);
    }

    fn record(&self, success: bool, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        Self::prune(&mut inner, now, self.config.rolling_window);
        inner.window.push_back(Outcome {
            at: now,
            success,
            duration_ms: duration.as_millis() as u64,
        });

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.failure_count = 0;
                } else {
                    inner.failure_count += 1;
                    inner.last_failure = Some(Utc::now());

                    let requests = inner.window.len();
                    let errors = inner.window.iter().filter(|o| !o.success).count();
                    let error_pct = errors as f64 * 100.0 / requests as f64;

                    if inner.failure_count >= self.config.failure_threshold
                        || (requests >= self.config.volume_threshold
                            && error_pct >= self.config.error_threshold_percentage)
                    {
                        warn!(
                            breaker = %self.name,
                            failures = inner.failure_count,
                            error_pct,
                            "failure threshold reached, opening circuit"
                        );
                        self.trip(&mut inner, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        debug!(breaker = %self.name, "dependency recovered, closing circuit");
                        self.transition(&mut inner, CircuitState::Closed);
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.next_attempt_at = None;
                    }
                } else {
                    // A single half-open failure restarts the cooldown
                    inner.last_failure = Some(Utc::now());
                    warn!(breaker = %self.name, "probe failed, reopening circuit");
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::Open => {
                if !success {
                    inner.last_failure = Some(Utc::now());
                }
            }
        }

        let kind = if success {
            BreakerEventKind::Success
        } else {
            BreakerEventKind::Failure
        };
        let _ = self.events.send(BreakerEvent {
            name: self.name.clone(),
            kind,
        });
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        self.transition(inner, CircuitState::Open);
        inner.next_attempt_at = Some(now + self.config.open_timeout);
        inner.success_count = 0;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state != to {
            let from = inner.state;
            inner.state = to;
            debug!(breaker = %self.name, %from, %to, "circuit state change");
            let _ = self.events.send(BreakerEvent {
                name: self.name.clone(),
                kind: BreakerEventKind::StateChange { from, to },
            });
        }
    }

    fn prune(inner: &mut BreakerInner, now: Instant, window: Duration) {
        while let Some(front) = inner.window.front() {
            if now.duration_since(front.at) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Force the circuit open, rejecting calls until the cooldown elapses.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        self.trip(&mut inner, now);
    }

    /// Force the circuit closed without clearing the rolling window.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_attempt_at = None;
    }

    /// Return to the initial closed state, dropping all accounting.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.next_attempt_at = None;
        inner.window.clear();
        let _ = self.events.send(BreakerEvent {
            name: self.name.clone(),
            kind: BreakerEventKind::Reset,
        });
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.inner.lock().unwrap();
        Self::prune(&mut inner, Instant::now(), self.config.rolling_window);
        let requests = inner.window.len();
        let errors = inner.window.iter().filter(|o| !o.success).count();
        let error_percentage = if requests == 0 {
            0.0
        } else {
            errors as f64 * 100.0 / requests as f64
        };
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            window_requests: requests,
            window_errors: errors,
            error_percentage,
            last_failure: inner.last_failure,
        }
    }

    /// Latency percentiles over the rolling window.
    pub fn statistics(&self) -> BreakerStatistics {
        let mut inner = self.inner.lock().unwrap();
        Self::prune(&mut inner, Instant::now(), self.config.rolling_window);
        let mut durations: Vec<u64> = inner.window.iter().map(|o| o.duration_ms).collect();
        durations.sort_unstable();

        let percentile = |p: f64| -> u64 {
            if durations.is_empty() {
                return 0;
            }
            let rank = (p / 100.0 * durations.len() as f64).ceil() as usize;
            durations[rank.clamp(1, durations.len()) - 1]
        };

        let mean_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        BreakerStatistics {
            sample_count: durations.len(),
            mean_ms,
            p95_ms: percentile(95.0),
            p99_ms: percentile(99.0),
        }
    }

    /// Human-readable health summary, including the remaining wait while open.
    pub fn health(&self) -> BreakerHealth {
        let metrics = self.metrics();
        let remaining_wait_secs = {
            let inner = self.inner.lock().unwrap();
            match (inner.state, inner.next_attempt_at) {
                (CircuitState::Open, Some(at)) => {
                    let now = Instant::now();
                    Some(if now < at {
                        (at - now).as_secs_f64().ceil() as u64
                    } else {
                        0
                    })
                }
                _ => None,
            }
        };
        let summary = match remaining_wait_secs {
            Some(wait) => format!(
                "circuit '{}' is open, next probe in {}s",
                self.name, wait
            ),
            None => format!(
                "circuit '{}' is {} ({:.1}% errors over {} calls)",
                self.name, metrics.state, metrics.error_percentage, metrics.window_requests
            ),
        };
        BreakerHealth {
            name: self.name.clone(),
            state: metrics.state,
            healthy: metrics.state == CircuitState::Closed,
            error_percentage: metrics.error_percentage,
            remaining_wait_secs,
            summary,
        }
    }
}

/// Counter snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub window_requests: usize,
    pub window_errors: usize,
    pub error_percentage: f64,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Latency distribution over the rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatistics {
    pub sample_count: usize,
    pub mean_ms: f64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: CircuitState,
    pub healthy: bool,
    pub error_percentage: f64,
    pub remaining_wait_secs: Option<u64>,
    pub summary: String,
}
