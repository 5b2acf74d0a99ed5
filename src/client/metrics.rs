use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Call counters for the inter-service client.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    total_calls: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    breaker_rejections: AtomicU64,
    unavailable_rejections: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn record_retries(&self, count: u64) {
        self.retries.fetch_add(count, Ordering::SeqCst);
    }

    /// A call rejected by an open circuit, before any network attempt.
    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::SeqCst);
    }

    /// A call rejected because discovery found no routable instance.
    pub fn record_unavailable(&self) {
        self.unavailable_rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ClientMetricsSnapshot {
        let total = self.total_calls.load(Ordering::SeqCst);
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        ClientMetricsSnapshot {
            total_calls: total,
            succeeded,
            failed: self.failed.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
            breaker_rejections: self.breaker_rejections.load(Ordering::SeqCst),
            unavailable_rejections: self.unavailable_rejections.load(Ordering::SeqCst),
            success_rate: if total == 0 {
                1.0
            } else {
                succeeded as f64 / total as f64
            },
            average_duration_ms: if total == 0 {
                0.0
            } else {
                self.total_duration_ms.load(Ordering::SeqCst) as f64 / total as f64
            },
        }
    }

    pub fn reset(&self) {
        self.total_calls.store(0, Ordering::SeqCst);
        self.succeeded.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.retries.store(0, Ordering::SeqCst);
        self.breaker_rejections.store(0, Ordering::SeqCst);
        self.unavailable_rejections.store(0, Ordering::SeqCst);
        self.total_duration_ms.store(0, Ordering::SeqCst);
    }
}

/// Point-in-time view of the client counters.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetricsSnapshot {
    pub total_calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub breaker_rejections: u64,
    pub unavailable_rejections: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot() {
        let metrics = ClientMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.success_rate, 1.0);
        assert_eq!(snapshot.average_duration_ms, 0.0);
    }

    #[test]
    fn test_success_rate() {
        let metrics = ClientMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_success(Duration::from_millis(20));
        metrics.record_success(Duration::from_millis(30));
        metrics.record_failure(Duration::from_millis(40));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.success_rate, 0.75);
        assert_eq!(snapshot.average_duration_ms, 25.0);
    }

    #[test]
    fn test_rejections_tracked_separately() {
        let metrics = ClientMetrics::new();
        metrics.record_breaker_rejection();
        metrics.record_unavailable();
        metrics.record_retries(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.breaker_rejections, 1);
        assert_eq!(snapshot.unavailable_rejections, 1);
        assert_eq!(snapshot.retries, 2);
    }

    #[test]
    fn test_reset() {
        let metrics = ClientMetrics::new();
        metrics.record_success(Duration::from_millis(10));
        metrics.record_retries(3);
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.retries, 0);
    }
}
