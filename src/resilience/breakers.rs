use super::circuit_breaker::{
    BreakerEvent, BreakerHealth, BreakerMetrics, CircuitBreaker, CircuitBreakerConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

/// Caches one circuit breaker per dependency key so that every concurrent
/// caller of a dependency shares the same accounting.
///
/// Constructed explicitly and owned by whoever composes the call path;
/// tests create isolated registries instead of sharing process globals.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: RwLock<HashMap<String, CircuitBreakerConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            default_config,
            overrides: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Configure a per-dependency override, applied when its breaker is
    /// first created.
    pub fn set_config(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.write().unwrap().insert(name.into(), config);
    }

    /// Get the breaker for a dependency, creating it lazily.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().unwrap().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().unwrap();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .read()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            debug!(breaker = name, "creating circuit breaker");
            Arc::new(CircuitBreaker::with_events(name, config, self.events.clone()))
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().get(name).map(Arc::clone)
    }

    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap().values().map(Arc::clone).collect()
    }

    pub fn health(&self) -> HashMap<String, BreakerHealth> {
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.health()))
            .collect()
    }

    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        self.all().into_iter().map(|b| b.metrics()).collect()
    }

    /// Events from every breaker created by this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }

    /// Drop every cached breaker.
    pub fn clear(&self) {
        self.breakers.write().unwrap().clear();
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{BreakerEventKind, CircuitState};
    use std::time::Duration;

    #[test]
    fn test_same_key_shares_one_breaker() {
        let registry = BreakerRegistry::default();
        let a = registry.breaker("svc-1");
        let b = registry.breaker("svc-1");
        assert!(Arc::ptr_eq(&a, &b));

        a.record_failure(Duration::from_millis(1));
        assert_eq!(b.metrics().failure_count, 1);
    }

    #[test]
    fn test_distinct_keys_get_distinct_breakers() {
        let registry = BreakerRegistry::default();
        let a = registry.breaker("svc-1");
        let b = registry.breaker("svc-2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_override_applied_on_creation() {
        let registry = BreakerRegistry::default();
        registry.set_config(
            "fragile",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );

        let breaker = registry.breaker("fragile");
        breaker.record_failure(Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_all() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        registry.breaker("a").record_failure(Duration::from_millis(1));
        registry.breaker("b").record_failure(Duration::from_millis(1));
        assert_eq!(registry.breaker("a").state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(registry.breaker("a").state(), CircuitState::Closed);
        assert_eq!(registry.breaker("b").state(), CircuitState::Closed);
    }

    #[test]
    fn test_clear_drops_breakers() {
        let registry = BreakerRegistry::default();
        registry.breaker("a");
        assert!(registry.get("a").is_some());
        registry.clear();
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_shared_event_channel() {
        let registry = BreakerRegistry::default();
        let mut rx = registry.subscribe();

        registry.breaker("a").record_success(Duration::from_millis(1));
        registry.breaker("b").record_failure(Duration::from_millis(1));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(first.kind, BreakerEventKind::Success);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.name, "b");
        assert_eq!(second.kind, BreakerEventKind::Failure);
    }
}
