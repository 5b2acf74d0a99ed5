use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::{BackoffStrategy, RetryConfig};
use std::time::Duration;

/// Process-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name this service announces on outbound calls (`X-Service-Name`).
    pub service_name: String,
    /// Shared secret for service token signing. Empty disables signing.
    pub auth_secret: String,
    pub auth_enabled: bool,
    pub default_timeout_ms: u64,
    pub max_redirects: usize,
    /// Base URL of the external service directory, if one is deployed.
    pub directory_url: Option<String>,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter: bool,

    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_open_timeout_ms: u64,
    pub breaker_volume_threshold: usize,
    pub breaker_error_percentage: f64,
    pub breaker_window_ms: u64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            auth_secret: std::env::var("AUTH_SECRET").unwrap_or_default(),
            auth_enabled: env_parsed("AUTH_ENABLED", true),
            default_timeout_ms: env_parsed("DEFAULT_TIMEOUT_MS", 5000),
            max_redirects: env_parsed("MAX_REDIRECTS", 5),
            directory_url: std::env::var("DIRECTORY_URL").ok().filter(|v| !v.is_empty()),

            retry_max_attempts: env_parsed("RETRY_MAX_ATTEMPTS", 3),
            retry_base_delay_ms: env_parsed("RETRY_BASE_DELAY_MS", 100),
            retry_max_delay_ms: env_parsed("RETRY_MAX_DELAY_MS", 5000),
            retry_multiplier: env_parsed("RETRY_MULTIPLIER", 2.0),
            retry_jitter: env_parsed("RETRY_JITTER", true),

            breaker_failure_threshold: env_parsed("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_success_threshold: env_parsed("BREAKER_SUCCESS_THRESHOLD", 2),
            breaker_open_timeout_ms: env_parsed("BREAKER_OPEN_TIMEOUT_MS", 30_000),
            breaker_volume_threshold: env_parsed("BREAKER_VOLUME_THRESHOLD", 10),
            breaker_error_percentage: env_parsed("BREAKER_ERROR_PERCENTAGE", 50.0),
            breaker_window_ms: env_parsed("BREAKER_WINDOW_MS", 60_000),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay_ms: self.retry_base_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            multiplier: self.retry_multiplier,
            jitter: self.retry_jitter,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            open_timeout: Duration::from_millis(self.breaker_open_timeout_ms),
            volume_threshold: self.breaker_volume_threshold,
            error_threshold_percentage: self.breaker_error_percentage,
            rolling_window: Duration::from_millis(self.breaker_window_ms),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            auth_secret: String::new(),
            auth_enabled: true,
            default_timeout_ms: 5000,
            max_redirects: 5,
            directory_url: None,
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5000,
            retry_multiplier: 2.0,
            retry_jitter: true,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_open_timeout_ms: 30_000,
            breaker_volume_threshold: 10,
            breaker_error_percentage: 50.0,
            breaker_window_ms: 60_000,
        }
    }
}
