use super::auth::ServiceTokenSigner;
use super::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::config::Config;
use crate::correlation;
use crate::error::ServiceCallError;
use crate::registry::ServiceRegistry;
use crate::resilience::breakers::BreakerRegistry;
use crate::resilience::circuit_breaker::{BreakerError, BreakerEvent, BreakerHealth};
use crate::resilience::retry::{retry_with_backoff, RetryConfig, RetryError};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

type AttemptFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, ServiceCallError>> + Send>>;

/// One logical call from this service to another.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service: String,
    pub method: Method,
    pub path: String,
    pub headers: Option<HeaderMap>,
    pub params: Option<Vec<(String, String)>>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl ServiceRequest {
    pub fn new(service: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method,
            path: path.into(),
            headers: None,
            params: None,
            body: None,
            timeout: None,
            correlation_id: None,
        }
    }
}

/// Client for calls between services, composing discovery, circuit
/// breaking, retries, authentication and correlation propagation.
pub struct InterServiceClient {
    registry: Arc<ServiceRegistry>,
    breakers: BreakerRegistry,
    signer: ServiceTokenSigner,
    metrics: ClientMetrics,
    http: reqwest::Client,
    service_name: String,
    default_timeout: Duration,
    retry_config: RetryConfig,
}

impl InterServiceClient {
    pub fn new(config: &Config, registry: Arc<ServiceRegistry>) -> Result<Self, ServiceCallError> {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Accept", HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.default_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()?;

        Ok(Self {
            registry,
            breakers: BreakerRegistry::new(config.breaker_config()),
            signer: ServiceTokenSigner::new(&config.auth_secret, config.auth_enabled),
            metrics: ClientMetrics::new(),
            http,
            service_name: config.service_name.clone(),
            default_timeout: config.default_timeout(),
            retry_config: config.retry_config(),
        })
    }

    /// Execute one logical call: resolve an instance, gate on its breaker,
    /// retry transient failures, and classify the response.
    pub async fn request(&self, request: ServiceRequest) -> Result<Value, ServiceCallError> {
        // Discovery failure is final: nothing to retry against
        let instance = match self.registry.healthy_instance(&request.service) {
            Some(instance) => instance,
            None => {
                self.metrics.record_unavailable();
                warn!(service = %request.service, "no routable instance, rejecting call");
                return Err(ServiceCallError::ServiceUnavailable {
                    service: request.service,
                });
            }
        };

        // One breaker per resolved instance, shared across concurrent callers
        let breaker = self.breakers.breaker(&instance.id);

        let url = format!("{}{}", instance.base_url(), request.path);
        let headers = self.build_headers(&request)?;
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let attempts = Arc::new(AtomicU32::new(0));

        let op = {
            let http = self.http.clone();
            let service = request.service.clone();
            let method = request.method.clone();
            let url = url.clone();
            let headers = headers.clone();
            let params = request.params.clone();
            let body = request.body.clone();
            let attempts = Arc::clone(&attempts);
            move || -> AttemptFuture {
                let http = http.clone();
                let service = service.clone();
                let method = method.clone();
                let url = url.clone();
                let headers = headers.clone();
                let params = params.clone();
                let body = body.clone();
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    send_once(http, service, method, url, headers, params, body, timeout).await
                })
            }
        };

        let started = Instant::now();
        let result = breaker
            .execute(|| retry_with_backoff(&self.retry_config, op))
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .record_retries(attempts.load(Ordering::SeqCst).saturating_sub(1) as u64);

        match result {
            Ok(value) => {
                self.metrics.record_success(started.elapsed());
                info!(
                    service = %request.service,
                    method = %request.method,
                    path = %request.path,
                    duration_ms,
                    "service call succeeded"
                );
                Ok(value)
            }
            Err(BreakerError::Open { name, wait_secs }) => {
                self.metrics.record_breaker_rejection();
                warn!(
                    service = %request.service,
                    instance = %name,
                    wait_secs,
                    "circuit open, call rejected without network attempt"
                );
                Err(ServiceCallError::CircuitOpen {
                    dependency: name,
                    wait_secs,
                })
            }
            Err(BreakerError::Inner(retry_err)) => {
                let mapped = match retry_err {
                    RetryError::MaxRetriesExceeded {
                        attempts,
                        last_error,
                    } => ServiceCallError::MaxRetriesExceeded {
                        attempts,
                        source: Box::new(last_error),
                    },
                    RetryError::NotRetryable(e) => e,
                    RetryError::GuardOpen { wait } => ServiceCallError::CircuitOpen {
                        dependency: instance.id.clone(),
                        wait_secs: wait.as_secs(),
                    },
                };
                self.metrics.record_failure(started.elapsed());
                warn!(
                    service = %request.service,
                    method = %request.method,
                    path = %request.path,
                    duration_ms,
                    error = %mapped,
                    "service call failed"
                );
                Err(mapped)
            }
        }
    }

    pub async fn get(&self, service: &str, path: &str) -> Result<Value, ServiceCallError> {
        self.request(ServiceRequest::new(service, Method::GET, path))
            .await
    }

    pub async fn post(
        &self,
        service: &str,
        path: &str,
        body: Value,
    ) -> Result<Value, ServiceCallError> {
        let mut request = ServiceRequest::new(service, Method::POST, path);
        request.body = Some(body);
        self.request(request).await
    }

    pub async fn put(
        &self,
        service: &str,
        path: &str,
        body: Value,
    ) -> Result<Value, ServiceCallError> {
        let mut request = ServiceRequest::new(service, Method::PUT, path);
        request.body = Some(body);
        self.request(request).await
    }

    pub async fn delete(&self, service: &str, path: &str) -> Result<Value, ServiceCallError> {
        self.request(ServiceRequest::new(service, Method::DELETE, path))
            .await
    }

    /// Breaker health per dependency this client has talked to.
    pub fn health_check(&self) -> HashMap<String, BreakerHealth> {
        self.breakers.health()
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscribe_breaker_events(&self) -> broadcast::Receiver<BreakerEvent> {
        self.breakers.subscribe()
    }

    /// Drop cached tokens and all per-dependency breakers.
    pub fn shutdown(&self) {
        debug!("shutting down inter-service client");
        self.signer.clear();
        self.breakers.clear();
    }

    fn build_headers(&self, request: &ServiceRequest) -> Result<HeaderMap, ServiceCallError> {
        let mut headers = HeaderMap::new();
        headers.insert("X-Service-Name", HeaderValue::from_str(&self.service_name)?);

        // Explicit id wins, then the ambient one, else start a new chain
        let correlation_id = request
            .correlation_id
            .clone()
            .or_else(|| correlation::current().map(|c| c.correlation_id))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        headers.insert("X-Correlation-Id", HeaderValue::from_str(&correlation_id)?);
        headers.insert(
            "X-Request-Id",
            HeaderValue::from_str(&Uuid::new_v4().to_string())?,
        );
        headers.insert("X-Timestamp", HeaderValue::from_str(&Utc::now().to_rfc3339())?);

        if let Some(token) = self.signer.token(&self.service_name)? {
            headers.insert("X-Service-Token", HeaderValue::from_str(&token)?);
        }

        // Forward the caller's identity headers when inside a request scope
        for (name, value) in correlation::forwarded_headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }

        // Caller-supplied headers override everything above
        if let Some(extra) = &request.headers {
            for (name, value) in extra.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }

        Ok(headers)
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_once(
    http: reqwest::Client,
    service: String,
    method: Method,
    url: String,
    headers: HeaderMap,
    params: Option<Vec<(String, String)>>,
    body: Option<Value>,
    timeout: Duration,
) -> Result<Value, ServiceCallError> {
    let mut builder = http.request(method, &url).headers(headers).timeout(timeout);
    if let Some(params) = &params {
        builder = builder.query(params);
    }
    if let Some(body) = &body {
        builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(ServiceCallError::from_status(&service, status.as_u16(), &text));
    }

    if text.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
