use crate::resilience::retry::RetryableError;
use thiserror::Error;

/// Failure surface of one inter-service call.
///
/// Host services usually map these onto their own response codes:
/// `ServiceUnavailable` and `CircuitOpen` to 503, `Remote` and
/// `MaxRetriesExceeded` to 502/504.
#[derive(Error, Debug)]
pub enum ServiceCallError {
    #[error("no healthy instance available for service '{service}'")]
    ServiceUnavailable { service: String },

    #[error("circuit breaker '{dependency}' is open, retry in {wait_secs}s")]
    CircuitOpen { dependency: String, wait_secs: u64 },

    #[error("service '{service}' returned HTTP {status} ({code}): {message}")]
    Remote {
        service: String,
        status: u16,
        code: String,
        message: String,
    },

    #[error("call failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<ServiceCallError>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("service token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

impl ServiceCallError {
    /// Classify a remote error status, pulling a machine-readable code out of
    /// the response body when the remote included one.
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let code = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("code")
                    .or_else(|| v.get("error"))
                    .and_then(|c| c.as_str().map(|s| s.to_string()))
            })
            .unwrap_or_else(|| format!("HTTP_{}", status));

        ServiceCallError::Remote {
            service: service.to_string(),
            status,
            code,
            message: body.chars().take(512).collect(),
        }
    }

    /// The remote HTTP status, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceCallError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl RetryableError for ServiceCallError {
    fn is_retryable(&self) -> bool {
        match self {
            // Connection refused/reset, timeouts and broken transports
            ServiceCallError::Network(_) => true,
            // Server-side errors plus throttling and request timeout
            ServiceCallError::Remote { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            // Nothing to retry against
            ServiceCallError::ServiceUnavailable { .. } => false,
            // The breaker already decided the dependency is down
            ServiceCallError::CircuitOpen { .. } => false,
            ServiceCallError::MaxRetriesExceeded { .. } => false,
            ServiceCallError::Token(_) => false,
            ServiceCallError::Header(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_extracts_code_from_body() {
        let err = ServiceCallError::from_status("billing", 502, r#"{"code":"UPSTREAM_DOWN"}"#);
        match err {
            ServiceCallError::Remote { status, code, .. } => {
                assert_eq!(status, 502);
                assert_eq!(code, "UPSTREAM_DOWN");
            }
            _ => panic!("Expected Remote error"),
        }
    }

    #[test]
    fn test_from_status_falls_back_to_http_code() {
        let err = ServiceCallError::from_status("billing", 404, "not json");
        match err {
            ServiceCallError::Remote { code, .. } => assert_eq!(code, "HTTP_404"),
            _ => panic!("Expected Remote error"),
        }
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [500, 502, 503, 504, 429, 408] {
            let err = ServiceCallError::from_status("svc", status, "");
            assert!(err.is_retryable(), "status {} should be retryable", status);
        }
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [400, 401, 403, 404, 422] {
            let err = ServiceCallError::from_status("svc", status, "");
            assert!(!err.is_retryable(), "status {} should not be retryable", status);
        }
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let err = ServiceCallError::CircuitOpen {
            dependency: "svc-1".to_string(),
            wait_secs: 10,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unavailable_is_not_retryable() {
        let err = ServiceCallError::ServiceUnavailable {
            service: "svc".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
