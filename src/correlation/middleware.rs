use super::context::{
    self, CorrelationContext, RequestScope, CORRELATION_HEADER, FORWARDED_HEADERS,
};
use poem::http::{HeaderName, HeaderValue};
use poem::{Endpoint, IntoResponse, Middleware, Request, Response, Result as PoemResult};
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Middleware attaching a correlation id and a fresh request id to every
/// inbound request, exposing them through the task-local request scope, and
/// stamping them (plus the measured response time) onto the response.
pub struct CorrelationMiddleware {
    header: String,
}

impl CorrelationMiddleware {
    /// Extract the inbound correlation id from a custom header name.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for CorrelationMiddleware {
    fn default() -> Self {
        Self::new(CORRELATION_HEADER)
    }
}

impl<E: Endpoint> Middleware<E> for CorrelationMiddleware {
    type Output = CorrelationEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        CorrelationEndpoint {
            ep,
            header: self.header.clone(),
        }
    }
}

/// Endpoint wrapper that scopes the request context
pub struct CorrelationEndpoint<E> {
    ep: E,
    header: String,
}

#[poem::async_trait]
impl<E: Endpoint> Endpoint for CorrelationEndpoint<E> {
    type Output = Response;

    async fn call(&self, mut req: Request) -> PoemResult<Self::Output> {
        let correlation_id = req
            .header(&self.header)
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request_id = Uuid::new_v4().to_string();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        // Mirror the ids onto the inbound headers for handlers that read
        // them directly rather than through the scope
        if let Ok(value) = HeaderValue::from_str(&correlation_id) {
            req.headers_mut().insert("X-Correlation-Id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert("X-Request-Id", value);
        }

        let forwarded = FORWARDED_HEADERS
            .iter()
            .filter_map(|name| req.header(name).map(|v| (name.to_string(), v.to_string())))
            .collect();

        let scope = RequestScope {
            context: CorrelationContext {
                correlation_id: correlation_id.clone(),
                request_id: request_id.clone(),
            },
            forwarded,
        };

        let span = info_span!(
            "http_request",
            correlation_id = %correlation_id,
            request_id = %request_id,
            method = %method,
            path = %path,
        );

        info!(parent: &span, "request started");
        let started = Instant::now();
        let result = context::with_scope(scope, self.ep.call(req).instrument(span.clone())).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let mut resp = output.into_response();
                info!(
                    parent: &span,
                    status = resp.status().as_u16(),
                    duration_ms = elapsed_ms,
                    "request completed"
                );
                if let Ok(name) = HeaderName::from_bytes(self.header.as_bytes()) {
                    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                        resp.headers_mut().insert(name, value);
                    }
                }
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    resp.headers_mut().insert("X-Request-Id", value);
                }
                if let Ok(value) = HeaderValue::from_str(&elapsed_ms.to_string()) {
                    resp.headers_mut().insert("X-Response-Time", value);
                }
                Ok(resp)
            }
            Err(err) => {
                info!(
                    parent: &span,
                    status = err.status().as_u16(),
                    duration_ms = elapsed_ms,
                    "request failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poem::endpoint::make;
    use poem::EndpointExt;

    fn echo_correlation() -> impl Endpoint {
        make(|_req| async {
            context::current()
                .map(|c| c.correlation_id)
                .unwrap_or_else(|| "no-scope".to_string())
        })
    }

    #[tokio::test]
    async fn test_inbound_correlation_id_is_reused() {
        let ep = echo_correlation().with(CorrelationMiddleware::default());
        let req = Request::builder()
            .header("X-Correlation-Id", "corr-abc")
            .finish();

        let resp = ep.call(req).await.unwrap();
        assert_eq!(resp.headers().get("X-Correlation-Id").unwrap(), "corr-abc");

        let body = resp.into_body().into_string().await.unwrap();
        assert_eq!(body, "corr-abc");
    }

    #[tokio::test]
    async fn test_missing_correlation_id_is_generated() {
        let ep = echo_correlation().with(CorrelationMiddleware::default());
        let resp = ep.call(Request::builder().finish()).await.unwrap();

        let header = resp
            .headers()
            .get("X-Correlation-Id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(!header.is_empty());

        let body = resp.into_body().into_string().await.unwrap();
        assert_eq!(body, header);
    }

    #[tokio::test]
    async fn test_response_carries_request_id_and_timing() {
        let ep = echo_correlation().with(CorrelationMiddleware::default());
        let resp = ep.call(Request::builder().finish()).await.unwrap();

        assert!(resp.headers().contains_key("X-Request-Id"));
        let timing = resp
            .headers()
            .get("X-Response-Time")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(timing.parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn test_custom_extraction_header() {
        let ep = echo_correlation().with(CorrelationMiddleware::new("X-Trace-Id"));
        let req = Request::builder().header("X-Trace-Id", "trace-9").finish();

        let resp = ep.call(req).await.unwrap();
        assert_eq!(resp.headers().get("X-Trace-Id").unwrap(), "trace-9");
    }

    #[tokio::test]
    async fn test_identity_headers_are_captured() {
        let ep = make(|_req| async {
            let forwarded = context::forwarded_headers();
            serde_json::to_string(&forwarded).unwrap()
        })
        .with(CorrelationMiddleware::default());

        let req = Request::builder()
            .header("X-User-Id", "user-1")
            .header("X-Session-Id", "sess-2")
            .finish();
        let resp = ep.call(req).await.unwrap();
        let body = resp.into_body().into_string().await.unwrap();
        let forwarded: Vec<(String, String)> = serde_json::from_str(&body).unwrap();

        assert!(forwarded.contains(&("X-User-Id".to_string(), "user-1".to_string())));
        assert!(forwarded.contains(&("X-Session-Id".to_string(), "sess-2".to_string())));
        assert_eq!(forwarded.len(), 2);
    }
}
