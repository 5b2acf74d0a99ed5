use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "X-Correlation-Id";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const RESPONSE_TIME_HEADER: &str = "X-Response-Time";
/// Identity headers copied from the inbound request onto outbound calls.
pub const FORWARDED_HEADERS: [&str; 3] = ["X-User-Id", "X-User-Roles", "X-Session-Id"];

/// Ids identifying one logical operation across service hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    /// Stable across the whole call chain
    pub correlation_id: String,
    /// Fresh per inbound request
    pub request_id: String,
}

impl CorrelationContext {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Everything the middleware captures for one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub context: CorrelationContext,
    /// Inbound identity headers carried along for forwarding
    pub forwarded: Vec<(String, String)>,
}

impl RequestScope {
    pub fn new(context: CorrelationContext) -> Self {
        Self {
            context,
            forwarded: Vec::new(),
        }
    }
}

tokio::task_local! {
    static SCOPE: RequestScope;
}

/// Run `fut` with an ambient request scope. Each in-flight request gets its
/// own scope; nothing is shared across tasks.
pub async fn with_scope<F: Future>(scope: RequestScope, fut: F) -> F::Output {
    SCOPE.scope(scope, fut).await
}

/// The ambient correlation context, when called inside a scope.
pub fn current() -> Option<CorrelationContext> {
    SCOPE.try_with(|s| s.context.clone()).ok()
}

/// Identity headers captured on the inbound request, if any.
pub fn forwarded_headers() -> Vec<(String, String)> {
    SCOPE.try_with(|s| s.forwarded.clone()).unwrap_or_default()
}

/// Derive a hierarchical child id (`parent.suffix`) for fan-out
/// sub-operations that should stay traceable to their parent.
pub fn child_correlation_id(parent: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}.{}", parent, &suffix[..8])
}

/// Copy the ambient correlation id and forwarded identity headers into an
/// outbound header map. No-op when called outside a request scope.
pub fn inject_headers(headers: &mut HeaderMap) {
    if let Some(ctx) = current() {
        if let Ok(value) = HeaderValue::from_str(&ctx.correlation_id) {
            headers.insert(HeaderName::from_static("x-correlation-id"), value);
        }
    }
    for (name, value) in forwarded_headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_ambient_context_outside_scope() {
        assert!(current().is_none());
        assert!(forwarded_headers().is_empty());
    }

    #[tokio::test]
    async fn test_scope_provides_context() {
        let scope = RequestScope::new(CorrelationContext::new("corr-1"));
        let seen = with_scope(scope, async {
            current().map(|c| c.correlation_id)
        })
        .await;
        assert_eq!(seen.as_deref(), Some("corr-1"));
        // Scope is gone once the future completes
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_isolated_per_task() {
        let task_a = tokio::spawn(with_scope(
            RequestScope::new(CorrelationContext::new("a")),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                current().unwrap().correlation_id
            },
        ));
        let task_b = tokio::spawn(with_scope(
            RequestScope::new(CorrelationContext::new("b")),
            async { current().unwrap().correlation_id },
        ));

        assert_eq!(task_a.await.unwrap(), "a");
        assert_eq!(task_b.await.unwrap(), "b");
    }

    #[test]
    fn test_child_correlation_id_format() {
        let child = child_correlation_id("parent-id");
        let (prefix, suffix) = child.rsplit_once('.').unwrap();
        assert_eq!(prefix, "parent-id");
        assert_eq!(suffix.len(), 8);

        // Nesting keeps the full ancestry
        let grandchild = child_correlation_id(&child);
        assert!(grandchild.starts_with(&child));
    }

    #[tokio::test]
    async fn test_inject_headers_copies_ambient_ids() {
        let mut scope = RequestScope::new(CorrelationContext::new("corr-42"));
        scope
            .forwarded
            .push(("X-User-Id".to_string(), "user-7".to_string()));

        with_scope(scope, async {
            let mut headers = HeaderMap::new();
            inject_headers(&mut headers);
            assert_eq!(headers.get("X-Correlation-Id").unwrap(), "corr-42");
            assert_eq!(headers.get("X-User-Id").unwrap(), "user-7");
        })
        .await;
    }

    #[test]
    fn test_inject_headers_is_noop_outside_scope() {
        let mut headers = HeaderMap::new();
        inject_headers(&mut headers);
        assert!(headers.is_empty());
    }
}
