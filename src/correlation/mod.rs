pub mod context;
pub mod middleware;

// Public API exports
pub use context::{
    child_correlation_id, current, forwarded_headers, inject_headers, with_scope,
    CorrelationContext, RequestScope, CORRELATION_HEADER, FORWARDED_HEADERS, REQUEST_ID_HEADER,
    RESPONSE_TIME_HEADER,
};
pub use middleware::CorrelationMiddleware;
