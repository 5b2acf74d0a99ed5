pub mod auth;
#[allow(clippy::module_inception)]
pub mod client;
pub mod metrics;

// Public API exports
pub use auth::{ServiceClaims, ServiceTokenSigner};
pub use client::{InterServiceClient, ServiceRequest};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
