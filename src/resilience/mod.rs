pub mod breakers;
pub mod circuit_breaker;
pub mod retry;

// Public API exports
pub use breakers::BreakerRegistry;
pub use circuit_breaker::*;
pub use retry::*;
