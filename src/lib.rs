pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod logging;
pub mod registry;
pub mod resilience;
