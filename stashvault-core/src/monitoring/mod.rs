//! Monitoring for StashVault
//!
//! - Structured logging with tracing
//! - Audit trail of key lifecycle and rotation events
//! - Prometheus metrics

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::*;
pub use logging::*;
pub use metrics::*;
