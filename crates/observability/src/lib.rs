//! Tracing and logging setup shared by binaries and tests.

/// Subscriber configuration (filters, output format).
pub mod subscriber;

pub use subscriber::{LogFormat, ObservabilityConfig, init};
