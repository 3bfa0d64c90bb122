//! Metrics collection for the tenant gateway.
//!
//! Provides Prometheus-compatible counters for connections, decoding, CONNECT
//! outcomes, relay and shutdowns.

pub mod prometheus;

pub use prometheus::GatewayMetrics;
