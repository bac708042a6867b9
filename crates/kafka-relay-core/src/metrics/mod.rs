//! Metrics collection for the Kafka relay.
//!
//! Provides Prometheus-compatible counters for connections, faults,
//! rewrites and relayed traffic. Rendering and serving them is left to the
//! binary.

pub mod prometheus;

pub use prometheus::ProxyMetrics;
