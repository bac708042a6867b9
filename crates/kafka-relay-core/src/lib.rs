//! Kafka Relay Core Library
//!
//! This library provides the core of a transparent Kafka reverse proxy. Each
//! broker of a cluster gets a proxy-owned listener; client connections are
//! paired with a connection to the matching real broker and relayed frame by
//! frame. Responses that tell clients where brokers live (Metadata,
//! FindCoordinator, DescribeCluster) are rewritten so every follow-up
//! connection also lands on the proxy.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`broker`] - Broker endpoint registry and outbound connector
//! - [`protocol`] - Length-prefix codec, header parsing, in-flight requests
//! - [`rewrite`] - Broker address rewriting for discovery responses
//! - [`network`] - Listeners, connection pairs and their lifecycle
//! - [`metrics`] - Prometheus metrics collection
//! - [`tls`] - TLS for the client and broker legs
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kafka_relay_core::{ListenerManager, ProxyMetrics, RelayConfig, SharedRegistry};
//!
//! let config = RelayConfig::from_file("relay.yaml")?;
//! let registry = SharedRegistry::new(config.build_registry()?);
//! let manager = ListenerManager::new(&config, registry, Arc::new(ProxyMetrics::new()))?;
//! manager.run().await?;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod rewrite;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{BrokerMapping, BrokerRegistry, Endpoint, SharedRegistry};
pub use config::{
    BrokerTlsConfig, ClientCertAuthorityConfig, ClientTlsConfig, RelayConfig, RelayTuning,
};
pub use error::{ConfigError, ProxyError, Result, TlsError};
pub use metrics::ProxyMetrics;
pub use network::{CloseReason, ConnectionProxy, ListenerManager, PairState};
pub use rewrite::{RewriteOutcome, RewriteSet};
