//! Test utilities for the relay.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBroker`] - A lightweight mock Kafka broker
//! - [`RelayTestHarness`] - Mock brokers behind a running relay
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_relay_core::testing::{api_keys, responses, RelayTestHarness};
//!
//! #[tokio::test]
//! async fn test_metadata_is_rewritten() {
//!     let harness = RelayTestHarness::new().await;
//!     harness
//!         .register_handler(1, api_keys::METADATA, responses::metadata(harness.broker_addresses()))
//!         .await;
//!
//!     let mut client = harness.connect(1).await;
//!     // send a Metadata request, read the response, check advertised hosts
//! }
//! ```

pub mod harness;
pub mod mock_broker;

pub use harness::{advertised_for, wait_for, RelayTestHarness, TestClient, TestHarnessBuilder};
pub use mock_broker::{api_keys, responses, BrokerCall, MockBroker, Reply, ResponseGenerator};
