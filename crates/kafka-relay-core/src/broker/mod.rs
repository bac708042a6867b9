//! Broker-side view of the relay.
//!
//! - `registry`: which brokers exist, where they really live and what
//!   address clients are told to use.
//! - `connector`: dials a broker's real endpoint for a new pair.

pub mod connector;
pub mod registry;

pub use connector::BrokerConnector;
pub use registry::{BrokerMapping, BrokerRegistry, Endpoint, SharedRegistry};
