//! Broker endpoint registry.
//!
//! Maps each broker id to the endpoint the broker really listens on and to
//! the endpoint the relay advertises for it. The registry is built once from
//! validated configuration and never mutated; a reload builds a new registry
//! and swaps it in through [`SharedRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::{ConfigError, ConfigResult};

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`. IPv6 literals must be bracketed (`[::1]:9092`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] for a missing port, an empty
    /// host, or a port that is not in `1..=65535`.
    pub fn parse(s: &str) -> ConfigResult<Self> {
        let invalid = || ConfigError::InvalidAddress(s.to_string());

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = match host.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        let port: u16 = port.parse().map_err(|_| invalid())?;

        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One broker as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMapping {
    /// Kafka node id; the join key for rewriting.
    pub broker_id: i32,
    /// Where the broker really listens.
    pub real: Endpoint,
    /// What clients are told to connect to.
    pub advertised: Endpoint,
}

impl BrokerMapping {
    #[must_use]
    pub fn new(broker_id: i32, real: Endpoint, advertised: Endpoint) -> Self {
        Self {
            broker_id,
            real,
            advertised,
        }
    }
}

/// Immutable broker id to endpoint lookup.
#[derive(Debug, Clone, Default)]
pub struct BrokerRegistry {
    mappings: Vec<BrokerMapping>,
    by_id: HashMap<i32, usize>,
    by_real: HashMap<(String, u16), usize>,
}

impl BrokerRegistry {
    /// Build a registry, rejecting duplicate ids and duplicate advertised
    /// endpoints.
    ///
    /// # Errors
    ///
    /// Returns the first conflict found. Configuration validation reports
    /// all of them at once before this is reached.
    pub fn new(mappings: Vec<BrokerMapping>) -> ConfigResult<Self> {
        let mut by_id = HashMap::with_capacity(mappings.len());
        let mut by_real = HashMap::with_capacity(mappings.len());
        let mut by_advertised: HashMap<Endpoint, i32> = HashMap::with_capacity(mappings.len());

        for (idx, mapping) in mappings.iter().enumerate() {
            for endpoint in [&mapping.real, &mapping.advertised] {
                if endpoint.host.is_empty() || endpoint.port == 0 {
                    return Err(ConfigError::InvalidAddress(endpoint.to_string()));
                }
            }
            if by_id.insert(mapping.broker_id, idx).is_some() {
                return Err(ConfigError::DuplicateBrokerId(mapping.broker_id));
            }
            if let Some(first) = by_advertised.insert(mapping.advertised.clone(), mapping.broker_id) {
                return Err(ConfigError::DuplicateAdvertisedEndpoint {
                    endpoint: mapping.advertised.to_string(),
                    first,
                    second: mapping.broker_id,
                });
            }
            by_real
                .entry((mapping.real.host.to_ascii_lowercase(), mapping.real.port))
                .or_insert(idx);
        }

        Ok(Self {
            mappings,
            by_id,
            by_real,
        })
    }

    /// Real endpoint of a broker.
    #[must_use]
    pub fn resolve(&self, broker_id: i32) -> Option<&Endpoint> {
        self.get(broker_id).map(|m| &m.real)
    }

    /// Advertised endpoint of a broker.
    #[must_use]
    pub fn advertised_of(&self, broker_id: i32) -> Option<&Endpoint> {
        self.get(broker_id).map(|m| &m.advertised)
    }

    #[must_use]
    pub fn get(&self, broker_id: i32) -> Option<&BrokerMapping> {
        self.by_id.get(&broker_id).map(|&idx| &self.mappings[idx])
    }

    /// Find a mapping by the broker's real address.
    ///
    /// Used when a response names a node id the registry does not know but
    /// whose address it does.
    #[must_use]
    pub fn by_real_endpoint(&self, host: &str, port: i32) -> Option<&BrokerMapping> {
        let port = u16::try_from(port).ok()?;
        self.by_real
            .get(&(host.to_ascii_lowercase(), port))
            .map(|&idx| &self.mappings[idx])
    }

    #[must_use]
    pub fn mappings(&self) -> &[BrokerMapping] {
        &self.mappings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Registry handle shared by every listener and connection pair.
///
/// Readers take a snapshot and keep using it for the duration of one
/// operation, so a concurrent reload is never observed half-applied.
#[derive(Debug, Clone)]
pub struct SharedRegistry {
    inner: Arc<ArcSwap<BrokerRegistry>>,
}

impl SharedRegistry {
    #[must_use]
    pub fn new(registry: BrokerRegistry) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(registry)),
        }
    }

    /// Current registry.
    #[must_use]
    pub fn snapshot(&self) -> Arc<BrokerRegistry> {
        self.inner.load_full()
    }

    /// Replace the whole registry.
    pub fn replace(&self, registry: BrokerRegistry) {
        self.inner.store(Arc::new(registry));
    }
}
