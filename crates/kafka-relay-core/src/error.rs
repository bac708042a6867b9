//! Domain error types for the Kafka relay.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
///
/// All of these are fatal: the relay refuses to start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Two mappings share a broker id.
    #[error("duplicate broker id {0}")]
    DuplicateBrokerId(i32),

    /// Two mappings advertise the same endpoint.
    #[error("advertised endpoint {endpoint} is used by brokers {first} and {second}")]
    DuplicateAdvertisedEndpoint {
        endpoint: String,
        first: i32,
        second: i32,
    },

    /// A reload tried to change which listeners exist.
    #[error("listener set changed on reload: {0}")]
    ListenerSetChanged(String),

    /// One or more validation checks failed.
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

/// Errors that occur while relaying a connection pair.
///
/// None of these escape the pair they happened on.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO error on either leg.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame length or header malformed, or a rewrite-set body did not parse.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to re-encode a rewritten response.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// A response arrived whose correlation id was never requested.
    #[error("unmatched correlation id {correlation_id} in response")]
    UnmatchedCorrelation { correlation_id: i32 },

    /// A discovery response came back at a version the rewriter cannot parse.
    ///
    /// Forwarding it would hand the client real broker addresses.
    #[error("{api} response version {version} cannot be rewritten (supported {min}..={max})")]
    UnsupportedVersion {
        api: &'static str,
        version: i16,
        min: i16,
        max: i16,
    },

    /// A request reused a correlation id that is still in flight.
    #[error("correlation id {correlation_id} is already in flight")]
    DuplicateCorrelation { correlation_id: i32 },

    /// The client exceeded the in-flight request limit.
    #[error("too many in-flight requests (limit {limit})")]
    TooManyInFlight { limit: usize },

    /// The registry has no mapping for the broker this listener serves.
    #[error("broker {broker_id} is not in the registry")]
    UnknownBroker { broker_id: i32 },

    /// Broker is not reachable.
    #[error("broker {broker_id} unavailable: {message}")]
    BrokerUnavailable { broker_id: i32, message: String },

    /// TLS failure on either leg.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration error surfaced at runtime (bind, reload).
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shutdown signal received.
    #[error("relay shutting down")]
    Shutdown,
}

impl ProxyError {
    /// Stable label used for the `faults_total` metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::ProtocolDecode { .. } => "protocol_decode",
            Self::ProtocolEncode { .. } => "protocol_encode",
            Self::UnmatchedCorrelation { .. } => "unmatched_correlation",
            Self::UnsupportedVersion { .. } => "unsupported_version",
            Self::DuplicateCorrelation { .. } => "duplicate_correlation",
            Self::TooManyInFlight { .. } => "too_many_in_flight",
            Self::UnknownBroker { .. } => "unknown_broker",
            Self::BrokerUnavailable { .. } => "broker_unavailable",
            Self::Tls(_) => "tls",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::ProtocolDecode {
            message: message.into(),
        }
    }

    pub(crate) fn encode(message: impl Into<String>) -> Self {
        Self::ProtocolEncode {
            message: message.into(),
        }
    }
}

/// Errors related to TLS setup and handshakes.
#[derive(Error, Debug)]
pub enum TlsError {
    /// TLS configuration is invalid.
    #[error("tls configuration error: {0}")]
    Config(String),

    /// A certificate file could not be read.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// A private key file could not be read.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// The file contained no certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// The file contained no private keys.
    #[error("no private keys found in '{0}'")]
    NoPrivateKeys(String),

    /// The handshake failed.
    #[error("tls handshake failed: {0}")]
    Handshake(String),

    /// Broker certificates are minted per client, but the client presented
    /// none.
    #[error("no client certificate to mirror for the broker connection")]
    MissingClientIdentity,

    /// Minting a broker-leg client certificate failed.
    #[error("failed to mint client certificate: {0}")]
    Mint(String),

    /// The handshake did not complete in time.
    #[error("tls handshake timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_problem() {
        let err = ConfigError::Validation(vec![
            "duplicate broker id 1".to_string(),
            "brokers[2].address: invalid address".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("duplicate broker id 1"));
        assert!(text.contains("brokers[2].address"));
    }

    #[test]
    fn test_proxy_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "test");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Transport(_)));
        assert_eq!(proxy_err.kind(), "transport");
    }

    #[test]
    fn test_proxy_error_from_tls() {
        let proxy_err: ProxyError = TlsError::Handshake("bad cert".to_string()).into();
        assert_eq!(proxy_err.kind(), "tls");
        assert!(proxy_err.to_string().contains("bad cert"));
    }

    #[test]
    fn test_fault_kinds_are_distinct() {
        let kinds = [
            ProxyError::decode("x").kind(),
            ProxyError::UnmatchedCorrelation { correlation_id: 1 }.kind(),
            ProxyError::UnsupportedVersion {
                api: "Metadata",
                version: 99,
                min: 0,
                max: 12,
            }
            .kind(),
            ProxyError::DuplicateCorrelation { correlation_id: 1 }.kind(),
            ProxyError::TooManyInFlight { limit: 1 }.kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
