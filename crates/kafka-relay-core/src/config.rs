//! Configuration types for the Kafka relay.
//!
//! Configuration is loaded from YAML, `${VAR}` references are expanded from
//! the environment, and the result is validated as a whole before the relay
//! starts. Every problem found is reported in one [`ConfigError::Validation`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::broker::registry::{BrokerMapping, BrokerRegistry, Endpoint};
use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Client-facing listener settings.
    #[serde(default)]
    pub listen: ListenConfig,

    /// One entry per broker in the cluster.
    pub brokers: Vec<BrokerMappingConfig>,

    /// Broker ids that get a listener. Empty means all of them.
    ///
    /// Brokers left out are still rewritten in responses, so a fleet of
    /// relays can split the cluster between them.
    #[serde(default)]
    pub proxied_brokers: Vec<i32>,

    /// TLS towards clients. Absent means plaintext.
    #[serde(default)]
    pub client_tls: Option<ClientTlsConfig>,

    /// TLS towards brokers. Absent means plaintext.
    #[serde(default)]
    pub broker_tls: Option<BrokerTlsConfig>,

    /// Relay tunables.
    #[serde(default)]
    pub relay: RelayTuning,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-facing listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Host used for listeners that do not set `bind` explicitly.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Maximum number of concurrent connection pairs across all listeners.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// One broker: its id, where it really is, and what clients are told.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerMappingConfig {
    /// Kafka node id.
    pub broker_id: i32,

    /// Real broker address, e.g. "kafka-1.internal:9092".
    pub address: String,

    /// Address returned to clients, e.g. "proxy.example.com:19092".
    pub advertised: String,

    /// Local socket address for this broker's listener.
    ///
    /// Defaults to `<listen.bind_host>:<advertised port>`.
    #[serde(default)]
    pub bind: Option<String>,
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientTlsConfig {
    /// Server certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Server private key (PEM).
    pub key_path: PathBuf,

    /// CA used to verify client certificates (PEM).
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Reject clients without a certificate signed by `ca_cert_path`.
    #[serde(default)]
    pub require_client_cert: bool,
}

/// TLS configuration for broker connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerTlsConfig {
    /// CA certificate (PEM) for verifying brokers. Defaults to webpki roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Client certificate (PEM) for mTLS to brokers.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Client private key (PEM) for mTLS to brokers.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Check that the broker certificate names the host we dialled.
    ///
    /// The chain is verified either way.
    #[serde(default = "default_true")]
    pub verify_hostname: bool,

    /// Present a certificate minted per client instead of `cert_path`.
    ///
    /// Requires verified client certificates (`client_tls.require_client_cert`).
    #[serde(default)]
    pub client_cert_authority: Option<ClientCertAuthorityConfig>,
}

impl Default for BrokerTlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            cert_path: None,
            key_path: None,
            verify_hostname: true,
            client_cert_authority: None,
        }
    }
}

/// CA that signs broker-leg certificates mirroring each client's certificate.
///
/// Brokers must trust this CA for client authentication.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientCertAuthorityConfig {
    /// CA certificate (PEM).
    pub ca_cert_path: PathBuf,

    /// CA private key (PEM).
    pub ca_key_path: PathBuf,

    /// Distinct client certificates whose minted counterpart is kept.
    #[serde(default = "default_minted_cache_size")]
    pub cache_size: usize,
}

/// Buffer sizes and timeouts for each connection pair.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayTuning {
    /// Read buffer capacity and write backpressure boundary, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Largest frame accepted in either direction.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest number of requests awaiting a response on one pair.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_tls_handshake_timeout_ms")]
    pub tls_handshake_timeout_ms: u64,

    /// Pending requests older than this leave the live correlation table and
    /// are counted as timed out. A response arriving later is still matched
    /// and delivered while the entry is among the most recent
    /// `max_in_flight` expired ones.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long shutdown waits for pairs to finish tearing down.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl RelayTuning {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// A broker mapping with its listener address resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMapping {
    pub mapping: BrokerMapping,
    pub bind: String,
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_max_frame_size() -> usize {
    100 * 1024 * 1024
}

fn default_max_in_flight() -> usize {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_tls_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_minted_cache_size() -> usize {
    1_024
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_frame_size: default_max_frame_size(),
            max_in_flight: default_max_in_flight(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Configuration loading and validation

impl RelayConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(&expand_env_vars(content))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] listing every problem found.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();

        if self.brokers.is_empty() {
            problems.push("at least one broker mapping is required".to_string());
        }

        let mut ids = HashSet::new();
        let mut advertised: HashMap<Endpoint, i32> = HashMap::new();
        let mut binds: HashMap<String, i32> = HashMap::new();

        for (idx, broker) in self.brokers.iter().enumerate() {
            if !ids.insert(broker.broker_id) {
                problems.push(format!("duplicate broker id {}", broker.broker_id));
            }

            if let Err(e) = Endpoint::parse(&broker.address) {
                problems.push(format!("brokers[{idx}].address: {e}"));
            }

            match Endpoint::parse(&broker.advertised) {
                Ok(endpoint) => {
                    if let Some(first) = advertised.insert(endpoint, broker.broker_id) {
                        problems.push(format!(
                            "brokers[{idx}].advertised: {} is already advertised for broker {first}",
                            broker.advertised
                        ));
                    }
                    let bind = self.bind_address(broker);
                    if bind.parse::<SocketAddr>().is_err() {
                        problems.push(format!(
                            "brokers[{idx}].bind: '{bind}' is not a socket address"
                        ));
                    } else if !bind.ends_with(":0") {
                        if let Some(first) = binds.insert(bind.clone(), broker.broker_id) {
                            problems.push(format!(
                                "brokers[{idx}].bind: {bind} is already used by broker {first}"
                            ));
                        }
                    }
                }
                Err(e) => problems.push(format!("brokers[{idx}].advertised: {e}")),
            }
        }

        for id in &self.proxied_brokers {
            if !ids.contains(id) {
                problems.push(format!("proxied_brokers: broker {id} has no mapping"));
            }
        }

        if let Some(tls) = &self.client_tls {
            if tls.require_client_cert && tls.ca_cert_path.is_none() {
                problems.push(
                    "client_tls: ca_cert_path is required when require_client_cert is true"
                        .to_string(),
                );
            }
        }

        if let Some(tls) = &self.broker_tls {
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                problems.push(
                    "broker_tls: cert_path and key_path must be set together".to_string(),
                );
            }
            if let Some(authority) = &tls.client_cert_authority {
                if tls.cert_path.is_some() || tls.key_path.is_some() {
                    problems.push(
                        "broker_tls: client_cert_authority cannot be combined with cert_path/key_path"
                            .to_string(),
                    );
                }
                if !self.client_tls.as_ref().is_some_and(|c| c.require_client_cert) {
                    problems.push(
                        "broker_tls.client_cert_authority requires client_tls.require_client_cert"
                            .to_string(),
                    );
                }
                if authority.cache_size == 0 {
                    problems.push(
                        "broker_tls.client_cert_authority.cache_size must be greater than 0"
                            .to_string(),
                    );
                }
            }
        }

        if self.relay.buffer_size == 0 {
            problems.push("relay.buffer_size must be greater than 0".to_string());
        }
        if self.relay.max_frame_size < 8 {
            problems.push("relay.max_frame_size must be at least 8 bytes".to_string());
        }
        if self.relay.max_in_flight == 0 {
            problems.push("relay.max_in_flight must be greater than 0".to_string());
        }
        if self.relay.request_timeout_ms == 0 {
            problems.push("relay.request_timeout_ms must be greater than 0".to_string());
        }
        if self.listen.max_connections == 0 {
            problems.push("listen.max_connections must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    fn bind_address(&self, broker: &BrokerMappingConfig) -> String {
        match &broker.bind {
            Some(bind) => bind.clone(),
            None => {
                let port = Endpoint::parse(&broker.advertised)
                    .map(|ep| ep.port)
                    .unwrap_or_default();
                if self.listen.bind_host.contains(':') {
                    format!("[{}]:{port}", self.listen.bind_host)
                } else {
                    format!("{}:{port}", self.listen.bind_host)
                }
            }
        }
    }

    /// All broker mappings with listener addresses resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not parse. Cannot happen after
    /// [`validate`](Self::validate) succeeded.
    pub fn resolved_mappings(&self) -> ConfigResult<Vec<ResolvedMapping>> {
        self.brokers
            .iter()
            .map(|broker| {
                Ok(ResolvedMapping {
                    mapping: BrokerMapping::new(
                        broker.broker_id,
                        Endpoint::parse(&broker.address)?,
                        Endpoint::parse(&broker.advertised)?,
                    ),
                    bind: self.bind_address(broker),
                })
            })
            .collect()
    }

    /// Mappings that get a listener on this relay.
    ///
    /// # Errors
    ///
    /// See [`resolved_mappings`](Self::resolved_mappings).
    pub fn proxied_mappings(&self) -> ConfigResult<Vec<ResolvedMapping>> {
        let all = self.resolved_mappings()?;
        if self.proxied_brokers.is_empty() {
            return Ok(all);
        }
        Ok(all
            .into_iter()
            .filter(|m| self.proxied_brokers.contains(&m.mapping.broker_id))
            .collect())
    }

    /// Build the broker registry from every mapping.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate ids or advertised endpoints.
    pub fn build_registry(&self) -> ConfigResult<BrokerRegistry> {
        BrokerRegistry::new(
            self.resolved_mappings()?
                .into_iter()
                .map(|m| m.mapping)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
brokers:
  - broker_id: 1
    address: 'kafka-1.internal:9092'
    advertised: 'proxy.example.com:19092'
  - broker_id: 2
    address: 'kafka-2.internal:9092'
    advertised: 'proxy.example.com:19093'
";

    #[test]
    fn test_from_yaml_string() {
        let config = RelayConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.brokers[0].broker_id, 1);
        assert_eq!(config.brokers[1].advertised, "proxy.example.com:19093");
    }

    #[test]
    fn test_default_values_applied() {
        let config = RelayConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.listen.bind_host, "0.0.0.0");
        assert_eq!(config.listen.max_connections, 10_000);
        assert_eq!(config.relay.buffer_size, 64 * 1024);
        assert_eq!(config.relay.max_frame_size, 100 * 1024 * 1024);
        assert_eq!(config.relay.request_timeout(), Duration::from_secs(30));
        assert!(config.client_tls.is_none());
        assert!(config.broker_tls.is_none());
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.address, "0.0.0.0:9090");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_bind_defaults_to_advertised_port() {
        let config = RelayConfig::from_str(MINIMAL).unwrap();
        let mappings = config.resolved_mappings().unwrap();
        assert_eq!(mappings[0].bind, "0.0.0.0:19092");
        assert_eq!(mappings[1].bind, "0.0.0.0:19093");
        assert_eq!(mappings[0].mapping.real.to_string(), "kafka-1.internal:9092");
    }

    #[test]
    fn test_explicit_bind() {
        let yaml = r"
brokers:
  - broker_id: 1
    address: 'kafka-1:9092'
    advertised: 'proxy:443'
    bind: '127.0.0.1:19092'
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.resolved_mappings().unwrap()[0].bind, "127.0.0.1:19092");
    }

    #[test]
    fn test_validation_aggregates_all_problems() {
        let yaml = r"
brokers:
  - broker_id: 1
    address: 'kafka-1'
    advertised: 'proxy:19092'
  - broker_id: 1
    address: 'kafka-2:9092'
    advertised: 'proxy:19092'
proxied_brokers: [9]
relay:
  buffer_size: 0
";
        let err = RelayConfig::from_str(yaml).unwrap_err();
        let ConfigError::Validation(problems) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(problems.iter().any(|p| p.contains("duplicate broker id 1")));
        assert!(problems.iter().any(|p| p.contains("brokers[0].address")));
        assert!(problems.iter().any(|p| p.contains("already advertised")));
        assert!(problems.iter().any(|p| p.contains("proxied_brokers")));
        assert!(problems.iter().any(|p| p.contains("buffer_size")));
    }

    #[test]
    fn test_empty_broker_list_rejected() {
        let err = RelayConfig::from_str("brokers: []").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_proxied_subset() {
        let yaml = format!("{MINIMAL}proxied_brokers: [2]\n");
        let config = RelayConfig::from_str(&yaml).unwrap();
        let proxied = config.proxied_mappings().unwrap();
        assert_eq!(proxied.len(), 1);
        assert_eq!(proxied[0].mapping.broker_id, 2);
        // Registry still knows every broker.
        assert_eq!(config.build_registry().unwrap().len(), 2);
    }

    #[test]
    fn test_tls_config_parsing() {
        let yaml = r"
brokers:
  - broker_id: 1
    address: 'kafka-1:9093'
    advertised: 'proxy:19093'
client_tls:
  cert_path: '/etc/relay/server.crt'
  key_path: '/etc/relay/server.key'
broker_tls:
  ca_cert_path: '/etc/ssl/ca.crt'
  verify_hostname: false
";
        let config = RelayConfig::from_str(yaml).unwrap();
        let client = config.client_tls.unwrap();
        assert_eq!(client.cert_path, PathBuf::from("/etc/relay/server.crt"));
        assert!(!client.require_client_cert);

        let broker = config.broker_tls.unwrap();
        assert_eq!(broker.ca_cert_path, Some(PathBuf::from("/etc/ssl/ca.crt")));
        assert!(!broker.verify_hostname);
    }

    #[test]
    fn test_broker_tls_verifies_hostname_by_default() {
        let yaml = format!("{MINIMAL}broker_tls: {{}}\n");
        let config = RelayConfig::from_str(&yaml).unwrap();
        assert!(config.broker_tls.unwrap().verify_hostname);
    }

    #[test]
    fn test_mtls_without_ca_rejected() {
        let yaml = format!(
            "{MINIMAL}client_tls:\n  cert_path: a.pem\n  key_path: b.pem\n  require_client_cert: true\n"
        );
        let err = RelayConfig::from_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("ca_cert_path is required"));
    }

    #[test]
    fn test_client_cert_authority_parsing() {
        let yaml = format!(
            "{MINIMAL}client_tls:\n  cert_path: s.pem\n  key_path: s.key\n  ca_cert_path: ca.pem\n  require_client_cert: true\n\
broker_tls:\n  client_cert_authority:\n    ca_cert_path: relay-ca.pem\n    ca_key_path: relay-ca.key\n"
        );
        let config = RelayConfig::from_str(&yaml).unwrap();
        let authority = config.broker_tls.unwrap().client_cert_authority.unwrap();
        assert_eq!(authority.ca_key_path, PathBuf::from("relay-ca.key"));
        assert_eq!(authority.cache_size, 1_024);
    }

    #[test]
    fn test_client_cert_authority_needs_verified_clients_and_no_static_cert() {
        let yaml = format!(
            "{MINIMAL}broker_tls:\n  cert_path: c.pem\n  key_path: c.key\n  client_cert_authority:\n    ca_cert_path: a.pem\n    ca_key_path: a.key\n"
        );
        let err = RelayConfig::from_str(&yaml).unwrap_err();
        let ConfigError::Validation(problems) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(problems.iter().any(|p| p.contains("cannot be combined")));
        assert!(problems.iter().any(|p| p.contains("require_client_cert")));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_RELAY_BROKER_HOST", "kafka-9.internal");

        let yaml = r"
brokers:
  - broker_id: 9
    address: '${TEST_RELAY_BROKER_HOST}:9092'
    advertised: 'proxy:19092'
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.brokers[0].address, "kafka-9.internal:9092");

        std::env::remove_var("TEST_RELAY_BROKER_HOST");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        assert_eq!(expand_env_vars("${NONEXISTENT_RELAY_VAR}x"), "x");
        assert_eq!(expand_env_vars("literal"), "literal");
    }
}
