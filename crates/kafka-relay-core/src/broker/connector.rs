//! Opens the broker leg of a connection pair.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{BrokerTlsConfig, RelayTuning};
use crate::error::{ProxyError, Result, TlsError, TlsResult};
use crate::metrics::prometheus::side;
use crate::metrics::ProxyMetrics;
use crate::network::stream::{BrokerStream, Leg};
use crate::tls::TlsConnector;

use super::registry::Endpoint;

/// Dials real broker endpoints, optionally over TLS.
///
/// One connector is shared by every pair; it holds no per-broker state.
#[derive(Clone)]
pub struct BrokerConnector {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl BrokerConnector {
    /// Build a connector.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker TLS material cannot be loaded.
    pub fn new(
        tls: Option<&BrokerTlsConfig>,
        tuning: &RelayTuning,
        metrics: Arc<ProxyMetrics>,
    ) -> TlsResult<Self> {
        Ok(Self {
            tls: tls.map(TlsConnector::new).transpose()?,
            connect_timeout: tuning.connect_timeout(),
            handshake_timeout: tuning.tls_handshake_timeout(),
            metrics,
        })
    }

    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to `endpoint`, the real address of `broker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::BrokerUnavailable`] if the TCP connect fails or
    /// times out, and [`ProxyError::Tls`] if the handshake fails. Handshake
    /// failures are counted under `side="broker"`.
    ///
    /// `client_identity` is the certificate the client presented; it is
    /// required when broker certificates are minted per client.
    pub async fn connect(
        &self,
        broker_id: i32,
        endpoint: &Endpoint,
        client_identity: Option<&CertificateDer<'_>>,
    ) -> Result<BrokerStream> {
        let address = endpoint.to_string();
        let unavailable = |message: String| ProxyError::BrokerUnavailable { broker_id, message };

        let tcp = timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                unavailable(format!(
                    "connect to {address} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| unavailable(format!("connect to {address} failed: {e}")))?;
        tcp.set_nodelay(true)?;

        let Some(tls) = &self.tls else {
            debug!(broker_id, %address, "connected to broker");
            return Ok(Leg::Plain(tcp));
        };

        let handshake = match timeout(
            self.handshake_timeout,
            tls.connect(&endpoint.host, tcp, client_identity),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TlsError::Timeout(self.handshake_timeout)),
        };

        match handshake {
            Ok(stream) => {
                debug!(broker_id, %address, "connected to broker over TLS");
                Ok(Leg::Tls(stream))
            }
            // Never reached the broker.
            Err(e @ (TlsError::MissingClientIdentity | TlsError::Mint(_))) => {
                warn!(broker_id, %address, error = %e, "no broker client certificate for this client");
                Err(e.into())
            }
            Err(e) => {
                self.metrics.record_tls_failure(side::BROKER);
                warn!(broker_id, %address, error = %e, "broker TLS handshake failed");
                Err(e.into())
            }
        }
    }
}
