//! TLS connector for broker-facing legs.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{WantsClientCert, WebPkiServerVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::config::BrokerTlsConfig;
use crate::error::{TlsError, TlsResult};

use super::authority::ClientCertAuthority;
use super::pem::{ensure_crypto_provider, load_certificates, load_private_key, load_root_store};

/// Opens TLS sessions to brokers.
#[derive(Clone)]
pub struct TlsConnector {
    identity: Identity,
}

/// What the relay presents to brokers as its client certificate.
#[derive(Clone)]
enum Identity {
    /// One configuration for every pair: no certificate, or a fixed one.
    Shared(tokio_rustls::TlsConnector),
    /// A certificate minted per client, mirroring the client's own.
    Mirrored(Arc<ClientCertAuthority>),
}

impl TlsConnector {
    /// Build a connector from the `broker_tls` section.
    ///
    /// Without a CA bundle the Mozilla roots from `webpki-roots` are trusted.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured PEM file cannot be loaded.
    pub fn new(config: &BrokerTlsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let trust = BrokerTrust::load(config)?;

        let identity = match &config.client_cert_authority {
            Some(authority) => {
                debug!(
                    ca_cert_path = %authority.ca_cert_path.display(),
                    "minting broker client certificates per client"
                );
                Identity::Mirrored(Arc::new(ClientCertAuthority::load(authority, trust)?))
            }
            None => {
                let client_config = shared_client_config(config, &trust)?;
                Identity::Shared(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
            }
        };
        Ok(Self { identity })
    }

    /// Whether the client's certificate is needed to connect.
    #[must_use]
    pub fn mirrors_client(&self) -> bool {
        matches!(self.identity, Identity::Mirrored(_))
    }

    /// Handshake with `server_name` as SNI.
    ///
    /// `client_identity` is the leaf certificate the client presented to the
    /// relay; it is required when certificates are minted per client.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::MissingClientIdentity`] if a minted certificate is
    /// needed but the client presented none, and [`TlsError::Handshake`] if
    /// the broker rejects the session.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
        client_identity: Option<&CertificateDer<'_>>,
    ) -> TlsResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name {server_name:?}: {e}")))?;

        let connector = match &self.identity {
            Identity::Shared(connector) => connector.clone(),
            Identity::Mirrored(authority) => {
                let client_cert = client_identity.ok_or(TlsError::MissingClientIdentity)?;
                authority.connector_for(client_cert)?
            }
        };

        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// How broker certificates are verified.
#[derive(Clone)]
pub(crate) struct BrokerTrust {
    roots: Arc<RootCertStore>,
    verify_hostname: bool,
}

impl BrokerTrust {
    pub(crate) fn load(config: &BrokerTlsConfig) -> TlsResult<Self> {
        let roots = match &config.ca_cert_path {
            Some(ca_path) => load_root_store(ca_path)?,
            None => {
                debug!("trusting webpki root certificates for brokers");
                RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                }
            }
        };
        if !config.verify_hostname {
            warn!("broker certificate hostname verification is disabled");
        }
        Ok(Self {
            roots: Arc::new(roots),
            verify_hostname: config.verify_hostname,
        })
    }

    /// A client configuration builder with server verification in place.
    pub(crate) fn builder(&self) -> TlsResult<ConfigBuilder<ClientConfig, WantsClientCert>> {
        if self.verify_hostname {
            return Ok(ClientConfig::builder().with_root_certificates(Arc::clone(&self.roots)));
        }
        let verifier = IgnoreHostname::new(Arc::clone(&self.roots))?;
        Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier)))
    }
}

fn shared_client_config(config: &BrokerTlsConfig, trust: &BrokerTrust) -> TlsResult<ClientConfig> {
    let builder = trust.builder()?;
    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            debug!(cert_path = %cert_path.display(), "presenting client certificate to brokers");
            builder
                .with_client_auth_cert(load_certificates(cert_path)?, load_private_key(key_path)?)
                .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Full chain verification that tolerates a certificate issued for another
/// name. Used when brokers are reached by an address their certificates do
/// not list.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl IgnoreHostname {
    fn new(roots: Arc<RootCertStore>) -> TlsResult<Self> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| TlsError::Config(format!("failed to build server verifier: {e}")))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_uses_webpki_roots() {
        let connector = TlsConnector::new(&BrokerTlsConfig::default()).unwrap();
        assert!(!connector.mirrors_client());
    }

    #[test]
    fn test_custom_ca_with_and_without_hostname_check() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let ca = write(&generated.cert.pem());

        let mut config = BrokerTlsConfig {
            ca_cert_path: Some(ca.path().to_path_buf()),
            ..Default::default()
        };
        assert!(TlsConnector::new(&config).is_ok());

        config.verify_hostname = false;
        assert!(TlsConnector::new(&config).is_ok());
    }

    #[test]
    fn test_client_certificate() {
        let generated = rcgen::generate_simple_self_signed(vec!["relay".to_string()]).unwrap();
        let cert = write(&generated.cert.pem());
        let key = write(&generated.key_pair.serialize_pem());

        let config = BrokerTlsConfig {
            cert_path: Some(cert.path().to_path_buf()),
            key_path: Some(key.path().to_path_buf()),
            ..Default::default()
        };
        assert!(TlsConnector::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_mirrored_identity_requires_client_certificate() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = params.self_signed(&key_pair).unwrap();
        let ca_cert = write(&ca.pem());
        let ca_key = write(&key_pair.serialize_pem());

        let config = BrokerTlsConfig {
            client_cert_authority: Some(crate::config::ClientCertAuthorityConfig {
                ca_cert_path: ca_cert.path().to_path_buf(),
                ca_key_path: ca_key.path().to_path_buf(),
                cache_size: 4,
            }),
            ..Default::default()
        };
        let connector = TlsConnector::new(&config).unwrap();
        assert!(connector.mirrors_client());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let result = connector.connect("localhost", tcp, None).await;
        assert!(matches!(result, Err(TlsError::MissingClientIdentity)));
    }

    #[test]
    fn test_missing_ca_file() {
        let config = BrokerTlsConfig {
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            TlsConnector::new(&config),
            Err(TlsError::CertificateLoad { .. })
        ));
    }
}
